//! Tests for the account-keeper-core library module.

use super::*;

#[test]
fn test_event_id_validation() {
    assert!(EventId::new("evt_1NQx").is_ok());
    assert!(matches!(
        EventId::new(""),
        Err(ValidationError::Required { .. })
    ));
    assert!(matches!(
        EventId::new("evt with space"),
        Err(ValidationError::InvalidCharacters { .. })
    ));
    assert!(matches!(
        EventId::new("e".repeat(256)),
        Err(ValidationError::TooLong { .. })
    ));
}

#[test]
fn test_email_is_normalized_to_lowercase() {
    let email = EmailAddress::new("  Ada.Lovelace@Example.COM ").unwrap();
    assert_eq!(email.as_str(), "ada.lovelace@example.com");
    assert_eq!(email, EmailAddress::new("ada.lovelace@example.com").unwrap());
}

#[test]
fn test_email_rejects_malformed_values() {
    for bad in ["", "no-at-sign", "@example.com", "ada@", "a@b@c", "a b@c.d"] {
        assert!(EmailAddress::new(bad).is_err(), "expected '{bad}' to be rejected");
    }
}

#[test]
fn test_provider_kind_round_trips_through_str() {
    assert_eq!("auth".parse::<ProviderKind>().unwrap(), ProviderKind::Auth);
    assert_eq!(
        "billing".parse::<ProviderKind>().unwrap(),
        ProviderKind::Billing
    );
    assert!("github".parse::<ProviderKind>().is_err());
}

#[test]
fn test_timestamp_abs_diff_is_symmetric() {
    let a = Timestamp::from_unix_seconds(1_700_000_000).unwrap();
    let b = a.add_seconds(90);

    assert_eq!(a.abs_diff(b), Duration::from_secs(90));
    assert_eq!(b.abs_diff(a), Duration::from_secs(90));
}

#[test]
fn test_timestamp_from_unix_millis_keeps_precision() {
    let ts = Timestamp::from_unix_millis(1_700_000_000_123).unwrap();
    assert_eq!(ts.unix_seconds(), 1_700_000_000);
    assert_eq!(ts.as_datetime().timestamp_subsec_millis(), 123);
}
