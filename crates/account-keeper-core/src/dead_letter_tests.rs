//! Tests for dead-letter records.

use super::*;

#[test]
fn test_record_id_defaults_to_event_id() {
    let record = DeadLetterRecord::new(
        ProviderKind::Billing,
        Some("evt_1".to_string()),
        Some("customer.created".to_string()),
        "unknown_user",
        "no account",
        false,
        b"{}",
    );

    assert_eq!(record.record_id, "evt_1");
    assert!(record.to_relative_path().ends_with("/billing-evt_1.json"));
}

#[test]
fn test_record_without_event_id_gets_unique_id() {
    let a = DeadLetterRecord::new(ProviderKind::Auth, None, None, "malformed_payload", "x", false, b"");
    let b = DeadLetterRecord::new(ProviderKind::Auth, None, None, "malformed_payload", "x", false, b"");
    assert_ne!(a.record_id, b.record_id);
}

#[test]
fn test_path_is_partitioned_by_day() {
    let mut record = DeadLetterRecord::new(
        ProviderKind::Auth,
        Some("msg/../1".to_string()),
        None,
        "invalid_signature",
        "mismatch",
        false,
        b"body",
    );
    record.recorded_at = Timestamp::from_rfc3339("2024-03-07T10:00:00Z").unwrap();

    assert_eq!(
        record.to_relative_path(),
        "dead-letters/year=2024/month=03/day=07/auth-msg____1.json"
    );
}

#[test]
fn test_payload_is_lossy_utf8() {
    let record = DeadLetterRecord::new(
        ProviderKind::Auth,
        None,
        None,
        "malformed_payload",
        "x",
        false,
        &[0x61, 0xff, 0x62],
    );
    assert_eq!(record.payload, "a\u{fffd}b");
}
