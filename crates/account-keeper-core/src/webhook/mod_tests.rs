//! Tests for webhook module types.

use super::*;

#[test]
fn test_request_header_lookup_is_case_insensitive() {
    let mut headers = HashMap::new();
    headers.insert("Stripe-Signature".to_string(), "t=1,v1=ab".to_string());

    let request = WebhookRequest::new(headers, Bytes::from_static(b"{}"));

    assert_eq!(request.header("stripe-signature"), Some("t=1,v1=ab"));
    assert_eq!(request.header("STRIPE-SIGNATURE"), Some("t=1,v1=ab"));
    assert_eq!(request.header("svix-id"), None);
}

#[test]
fn test_verification_errors_are_never_transient() {
    let errors = [
        VerificationError::InvalidSignature {
            reason: "x".to_string(),
        },
        VerificationError::StaleEvent {
            skew_seconds: 900,
            tolerance_seconds: 300,
        },
        VerificationError::MalformedPayload {
            message: "x".to_string(),
        },
    ];

    for error in errors {
        assert!(!error.is_transient(), "{error} must not be retried");
    }
}

#[test]
fn test_invalid_signature_is_security_category() {
    let error = VerificationError::InvalidSignature {
        reason: "mismatch".to_string(),
    };
    assert_eq!(error.error_category(), crate::ErrorCategory::Security);
    assert_eq!(error.kind(), "invalid_signature");
}

#[test]
fn test_json_error_converts_to_malformed_payload() {
    let err = serde_json::from_slice::<serde_json::Value>(b"{not json").unwrap_err();
    let converted = VerificationError::from(err);
    assert!(matches!(
        converted,
        VerificationError::MalformedPayload { .. }
    ));
}

#[test]
fn test_event_kind_names_are_distinct() {
    let kinds = [
        EventKind::UserCreated(UserPayload::default()),
        EventKind::UserUpdated(UserPayload::default()),
        EventKind::UserDeleted(DeletedUserPayload::default()),
        EventKind::CustomerCreated(CustomerPayload::default()),
        EventKind::CustomerUpdated(CustomerPayload::default()),
        EventKind::SubscriptionCreated(SubscriptionPayload::default()),
        EventKind::SubscriptionUpdated(SubscriptionPayload::default()),
        EventKind::SubscriptionDeleted(SubscriptionPayload::default()),
        EventKind::CheckoutSessionCompleted(CheckoutPayload::default()),
        EventKind::Unhandled,
    ];

    let names: std::collections::HashSet<_> = kinds.iter().map(EventKind::name).collect();
    assert_eq!(names.len(), kinds.len());
}
