//! Authentication provider webhooks.
//!
//! Deliveries are signed the Svix way:
//!
//! - `svix-id`: message identifier, also the idempotency key
//! - `svix-timestamp`: unix seconds at signing time
//! - `svix-signature`: space-separated `v1,<base64 digest>` entries
//!
//! The signed content is `{svix-id}.{svix-timestamp}.{raw body}`. The
//! `webhook-*` header names are accepted as aliases.
//!
//! The body is a JSON envelope `{"type": ..., "data": {...}, "timestamp": ms}`.

use super::{
    signature::{self, SigningSecret},
    str_field, DeletedUserPayload, EventKind, UserPayload, VerificationError, WebhookEvent,
    WebhookProvider, WebhookRequest,
};
use crate::{EventId, ProviderKind, Timestamp};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const ID_HEADERS: [&str; 2] = ["svix-id", "webhook-id"];
const TIMESTAMP_HEADERS: [&str; 2] = ["svix-timestamp", "webhook-timestamp"];
const SIGNATURE_HEADERS: [&str; 2] = ["svix-signature", "webhook-signature"];

const SIGNATURE_VERSION: &str = "v1";

/// Webhook provider for the authentication platform
#[derive(Debug, Clone)]
pub struct AuthWebhookProvider {
    secret: SigningSecret,
    tolerance: Duration,
}

impl AuthWebhookProvider {
    /// Canonical provider name used in routes, logs and metrics
    pub const PROVIDER_ID: &'static str = "auth";

    /// Create a provider verifying with `secret` and accepting timestamps
    /// within `tolerance` of local time.
    pub fn new(secret: SigningSecret, tolerance: Duration) -> Self {
        Self { secret, tolerance }
    }

    /// Produce the `svix-signature` header value for a delivery.
    ///
    /// Used to replay captured payloads locally and in tests.
    pub fn sign(&self, message_id: &str, timestamp: i64, body: &[u8]) -> String {
        let timestamp = timestamp.to_string();
        let digest = self.secret.digest(&[
            message_id.as_bytes(),
            b".",
            timestamp.as_bytes(),
            b".",
            body,
        ]);
        format!("{},{}", SIGNATURE_VERSION, STANDARD.encode(digest))
    }

    fn first_header<'a>(request: &'a WebhookRequest, names: &[&str]) -> Option<&'a str> {
        names
            .iter()
            .find_map(|name| request.header(name))
            .filter(|v| !v.is_empty())
    }

    fn required_header<'a>(
        request: &'a WebhookRequest,
        names: &[&str],
    ) -> Result<&'a str, VerificationError> {
        Self::first_header(request, names).ok_or_else(|| VerificationError::InvalidSignature {
            reason: format!("missing {} header", names[0]),
        })
    }

    /// Decoded `v1` digests from the signature header; other versions are ignored
    fn candidate_digests(header: &str) -> Vec<Vec<u8>> {
        header
            .split_whitespace()
            .filter_map(|entry| entry.split_once(','))
            .filter(|(version, _)| *version == SIGNATURE_VERSION)
            .filter_map(|(_, encoded)| STANDARD.decode(encoded).ok())
            .collect()
    }
}

impl WebhookProvider for AuthWebhookProvider {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Auth
    }

    #[instrument(skip(self, request), fields(provider = Self::PROVIDER_ID))]
    fn verify(&self, request: &WebhookRequest, now: Timestamp) -> Result<(), VerificationError> {
        let message_id = Self::required_header(request, &ID_HEADERS)?;
        let timestamp = Self::required_header(request, &TIMESTAMP_HEADERS)?;
        let signature_header = Self::required_header(request, &SIGNATURE_HEADERS)?;

        let digests = Self::candidate_digests(signature_header);
        if digests.is_empty() {
            warn!(message_id, "Signature header carries no v1 signature");
            return Err(VerificationError::InvalidSignature {
                reason: "no v1 signature present".to_string(),
            });
        }

        let parts: [&[u8]; 5] = [
            message_id.as_bytes(),
            b".",
            timestamp.as_bytes(),
            b".",
            &request.body,
        ];
        if !digests.iter().any(|d| self.secret.verify(&parts, d)) {
            warn!(message_id, "Signature mismatch");
            return Err(VerificationError::InvalidSignature {
                reason: "signature does not match payload".to_string(),
            });
        }

        let signed_at = signature::parse_unix_seconds(timestamp)?;
        signature::check_freshness(signed_at, now, self.tolerance)?;

        debug!(message_id, "Webhook signature verified");
        Ok(())
    }

    #[instrument(skip(self, request), fields(provider = Self::PROVIDER_ID))]
    fn classify(&self, request: &WebhookRequest) -> Result<WebhookEvent, VerificationError> {
        let message_id =
            Self::first_header(request, &ID_HEADERS).ok_or_else(|| malformed("missing message id"))?;
        let event_id = EventId::new(message_id).map_err(|e| malformed(&e.to_string()))?;

        let envelope: Value = serde_json::from_slice(&request.body)?;
        let event_type = envelope
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing 'type'"))?
            .to_string();
        let data = envelope
            .get("data")
            .filter(|d| d.is_object())
            .ok_or_else(|| malformed("missing 'data' object"))?;

        let signed_at = Self::first_header(request, &TIMESTAMP_HEADERS)
            .and_then(|ts| signature::parse_unix_seconds(ts).ok());

        // Payload timestamp is in milliseconds; it orders profile updates.
        let version = envelope
            .get("timestamp")
            .and_then(Value::as_i64)
            .or_else(|| signed_at.map(|ts| ts.unix_seconds() * 1_000));

        let occurred_at = version
            .and_then(|ms| Timestamp::from_unix_millis(ms).ok())
            .or(signed_at)
            .unwrap_or(request.received_at);

        let kind = match event_type.as_str() {
            "user.created" => EventKind::UserCreated(extract_user(data)),
            "user.updated" => EventKind::UserUpdated(extract_user(data)),
            "user.deleted" => EventKind::UserDeleted(DeletedUserPayload {
                auth_id: str_field(data, "id"),
            }),
            other => {
                debug!(event_type = other, "Event type outside handled vocabulary");
                EventKind::Unhandled
            }
        };

        Ok(WebhookEvent {
            event_id,
            provider: ProviderKind::Auth,
            event_type,
            occurred_at,
            version,
            kind,
        })
    }
}

fn malformed(message: &str) -> VerificationError {
    VerificationError::MalformedPayload {
        message: message.to_string(),
    }
}

fn extract_user(data: &Value) -> UserPayload {
    let first_name = str_field(data, "first_name");
    let last_name = str_field(data, "last_name");
    let full_name = {
        let joined = format!(
            "{} {}",
            first_name.as_deref().unwrap_or_default(),
            last_name.as_deref().unwrap_or_default()
        );
        let trimmed = joined.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };

    UserPayload {
        auth_id: str_field(data, "id"),
        email: primary_email(data),
        username: str_field(data, "username"),
        first_name,
        last_name,
        full_name,
        phone: primary_phone(data),
    }
}

/// Address referenced by `primary_email_address_id`, else the first one listed
fn primary_email(data: &Value) -> Option<String> {
    let addresses = data.get("email_addresses")?.as_array()?;
    let primary_id = data.get("primary_email_address_id").and_then(Value::as_str);

    primary_id
        .and_then(|id| {
            addresses
                .iter()
                .find(|a| a.get("id").and_then(Value::as_str) == Some(id))
        })
        .or_else(|| addresses.first())
        .and_then(|a| str_field(a, "email_address"))
}

/// Number referenced by `primary_phone_number_id`, else the first verified one
fn primary_phone(data: &Value) -> Option<String> {
    let numbers = data.get("phone_numbers")?.as_array()?;
    let primary_id = data.get("primary_phone_number_id").and_then(Value::as_str);

    primary_id
        .and_then(|id| {
            numbers
                .iter()
                .find(|n| n.get("id").and_then(Value::as_str) == Some(id))
        })
        .or_else(|| {
            numbers.iter().find(|n| {
                n.get("verification")
                    .and_then(|v| v.get("status"))
                    .and_then(Value::as_str)
                    == Some("verified")
            })
        })
        .and_then(|n| str_field(n, "phone_number"))
}

#[cfg(test)]
#[path = "auth_provider_tests.rs"]
mod tests;
