//! Billing provider webhooks.
//!
//! Deliveries carry a `Stripe-Signature: t=<unix seconds>,v1=<hex digest>`
//! header. Several `v1` entries may be present during secret rotation; any
//! match is accepted. The signed content is `{t}.{raw body}`.
//!
//! The body is an event envelope `{"id": "evt_...", "type": ..., "created": s,
//! "data": {"object": {...}}}`.

use super::{
    signature::{self, SigningSecret},
    str_field, CheckoutPayload, CustomerPayload, EventKind, SubscriptionPayload,
    VerificationError, WebhookEvent, WebhookProvider, WebhookRequest,
};
use crate::{EventId, ProviderKind, Timestamp};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Webhook provider for the billing platform
#[derive(Debug, Clone)]
pub struct BillingWebhookProvider {
    secret: SigningSecret,
    tolerance: Duration,
}

/// Parsed `Stripe-Signature` header
#[derive(Debug, Default)]
struct SignatureHeader<'a> {
    timestamp: Option<&'a str>,
    signatures: Vec<Vec<u8>>,
}

impl<'a> SignatureHeader<'a> {
    fn parse(header: &'a str) -> Self {
        let mut parsed = Self::default();
        for (key, value) in header.split(',').filter_map(|kv| kv.trim().split_once('=')) {
            match key {
                "t" => parsed.timestamp = Some(value),
                "v1" => {
                    if let Ok(bytes) = hex::decode(value) {
                        parsed.signatures.push(bytes);
                    }
                }
                _ => {}
            }
        }
        parsed
    }
}

impl BillingWebhookProvider {
    /// Canonical provider name used in routes, logs and metrics
    pub const PROVIDER_ID: &'static str = "billing";

    pub fn new(secret: SigningSecret, tolerance: Duration) -> Self {
        Self { secret, tolerance }
    }

    /// Produce a `Stripe-Signature` header value for `body` signed at `timestamp`
    pub fn sign(&self, timestamp: i64, body: &[u8]) -> String {
        let timestamp = timestamp.to_string();
        let digest = self.secret.digest(&[timestamp.as_bytes(), b".", body]);
        format!("t={},v1={}", timestamp, hex::encode(digest))
    }
}

impl WebhookProvider for BillingWebhookProvider {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Billing
    }

    #[instrument(skip(self, request), fields(provider = Self::PROVIDER_ID))]
    fn verify(&self, request: &WebhookRequest, now: Timestamp) -> Result<(), VerificationError> {
        let header = request
            .header(SIGNATURE_HEADER)
            .ok_or_else(|| VerificationError::InvalidSignature {
                reason: "missing Stripe-Signature header".to_string(),
            })?;

        let parsed = SignatureHeader::parse(header);
        let timestamp = parsed
            .timestamp
            .ok_or_else(|| VerificationError::InvalidSignature {
                reason: "signature header has no timestamp".to_string(),
            })?;
        if parsed.signatures.is_empty() {
            return Err(VerificationError::InvalidSignature {
                reason: "signature header has no v1 signature".to_string(),
            });
        }

        let parts: [&[u8]; 3] = [timestamp.as_bytes(), b".", &request.body];
        if !parsed
            .signatures
            .iter()
            .any(|expected| self.secret.verify(&parts, expected))
        {
            warn!("Signature mismatch");
            return Err(VerificationError::InvalidSignature {
                reason: "signature does not match payload".to_string(),
            });
        }

        let signed_at = signature::parse_unix_seconds(timestamp)?;
        signature::check_freshness(signed_at, now, self.tolerance)?;

        debug!("Webhook signature verified");
        Ok(())
    }

    #[instrument(skip(self, request), fields(provider = Self::PROVIDER_ID))]
    fn classify(&self, request: &WebhookRequest) -> Result<WebhookEvent, VerificationError> {
        let envelope: Value = serde_json::from_slice(&request.body)?;

        let id = envelope
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing 'id'"))?;
        let event_id = EventId::new(id).map_err(|e| malformed(&e.to_string()))?;
        let event_type = envelope
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing 'type'"))?
            .to_string();
        let object = envelope
            .get("data")
            .and_then(|d| d.get("object"))
            .filter(|o| o.is_object())
            .ok_or_else(|| malformed("missing 'data.object'"))?;

        let signed_at = request
            .header(SIGNATURE_HEADER)
            .and_then(|h| SignatureHeader::parse(h).timestamp)
            .and_then(|t| t.trim().parse::<i64>().ok());
        let version = envelope.get("created").and_then(Value::as_i64).or(signed_at);
        let occurred_at = version
            .and_then(|s| Timestamp::from_unix_seconds(s).ok())
            .unwrap_or(request.received_at);

        let kind = match event_type.as_str() {
            "customer.created" => EventKind::CustomerCreated(extract_customer(object)),
            "customer.updated" => EventKind::CustomerUpdated(extract_customer(object)),
            "customer.subscription.created" => {
                EventKind::SubscriptionCreated(extract_subscription(object))
            }
            "customer.subscription.updated" => {
                EventKind::SubscriptionUpdated(extract_subscription(object))
            }
            "customer.subscription.deleted" => {
                EventKind::SubscriptionDeleted(extract_subscription(object))
            }
            "checkout.session.completed" => {
                EventKind::CheckoutSessionCompleted(extract_checkout(object))
            }
            other => {
                debug!(event_type = other, "Event type outside handled vocabulary");
                EventKind::Unhandled
            }
        };

        Ok(WebhookEvent {
            event_id,
            provider: ProviderKind::Billing,
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

/// `customer` is either an id string or an expanded object
fn customer_ref(object: &Value) -> Option<String> {
    match object.get("customer")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        expanded @ Value::Object(_) => str_field(expanded, "id"),
        _ => None,
    }
}

fn extract_customer(object: &Value) -> CustomerPayload {
    CustomerPayload {
        customer_id: str_field(object, "id"),
        email: str_field(object, "email"),
    }
}

fn extract_subscription(object: &Value) -> SubscriptionPayload {
    let plan_id = object
        .get("plan")
        .and_then(|p| str_field(p, "id"))
        .or_else(|| {
            object
                .get("items")
                .and_then(|i| i.get("data"))
                .and_then(|d| d.get(0))
                .and_then(|item| item.get("price"))
                .and_then(|p| str_field(p, "id"))
        });

    SubscriptionPayload {
        subscription_id: str_field(object, "id"),
        customer_id: customer_ref(object),
        status: str_field(object, "status"),
        plan_id,
    }
}

fn extract_checkout(object: &Value) -> CheckoutPayload {
    let email = object
        .get("customer_details")
        .and_then(|d| str_field(d, "email"))
        .or_else(|| str_field(object, "customer_email"));

    CheckoutPayload {
        session_id: str_field(object, "id"),
        customer_id: customer_ref(object),
        email,
    }
}

#[cfg(test)]
#[path = "billing_provider_tests.rs"]
mod tests;
