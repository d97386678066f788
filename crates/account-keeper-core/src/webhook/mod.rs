//! # Webhook Ingestion Module
//!
//! Verifies and classifies webhooks from the authentication provider and the
//! billing provider.
//!
//! Each provider implements [`WebhookProvider`]: `verify` authenticates the raw
//! request (HMAC signature plus replay window) and `classify` parses the body
//! into a typed [`WebhookEvent`]. Neither step touches the store; a request
//! that fails here never reaches the reconciler.

use crate::{EventId, ProviderKind, Timestamp};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod auth_provider;
pub mod billing_provider;
pub mod signature;

pub use auth_provider::AuthWebhookProvider;
pub use billing_provider::BillingWebhookProvider;
pub use signature::SigningSecret;

// ============================================================================
// Core Types
// ============================================================================

/// Raw HTTP request data for a webhook delivery
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Header map with lowercase names
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub received_at: Timestamp,
}

impl WebhookRequest {
    /// Create new webhook request received now.
    ///
    /// Header names are lowercased so lookups are case-insensitive.
    pub fn new(headers: HashMap<String, String>, body: Bytes) -> Self {
        Self {
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect(),
            body,
            received_at: Timestamp::now(),
        }
    }

    /// Override the receive time used for replay-window checks
    pub fn with_received_at(mut self, received_at: Timestamp) -> Self {
        self.received_at = received_at;
        self
    }

    /// Look up a header by (case-insensitive) name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// A verified, classified webhook event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Provider-assigned identifier; the idempotency key
    pub event_id: EventId,
    pub provider: ProviderKind,

    /// Event type exactly as the provider named it
    pub event_type: String,
    pub occurred_at: Timestamp,

    /// Provider-reported ordering value used for last-writer-wins
    pub version: Option<i64>,
    pub kind: EventKind,
}

/// Typed event vocabulary across both providers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    UserCreated(UserPayload),
    UserUpdated(UserPayload),
    UserDeleted(DeletedUserPayload),
    CustomerCreated(CustomerPayload),
    CustomerUpdated(CustomerPayload),
    SubscriptionCreated(SubscriptionPayload),
    SubscriptionUpdated(SubscriptionPayload),
    SubscriptionDeleted(SubscriptionPayload),
    CheckoutSessionCompleted(CheckoutPayload),

    /// Recognized envelope, event type outside this service's vocabulary
    Unhandled,
}

impl EventKind {
    /// Stable name for logging and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserCreated(_) => "user_created",
            Self::UserUpdated(_) => "user_updated",
            Self::UserDeleted(_) => "user_deleted",
            Self::CustomerCreated(_) => "customer_created",
            Self::CustomerUpdated(_) => "customer_updated",
            Self::SubscriptionCreated(_) => "subscription_created",
            Self::SubscriptionUpdated(_) => "subscription_updated",
            Self::SubscriptionDeleted(_) => "subscription_deleted",
            Self::CheckoutSessionCompleted(_) => "checkout_session_completed",
            Self::Unhandled => "unhandled",
        }
    }
}

// ============================================================================
// Event Payloads
// ============================================================================
//
// Payload fields are optional on purpose: a recognized event with a missing
// field is a schema violation decided by the reconciler, not a parse failure.

/// User profile as carried by `user.created` / `user.updated`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPayload {
    pub auth_id: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: Option<String>,
    pub phone: Option<String>,
}

/// `user.deleted` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedUserPayload {
    pub auth_id: Option<String>,
}

/// `customer.created` / `customer.updated` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerPayload {
    pub customer_id: Option<String>,
    pub email: Option<String>,
}

/// `customer.subscription.*` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub status: Option<String>,
    pub plan_id: Option<String>,
}

/// `checkout.session.completed` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutPayload {
    pub session_id: Option<String>,
    pub customer_id: Option<String>,
    pub email: Option<String>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Verification-layer failures. None are retryable; all map to HTTP 4xx.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("Invalid signature: {reason}")]
    InvalidSignature { reason: String },

    #[error("Stale event: timestamp is {skew_seconds}s from now, tolerance is {tolerance_seconds}s")]
    StaleEvent {
        skew_seconds: u64,
        tolerance_seconds: u64,
    },

    #[error("Malformed payload: {message}")]
    MalformedPayload { message: String },
}

impl VerificationError {
    /// Verification failures are never transient
    pub fn is_transient(&self) -> bool {
        false
    }

    /// Get error category for monitoring
    pub fn error_category(&self) -> crate::ErrorCategory {
        match self {
            Self::InvalidSignature { .. } => crate::ErrorCategory::Security,
            Self::StaleEvent { .. } => crate::ErrorCategory::Security,
            Self::MalformedPayload { .. } => crate::ErrorCategory::Permanent,
        }
    }

    /// Short machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSignature { .. } => "invalid_signature",
            Self::StaleEvent { .. } => "stale_event",
            Self::MalformedPayload { .. } => "malformed_payload",
        }
    }
}

impl From<serde_json::Error> for VerificationError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedPayload {
            message: format!("body is not valid JSON: {}", e),
        }
    }
}

// ============================================================================
// Core Operations (Traits)
// ============================================================================

/// Common `{verify, classify}` capability of every webhook provider
pub trait WebhookProvider: Send + Sync {
    /// Which platform this provider represents
    fn provider(&self) -> ProviderKind;

    /// Authenticate the raw request at time `now`.
    ///
    /// # Errors
    ///
    /// - [`VerificationError::InvalidSignature`] for a missing, garbled or
    ///   mismatching signature
    /// - [`VerificationError::StaleEvent`] when the signed timestamp is outside
    ///   the configured tolerance
    fn verify(&self, request: &WebhookRequest, now: Timestamp) -> Result<(), VerificationError>;

    /// Parse an authenticated request body into a typed event.
    ///
    /// Event types outside the provider vocabulary classify as
    /// [`EventKind::Unhandled`].
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::MalformedPayload`] when the envelope does
    /// not match the provider schema.
    fn classify(&self, request: &WebhookRequest) -> Result<WebhookEvent, VerificationError>;

    /// Verify against the request's receive time, then classify
    fn ingest(&self, request: &WebhookRequest) -> Result<WebhookEvent, VerificationError> {
        self.verify(request, request.received_at)?;
        self.classify(request)
    }
}

// ============================================================================
// JSON helpers
// ============================================================================

/// Non-empty string at `key`
pub(crate) fn str_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
