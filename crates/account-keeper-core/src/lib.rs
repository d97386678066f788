//! # Account-Keeper Core
//!
//! Core business logic for the Account-Keeper webhook synchronization service.
//!
//! This crate verifies webhooks from the authentication provider and the billing
//! provider, classifies them into typed events, and reconciles them into the
//! locally held [`account::UserAccount`] records exactly once in effect.
//!
//! ## Architecture
//!
//! - Business logic depends only on trait abstractions ([`webhook::WebhookProvider`],
//!   [`store::AccountStore`], [`dead_letter::DeadLetterSink`])
//! - Infrastructure implementations are injected at runtime
//! - No module-level globals: every collaborator is passed in explicitly
//!
//! ## Usage
//!
//! ```rust
//! use account_keeper_core::{AuthUserId, EmailAddress};
//!
//! let auth_id = AuthUserId::new("user_2abc").unwrap();
//! let email = EmailAddress::new("Ada@Example.com").unwrap();
//! assert_eq!(email.as_str(), "ada@example.com");
//! assert_eq!(auth_id.as_str(), "user_2abc");
//! ```

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Domain Identifier Types
// ============================================================================

const MAX_IDENTIFIER_LENGTH: usize = 255;

fn validate_identifier(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max_length: MAX_IDENTIFIER_LENGTH,
        });
    }

    if !value.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ValidationError::InvalidCharacters {
            field: field.to_string(),
            invalid_chars: "non-ASCII or whitespace".to_string(),
        });
    }

    Ok(())
}

/// Provider-assigned identifier of a webhook event.
///
/// This is the idempotency key: `msg_...` for the auth provider, `evt_...` for
/// the billing provider. Uniqueness is scoped per provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    /// Create new event ID with validation
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        validate_identifier("event_id", &value)?;
        Ok(Self(value))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// User identifier assigned by the authentication provider.
///
/// Immutable for the lifetime of a [`account::UserAccount`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthUserId(String);

impl AuthUserId {
    /// Create new auth user ID with validation
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        validate_identifier("external_auth_id", &value)?;
        Ok(Self(value))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuthUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AuthUserId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Customer identifier assigned by the billing provider (`cus_...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillingCustomerId(String);

impl BillingCustomerId {
    /// Create new billing customer ID with validation
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        validate_identifier("external_billing_id", &value)?;
        Ok(Self(value))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BillingCustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BillingCustomerId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Plan (price) identifier reported by the billing provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanId(String);

impl PlanId {
    /// Create new plan ID with validation
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        validate_identifier("external_plan_id", &value)?;
        Ok(Self(value))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Email address, normalized to lowercase with surrounding whitespace removed.
///
/// Email is a unique key for identity resolution, so two spellings that differ
/// only in case must compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress(String);

impl EmailAddress {
    /// Create new email address with validation
    ///
    /// # Validation Rules
    /// - Must be 3-254 characters after trimming
    /// - Must contain exactly one `@` with a non-empty local part and domain
    /// - Must not contain whitespace
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into().trim().to_lowercase();

        if value.is_empty() {
            return Err(ValidationError::Required {
                field: "email".to_string(),
            });
        }

        if value.len() > 254 {
            return Err(ValidationError::TooLong {
                field: "email".to_string(),
                max_length: 254,
            });
        }

        if value.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidCharacters {
                field: "email".to_string(),
                invalid_chars: "whitespace".to_string(),
            });
        }

        match value.split_once('@') {
            Some((local, domain))
                if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {}
            _ => {
                return Err(ValidationError::InvalidFormat {
                    field: "email".to_string(),
                    message: "expected exactly one '@' between local part and domain"
                        .to_string(),
                })
            }
        }

        Ok(Self(value))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EmailAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// The external platform a webhook originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Authentication provider (user lifecycle)
    Auth,
    /// Billing provider (customer and subscription lifecycle)
    Billing,
}

impl ProviderKind {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Billing => "billing",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(Self::Auth),
            "billing" => Ok(Self::Billing),
            _ => Err(ParseError::InvalidFormat {
                expected: "auth or billing".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Time Types
// ============================================================================

/// UTC timestamp with microsecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current moment
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Wrap an existing `DateTime<Utc>`
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Build a timestamp from unix seconds
    pub fn from_unix_seconds(seconds: i64) -> Result<Self, ParseError> {
        DateTime::from_timestamp(seconds, 0)
            .map(Self)
            .ok_or_else(|| ParseError::InvalidFormat {
                expected: "unix timestamp in seconds".to_string(),
                actual: seconds.to_string(),
            })
    }

    /// Build a timestamp from unix milliseconds
    pub fn from_unix_millis(millis: i64) -> Result<Self, ParseError> {
        DateTime::from_timestamp_millis(millis)
            .map(Self)
            .ok_or_else(|| ParseError::InvalidFormat {
                expected: "unix timestamp in milliseconds".to_string(),
                actual: millis.to_string(),
            })
    }

    /// Parse timestamp from RFC3339 string
    pub fn from_rfc3339(s: &str) -> Result<Self, ParseError> {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|_| ParseError::InvalidFormat {
                expected: "RFC3339 datetime".to_string(),
                actual: s.to_string(),
            })?
            .with_timezone(&Utc);
        Ok(Self(dt))
    }

    /// Convert to RFC3339 string
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Seconds since the unix epoch
    pub fn unix_seconds(&self) -> i64 {
        self.0.timestamp()
    }

    /// Add seconds to timestamp
    pub fn add_seconds(&self, seconds: i64) -> Self {
        Self(self.0 + chrono::Duration::seconds(seconds))
    }

    /// Add microseconds to timestamp
    pub fn add_micros(&self, micros: i64) -> Self {
        Self(self.0 + chrono::Duration::microseconds(micros))
    }

    /// Absolute distance between two timestamps
    pub fn abs_diff(&self, other: Self) -> Duration {
        let delta = self.0.signed_duration_since(other.0).abs();
        delta.to_std().unwrap_or_default()
    }

    /// Get year component
    pub fn year(&self) -> i32 {
        self.0.year()
    }

    /// Get month component (1-12)
    pub fn month(&self) -> u32 {
        self.0.month()
    }

    /// Get day component (1-31)
    pub fn day(&self) -> u32 {
        self.0.day()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// High-level error categorization for retry and alerting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Temporary failures that should be retried
    Transient,
    /// Permanent failures that won't succeed on retry
    Permanent,
    /// Security-related failures requiring immediate attention
    Security,
    /// Configuration errors preventing startup
    Configuration,
}

/// Error type for input validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' has invalid format: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    TooLong { field: String, max_length: usize },

    #[error("Field '{field}' contains invalid characters: {invalid_chars}")]
    InvalidCharacters {
        field: String,
        invalid_chars: String,
    },
}

impl ValidationError {
    /// Invalid input never becomes valid on retry
    pub fn is_transient(&self) -> bool {
        false
    }

    pub fn error_category(&self) -> ErrorCategory {
        ErrorCategory::Permanent
    }
}

/// Error type for string parsing failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid format: expected {expected}, got '{actual}'")]
    InvalidFormat { expected: String, actual: String },
}

// ============================================================================
// Module declarations
// ============================================================================

/// Local user account model and subscription state machine
pub mod account;

/// Webhook verification and classification for both providers
pub mod webhook;

/// Persistence collaborator interface
pub mod store;

/// Event reconciliation into local account state
pub mod reconciler;

/// Recording of rejected events for manual inspection
pub mod dead_letter;

/// Infrastructure adapters for the store and dead-letter interfaces
pub mod adapters;

// Re-export key types for convenience
pub use account::{AccountStatus, ProfileFields, SubscriptionState, UserAccount};
pub use adapters::{FilesystemDeadLetterSink, InMemoryAccountStore, InMemoryDeadLetterSink};
pub use dead_letter::{DeadLetterError, DeadLetterRecord, DeadLetterSink};
pub use reconciler::{
    ReconcileError, ReconcileOutcome, Reconciler, ReconcilerPolicy, UnknownProfilePolicy,
};
pub use store::{AccountStore, AccountWrite, AppliedEvent, Commit, CommitResult, StoreError};
pub use webhook::{
    AuthWebhookProvider, BillingWebhookProvider, EventKind, VerificationError, WebhookEvent,
    WebhookProvider, WebhookRequest,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
