//! Error types for the HTTP service

use account_keeper_core::{ErrorCategory, ReconcileError, Timestamp, VerificationError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use tracing::warn;

/// Seconds a provider is asked to wait before redelivering after a transient failure
pub const RETRY_AFTER_SECONDS: u64 = 30;

/// Webhook handler errors with HTTP status code mapping
///
/// Providers redeliver on 5xx and give up on 4xx, so the mapping decides
/// whether an event gets another chance:
///
/// - `400 Bad Request`: stale timestamp or malformed payload
/// - `401 Unauthorized`: missing or mismatching signature
/// - `409 Conflict`: the event would make two accounts share an identity
/// - `422 Unprocessable Entity`: unknown user or invalid field values
/// - `503 Service Unavailable`: account store down or timed out, with `Retry-After`
///
/// Signature failure details are logged server-side only.
#[derive(Debug, thiserror::Error)]
pub enum WebhookHandlerError {
    /// Authentication or payload parsing failed before reconciliation
    #[error("Verification failed: {0}")]
    Verification(#[from] VerificationError),

    /// The verified event could not be applied to the account store
    #[error("Reconciliation failed: {0}")]
    Reconciliation(#[from] ReconcileError),
}

impl WebhookHandlerError {
    /// HTTP status code this error is reported with
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Verification(VerificationError::InvalidSignature { .. }) => {
                StatusCode::UNAUTHORIZED
            }
            Self::Verification(_) => StatusCode::BAD_REQUEST,
            Self::Reconciliation(ReconcileError::UnknownUser { .. })
            | Self::Reconciliation(ReconcileError::SchemaViolation { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Reconciliation(ReconcileError::AmbiguousIdentity { .. }) => StatusCode::CONFLICT,
            Self::Reconciliation(ReconcileError::StoreUnavailable { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// Machine-readable error kind included in the response body
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Verification(e) => e.kind(),
            Self::Reconciliation(e) => e.kind(),
        }
    }
}

impl IntoResponse for WebhookHandlerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (message, retry_after) = match &self {
            Self::Verification(VerificationError::InvalidSignature { reason }) => {
                warn!(reason = %reason, "Rejected webhook with invalid signature");
                ("Invalid webhook signature".to_string(), None)
            }
            Self::Verification(e) => {
                warn!(error = %e, "Rejected unverifiable webhook");
                (self.to_string(), None)
            }
            Self::Reconciliation(e) if e.is_transient() => {
                warn!(error = %e, "Account store unavailable");
                (
                    "Account store temporarily unavailable".to_string(),
                    Some(RETRY_AFTER_SECONDS),
                )
            }
            Self::Reconciliation(e) => {
                warn!(error = %e, "Rejected webhook during reconciliation");
                (self.to_string(), None)
            }
        };

        let body = serde_json::json!({
            "error": message,
            "kind": self.kind(),
            "status": status.as_u16(),
            "timestamp": Timestamp::now().to_rfc3339(),
        });

        let mut response = (status, Json(body)).into_response();

        if let Some(retry_seconds) = retry_after {
            if let Ok(header_value) = retry_seconds.to_string().parse() {
                response.headers_mut().insert("Retry-After", header_value);
            }
        }

        response
    }
}

/// Service-level errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to bind to address {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("Server failed: {message}")]
    ServerFailed { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Account store initialisation failed: {message}")]
    StoreInitFailed { message: String },
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Metrics registry setup failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ConfigError {
    /// Configuration problems need an operator, not a retry
    pub fn is_transient(&self) -> bool {
        false
    }

    pub fn error_category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod tests;
