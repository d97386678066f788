//! Response types for the API.

use account_keeper_core::{EventId, Timestamp};
use serde::Serialize;

/// Acknowledgement returned for every accepted webhook
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: String,
    pub event_id: EventId,
    pub event_type: String,

    /// `applied`, `already_applied`, `stale`, `skipped` or `unhandled`
    pub outcome: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: Timestamp,
    pub version: String,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub timestamp: Timestamp,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
