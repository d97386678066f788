//! # Dead Letter Module
//!
//! Every rejected webhook (verification or reconciliation failure) is kept as a
//! [`DeadLetterRecord`] for manual inspection and replay. Records are written
//! through a [`DeadLetterSink`]; a failing sink must never change the response
//! returned to the provider, so callers log sink errors and move on.

use crate::{ProviderKind, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A rejected webhook together with its failure context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Unique record identifier; the event id when known
    pub record_id: String,
    pub provider: ProviderKind,
    pub event_id: Option<String>,
    pub event_type: Option<String>,

    /// Machine-readable error kind, e.g. `invalid_signature`, `unknown_user`
    pub error_kind: String,
    pub message: String,

    /// Whether the provider is expected to redeliver
    pub retryable: bool,

    /// Raw request body, lossily decoded as UTF-8
    pub payload: String,
    pub recorded_at: Timestamp,
}

impl DeadLetterRecord {
    /// Build a record for a rejected request body
    pub fn new(
        provider: ProviderKind,
        event_id: Option<String>,
        event_type: Option<String>,
        error_kind: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
        payload: &[u8],
    ) -> Self {
        let record_id = event_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            record_id,
            provider,
            event_id,
            event_type,
            error_kind: error_kind.into(),
            message: message.into(),
            retryable,
            payload: String::from_utf8_lossy(payload).into_owned(),
            recorded_at: Timestamp::now(),
        }
    }

    /// Relative storage path, partitioned by day.
    ///
    /// `dead-letters/year=YYYY/month=MM/day=DD/{provider}-{record_id}.json`
    pub fn to_relative_path(&self) -> String {
        let safe_id: String = self
            .record_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!(
            "dead-letters/year={}/month={:02}/day={:02}/{}-{}.json",
            self.recorded_at.year(),
            self.recorded_at.month(),
            self.recorded_at.day(),
            self.provider,
            safe_id
        )
    }
}

/// Dead-letter persistence errors
#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("Dead-letter storage failed: {message}")]
    Storage { message: String },

    #[error("Dead-letter serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeadLetterError {
    /// Storage failures may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }

    pub fn error_category(&self) -> crate::ErrorCategory {
        if self.is_transient() {
            crate::ErrorCategory::Transient
        } else {
            crate::ErrorCategory::Permanent
        }
    }
}

/// Destination for rejected events
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError>;
}

#[cfg(test)]
#[path = "dead_letter_tests.rs"]
mod tests;
