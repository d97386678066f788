//! In-memory dead-letter sink for tests and local development.

use crate::dead_letter::{DeadLetterError, DeadLetterRecord, DeadLetterSink};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Keeps every record in memory. Cloning shares the underlying list.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetterSink {
    records: Arc<Mutex<Vec<DeadLetterRecord>>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded entries, oldest first
    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError> {
        self.records.lock().await.push(record);
        Ok(())
    }
}
