//! # Account Store Interface
//!
//! Persistence collaborator used by the reconciler. Implementations live in
//! [`crate::adapters`].
//!
//! The contract the reconciler relies on:
//!
//! - `commit` is atomic: the applied-event record and the account write either
//!   both land or neither does
//! - a second commit for the same `(provider, event_id)` returns
//!   [`CommitResult::AlreadyApplied`] and writes nothing
//! - updates are guarded by `expected_revision`; a mismatch is
//!   [`StoreError::Conflict`]
//! - `created_at` is assigned on insert and `updated_at` strictly increases
//!   with every write to the same account

use crate::{
    account::UserAccount, AuthUserId, BillingCustomerId, EmailAddress, ErrorCategory, EventId,
    ProviderKind, Timestamp,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Idempotency record written together with the account change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedEvent {
    pub provider: ProviderKind,
    pub event_id: EventId,
    pub event_type: String,

    /// Account the event resolved to, if any
    pub auth_id: Option<AuthUserId>,

    /// `applied`, `stale` or `skipped`
    pub outcome: String,
    pub applied_at: Timestamp,
}

/// Account mutation carried by a [`Commit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountWrite {
    /// Create a new account; fails with `UniqueViolation` on key clashes
    Insert(UserAccount),

    /// Replace an existing account if its revision is still `expected_revision`
    Update {
        account: UserAccount,
        expected_revision: u64,
    },
}

/// Unit of work: mark an event applied and optionally write an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub applied: AppliedEvent,
    pub write: Option<AccountWrite>,
}

impl Commit {
    /// Record the event without touching any account
    pub fn record_only(applied: AppliedEvent) -> Self {
        Self {
            applied,
            write: None,
        }
    }

    pub fn with_write(applied: AppliedEvent, write: AccountWrite) -> Self {
        Self {
            applied,
            write: Some(write),
        }
    }
}

/// Result of a successful [`AccountStore::commit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    /// Changes persisted; carries the account as stored (revision and
    /// timestamps assigned by the store) when one was written
    Committed(Option<UserAccount>),

    /// The event was already recorded; nothing was written
    AlreadyApplied,
}

/// Store-level failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Revision conflict on account {auth_id}: expected {expected}")]
    Conflict { auth_id: AuthUserId, expected: u64 },

    #[error("Unique constraint violated on {field}")]
    UniqueViolation { field: String },
}

impl StoreError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Conflict { .. })
    }

    pub fn error_category(&self) -> ErrorCategory {
        if self.is_transient() {
            ErrorCategory::Transient
        } else {
            ErrorCategory::Permanent
        }
    }
}

/// Persistence operations for [`UserAccount`] records and applied events
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Look up an account by its auth provider user id
    async fn find_by_auth_id(&self, id: &AuthUserId) -> Result<Option<UserAccount>, StoreError>;

    /// Look up an account by its billing customer id
    async fn find_by_billing_id(
        &self,
        id: &BillingCustomerId,
    ) -> Result<Option<UserAccount>, StoreError>;

    /// All accounts holding `email`, logically deleted ones included.
    ///
    /// At most one of the results is live. Callers linking identities
    /// consider only live accounts.
    async fn find_by_email(&self, email: &EmailAddress) -> Result<Vec<UserAccount>, StoreError>;

    /// Whether `(provider, event_id)` has already been applied
    async fn is_applied(&self, provider: ProviderKind, event_id: &EventId)
        -> Result<bool, StoreError>;

    /// Atomically record the event and apply the optional account write
    async fn commit(&self, commit: Commit) -> Result<CommitResult, StoreError>;

    /// Reachability probe used by the readiness endpoint
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Next `updated_at` for an account: now, or just after the previous value
/// when the clock has not advanced.
pub fn next_updated_at(previous: Option<Timestamp>, now: Timestamp) -> Timestamp {
    match previous {
        Some(previous) if now <= previous => previous.add_micros(1),
        _ => now,
    }
}
