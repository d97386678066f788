//! # In-Memory Account Store
//!
//! Thread-safe in-memory implementation of [`AccountStore`] for testing and
//! development. A single lock covers accounts and applied events so every
//! commit is atomic.

use crate::account::UserAccount;
use crate::store::{
    next_updated_at, AccountStore, AccountWrite, AppliedEvent, Commit, CommitResult, StoreError,
};
use crate::{AuthUserId, BillingCustomerId, EmailAddress, EventId, ProviderKind, Timestamp};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct StoreState {
    accounts: HashMap<AuthUserId, UserAccount>,
    applied: HashMap<(ProviderKind, EventId), AppliedEvent>,
}

impl StoreState {
    /// Enforce unique email, username and billing id against every other account
    fn check_unique(&self, candidate: &UserAccount) -> Result<(), StoreError> {
        let others = self
            .accounts
            .values()
            .filter(|a| a.external_auth_id != candidate.external_auth_id);

        for other in others {
            if let (Some(a), Some(b)) = (&other.external_billing_id, &candidate.external_billing_id)
            {
                if a == b {
                    return Err(unique("external_billing_id"));
                }
            }

            // Deleted accounts release their email and username
            if other.is_deleted() || candidate.is_deleted() {
                continue;
            }
            if other.email == candidate.email {
                return Err(unique("email"));
            }
            if other.username.is_some() && other.username == candidate.username {
                return Err(unique("username"));
            }
        }
        Ok(())
    }
}

fn unique(field: &str) -> StoreError {
    StoreError::UniqueViolation {
        field: field.to_string(),
    }
}

/// In-memory account store
///
/// Cloning shares the underlying state.
#[derive(Debug, Clone)]
pub struct InMemoryAccountStore {
    state: Arc<Mutex<StoreState>>,
    available: Arc<AtomicBool>,
}

impl InMemoryAccountStore {
    /// Create new empty store
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot of every applied-event record
    pub async fn applied_events(&self) -> Vec<AppliedEvent> {
        self.state.lock().await.applied.values().cloned().collect()
    }

    /// Snapshot of every stored account
    pub async fn accounts(&self) -> Vec<UserAccount> {
        self.state.lock().await.accounts.values().cloned().collect()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                message: "in-memory store marked unavailable".to_string(),
            })
        }
    }
}

impl Default for InMemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn find_by_auth_id(&self, id: &AuthUserId) -> Result<Option<UserAccount>, StoreError> {
        self.ensure_available()?;
        Ok(self.state.lock().await.accounts.get(id).cloned())
    }

    async fn find_by_billing_id(
        &self,
        id: &BillingCustomerId,
    ) -> Result<Option<UserAccount>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .find(|a| a.external_billing_id.as_ref() == Some(id))
            .cloned())
    }

    async fn find_by_email(&self, email: &EmailAddress) -> Result<Vec<UserAccount>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .filter(|a| &a.email == email)
            .cloned()
            .collect())
    }

    async fn is_applied(
        &self,
        provider: ProviderKind,
        event_id: &EventId,
    ) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.applied.contains_key(&(provider, event_id.clone())))
    }

    async fn commit(&self, commit: Commit) -> Result<CommitResult, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;

        let key = (commit.applied.provider, commit.applied.event_id.clone());
        if state.applied.contains_key(&key) {
            return Ok(CommitResult::AlreadyApplied);
        }

        let now = Timestamp::now();
        let stored = match commit.write {
            None => None,
            Some(AccountWrite::Insert(mut account)) => {
                if state.accounts.contains_key(&account.external_auth_id) {
                    return Err(unique("external_auth_id"));
                }
                state.check_unique(&account)?;

                account.created_at = now;
                account.updated_at = now;
                account.revision = 1;
                state
                    .accounts
                    .insert(account.external_auth_id.clone(), account.clone());
                Some(account)
            }
            Some(AccountWrite::Update {
                mut account,
                expected_revision,
            }) => {
                let current = state
                    .accounts
                    .get(&account.external_auth_id)
                    .filter(|current| current.revision == expected_revision)
                    .ok_or_else(|| StoreError::Conflict {
                        auth_id: account.external_auth_id.clone(),
                        expected: expected_revision,
                    })?;
                let (created_at, previous_update) = (current.created_at, current.updated_at);
                state.check_unique(&account)?;

                account.created_at = created_at;
                account.updated_at = next_updated_at(Some(previous_update), now);
                account.revision = expected_revision + 1;
                state
                    .accounts
                    .insert(account.external_auth_id.clone(), account.clone());
                Some(account)
            }
        };

        state.applied.insert(key, commit.applied);
        Ok(CommitResult::Committed(stored))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }
}

#[cfg(test)]
#[path = "memory_store_tests.rs"]
mod tests;
