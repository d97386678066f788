//! # State Reconciler
//!
//! Turns verified [`WebhookEvent`]s into [`UserAccount`] mutations.
//!
//! Every event is applied at most once per `(provider, event_id)`. The
//! reconciler checks [`AccountStore::is_applied`] up front, then plans a
//! single [`Commit`] that records the event and carries the account write.
//! The store's atomic insert of the applied-event record is the final guard
//! against concurrent duplicates.
//!
//! Identity resolution is deterministic: external auth id, then external
//! billing id, then email. Billing events never create accounts.

use crate::account::{ProfileFields, SubscriptionState, UserAccount};
use crate::store::{AccountStore, AccountWrite, AppliedEvent, Commit, CommitResult, StoreError};
use crate::webhook::{
    CheckoutPayload, CustomerPayload, EventKind, SubscriptionPayload, UserPayload, WebhookEvent,
};
use crate::{AuthUserId, BillingCustomerId, EmailAddress, ErrorCategory, PlanId, Timestamp};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

// ============================================================================
// Policy
// ============================================================================

/// What to do with `user.updated` for a user that was never created locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownProfilePolicy {
    /// Reject with [`ReconcileError::UnknownUser`]
    #[default]
    Reject,
    /// Create the account from the update payload
    Create,
}

/// Tunable reconciliation behaviour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerPolicy {
    /// On `user.deleted`, set a live subscription state to `Canceled`
    pub cascade_cancel_on_delete: bool,
    pub unknown_profile_update: UnknownProfilePolicy,

    /// Re-read and retry attempts after an optimistic revision conflict
    pub max_conflict_retries: u32,

    /// Upper bound for every individual store call
    pub store_timeout: Duration,
}

impl Default for ReconcilerPolicy {
    fn default() -> Self {
        Self {
            cascade_cancel_on_delete: false,
            unknown_profile_update: UnknownProfilePolicy::Reject,
            max_conflict_retries: 3,
            store_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Outcomes and errors
// ============================================================================

/// Successful reconciliation result. All of these acknowledge the webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The account was written; carries the stored state
    Applied(UserAccount),

    /// The event id was already recorded; nothing changed
    AlreadyApplied,

    /// The event was older than the last applied version; recorded, not applied
    Stale,

    /// Nothing to change; recorded so redelivery stays a no-op
    Skipped { reason: String },

    /// Event type outside the handled vocabulary; not recorded
    Unhandled,
}

impl ReconcileOutcome {
    /// Stable name for responses, logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::AlreadyApplied => "already_applied",
            Self::Stale => "stale",
            Self::Skipped { .. } => "skipped",
            Self::Unhandled => "unhandled",
        }
    }
}

/// Reconciliation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("No local account for {identity}")]
    UnknownUser { identity: String },

    #[error("Ambiguous identity: {message}")]
    AmbiguousIdentity { message: String },

    #[error("Schema violation on '{field}': {message}")]
    SchemaViolation { field: String, message: String },

    #[error("Account store unavailable: {message}")]
    StoreUnavailable { message: String },
}

impl ReconcileError {
    /// Only store failures are worth a provider redelivery
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Get error category for monitoring
    pub fn error_category(&self) -> ErrorCategory {
        if self.is_transient() {
            ErrorCategory::Transient
        } else {
            ErrorCategory::Permanent
        }
    }

    /// Short machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownUser { .. } => "unknown_user",
            Self::AmbiguousIdentity { .. } => "ambiguous_identity",
            Self::SchemaViolation { .. } => "schema_violation",
            Self::StoreUnavailable { .. } => "store_unavailable",
        }
    }

    fn schema(field: &str, message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    fn ambiguous(message: impl Into<String>) -> Self {
        Self::AmbiguousIdentity {
            message: message.into(),
        }
    }
}

impl From<StoreError> for ReconcileError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UniqueViolation { field } => Self::AmbiguousIdentity {
                message: format!("{} is already held by another account", field),
            },
            other => Self::StoreUnavailable {
                message: other.to_string(),
            },
        }
    }
}

// ============================================================================
// Planning
// ============================================================================

/// What a single attempt intends to commit
enum Decision {
    Write {
        write: AccountWrite,
        planned: UserAccount,
    },
    Stale {
        auth_id: AuthUserId,
    },
    Skip {
        reason: String,
        auth_id: Option<AuthUserId>,
    },
}

impl Decision {
    fn insert(account: UserAccount) -> Self {
        Self::Write {
            write: AccountWrite::Insert(account.clone()),
            planned: account,
        }
    }

    fn update(account: UserAccount, expected_revision: u64) -> Self {
        Self::Write {
            write: AccountWrite::Update {
                account: account.clone(),
                expected_revision,
            },
            planned: account,
        }
    }

    /// Auth id of the account this decision creates
    fn inserted(&self) -> Option<&AuthUserId> {
        match self {
            Self::Write {
                write: AccountWrite::Insert(account),
                ..
            } => Some(&account.external_auth_id),
            _ => None,
        }
    }

    fn skip(reason: &str, auth_id: Option<AuthUserId>) -> Self {
        Self::Skip {
            reason: reason.to_string(),
            auth_id,
        }
    }
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, ReconcileError> {
    value
        .as_deref()
        .ok_or_else(|| ReconcileError::schema(field, "required field is missing"))
}

fn auth_id(value: &Option<String>) -> Result<AuthUserId, ReconcileError> {
    AuthUserId::new(required(value, "auth_id")?)
        .map_err(|e| ReconcileError::schema("auth_id", e.to_string()))
}

fn customer_id(value: &Option<String>) -> Result<BillingCustomerId, ReconcileError> {
    BillingCustomerId::new(required(value, "customer_id")?)
        .map_err(|e| ReconcileError::schema("customer_id", e.to_string()))
}

fn email(value: &str) -> Result<EmailAddress, ReconcileError> {
    EmailAddress::new(value).map_err(|e| ReconcileError::schema("email", e.to_string()))
}

fn profile_fields(payload: &UserPayload) -> Result<ProfileFields, ReconcileError> {
    Ok(ProfileFields {
        email: email(required(&payload.email, "email")?)?,
        username: payload.username.clone(),
        first_name: payload.first_name.clone(),
        last_name: payload.last_name.clone(),
        full_name: payload.full_name.clone(),
        phone: payload.phone.clone(),
    })
}

// ============================================================================
// Reconciler
// ============================================================================

/// Applies webhook events to the account store
///
/// # Examples
///
/// ```rust
/// use account_keeper_core::{InMemoryAccountStore, Reconciler, ReconcilerPolicy};
/// use std::sync::Arc;
///
/// let reconciler = Reconciler::new(Arc::new(InMemoryAccountStore::new()), ReconcilerPolicy::default());
/// assert_eq!(reconciler.policy().max_conflict_retries, 3);
/// ```
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn AccountStore>,
    policy: ReconcilerPolicy,
}

impl Reconciler {
    pub fn new(store: Arc<dyn AccountStore>, policy: ReconcilerPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &ReconcilerPolicy {
        &self.policy
    }

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::UnknownUser`] when no account matches and the event
    ///   may not create one
    /// - [`ReconcileError::AmbiguousIdentity`] when identifiers point at
    ///   different accounts or an email matches several
    /// - [`ReconcileError::SchemaViolation`] when a required field is missing
    ///   or invalid
    /// - [`ReconcileError::StoreUnavailable`] on store failure, timeout, or
    ///   persistent revision conflicts
    #[instrument(skip(self, event), fields(
        provider = %event.provider,
        event_id = %event.event_id,
        event_type = %event.event_type,
    ))]
    pub async fn apply(&self, event: &WebhookEvent) -> Result<ReconcileOutcome, ReconcileError> {
        if matches!(event.kind, EventKind::Unhandled) {
            info!("Acknowledging unhandled event type");
            return Ok(ReconcileOutcome::Unhandled);
        }

        if self
            .timed(self.store.is_applied(event.provider, &event.event_id))
            .await?
        {
            info!("Event already applied");
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        let mut attempt = 0;
        loop {
            let decision = self.plan(event).await.inspect_err(|e| {
                warn!(error_kind = e.kind(), error = %e, "Event rejected");
            })?;

            let (commit, decision) = self.to_commit(event, decision);
            match self.timed(self.store.commit(commit)).await {
                Ok(CommitResult::AlreadyApplied) => {
                    info!("Event applied concurrently by another delivery");
                    return Ok(ReconcileOutcome::AlreadyApplied);
                }
                Ok(CommitResult::Committed(stored)) => return Ok(Self::outcome(decision, stored)),
                Err(StoreError::Conflict { auth_id, expected }) => {
                    attempt += 1;
                    self.check_retry_budget(attempt, &auth_id)?;
                    warn!(%auth_id, expected, attempt, "Revision conflict, re-reading account");
                }
                Err(StoreError::UniqueViolation { field })
                    if field == "external_auth_id" && decision.inserted().is_some() =>
                {
                    attempt += 1;
                    if let Some(auth_id) = decision.inserted() {
                        self.check_retry_budget(attempt, auth_id)?;
                        warn!(%auth_id, attempt, "Account created concurrently, re-planning");
                    }
                }
                Err(e) => {
                    let e = ReconcileError::from(e);
                    if e.is_transient() {
                        error!(error = %e, "Store commit failed");
                    } else {
                        warn!(error_kind = e.kind(), error = %e, "Event rejected at commit");
                    }
                    return Err(e);
                }
            }
        }
    }

    fn check_retry_budget(&self, attempt: u32, auth_id: &AuthUserId) -> Result<(), ReconcileError> {
        if attempt <= self.policy.max_conflict_retries {
            return Ok(());
        }
        error!(%auth_id, attempts = attempt, "Revision conflicts exhausted retries");
        Err(ReconcileError::StoreUnavailable {
            message: format!(
                "revision conflict on account {} persisted after {} retries",
                auth_id, self.policy.max_conflict_retries
            ),
        })
    }

    fn to_commit(&self, event: &WebhookEvent, decision: Decision) -> (Commit, Decision) {
        let record = |auth_id: Option<&AuthUserId>, outcome: &str| AppliedEvent {
            provider: event.provider,
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            auth_id: auth_id.cloned(),
            outcome: outcome.to_string(),
            applied_at: Timestamp::now(),
        };

        let commit = match &decision {
            Decision::Write { write, planned } => Commit::with_write(
                record(Some(&planned.external_auth_id), "applied"),
                write.clone(),
            ),
            Decision::Stale { auth_id } => Commit::record_only(record(Some(auth_id), "stale")),
            Decision::Skip { auth_id, .. } => {
                Commit::record_only(record(auth_id.as_ref(), "skipped"))
            }
        };
        (commit, decision)
    }

    fn outcome(decision: Decision, stored: Option<UserAccount>) -> ReconcileOutcome {
        match decision {
            Decision::Write { planned, .. } => {
                let account = stored.unwrap_or(planned);
                info!(
                    auth_id = %account.external_auth_id,
                    subscription_state = %account.subscription_state,
                    revision = account.revision,
                    "Account updated"
                );
                ReconcileOutcome::Applied(account)
            }
            Decision::Stale { auth_id } => {
                warn!(%auth_id, "Discarded stale event");
                ReconcileOutcome::Stale
            }
            Decision::Skip { reason, .. } => {
                warn!(%reason, "Event skipped");
                ReconcileOutcome::Skipped { reason }
            }
        }
    }

    /// Bound a store call by `store_timeout`
    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.policy.store_timeout, call)
            .await
            .unwrap_or_else(|_| {
                error!(
                    timeout_ms = self.policy.store_timeout.as_millis() as u64,
                    "Store call timed out"
                );
                Err(StoreError::Unavailable {
                    message: format!(
                        "store call exceeded {}ms",
                        self.policy.store_timeout.as_millis()
                    ),
                })
            })
    }

    async fn plan(&self, event: &WebhookEvent) -> Result<Decision, ReconcileError> {
        match &event.kind {
            EventKind::UserCreated(payload) => self.plan_user_created(payload, event.version).await,
            EventKind::UserUpdated(payload) => self.plan_user_updated(payload, event.version).await,
            EventKind::UserDeleted(payload) => {
                let auth_id = auth_id(&payload.auth_id)?;
                self.plan_user_deleted(auth_id).await
            }
            EventKind::CustomerCreated(payload) | EventKind::CustomerUpdated(payload) => {
                self.plan_customer(payload).await
            }
            EventKind::SubscriptionCreated(payload) => {
                self.plan_subscription(payload, event.version, true).await
            }
            EventKind::SubscriptionUpdated(payload) => {
                self.plan_subscription(payload, event.version, false).await
            }
            EventKind::SubscriptionDeleted(payload) => {
                self.plan_subscription_deleted(payload, event.version).await
            }
            EventKind::CheckoutSessionCompleted(payload) => self.plan_checkout(payload).await,
            EventKind::Unhandled => Ok(Decision::skip("unhandled event type", None)),
        }
    }

    /// Fail when `email` already belongs to a live account other than `owner`
    async fn ensure_email_free(
        &self,
        email: &EmailAddress,
        owner: &AuthUserId,
    ) -> Result<(), ReconcileError> {
        let holders = self.timed(self.store.find_by_email(email)).await?;
        if holders
            .iter()
            .any(|a| !a.is_deleted() && &a.external_auth_id != owner)
        {
            return Err(ReconcileError::ambiguous(format!(
                "email {} is already held by another account",
                email
            )));
        }
        Ok(())
    }

    async fn plan_insert(
        &self,
        auth_id: AuthUserId,
        profile: ProfileFields,
        version: Option<i64>,
    ) -> Result<Decision, ReconcileError> {
        self.ensure_email_free(&profile.email, &auth_id).await?;
        Ok(Decision::insert(UserAccount::new(auth_id, profile, version)))
    }

    async fn plan_user_created(
        &self,
        payload: &UserPayload,
        version: Option<i64>,
    ) -> Result<Decision, ReconcileError> {
        let auth_id = auth_id(&payload.auth_id)?;
        let profile = profile_fields(payload)?;

        if self.timed(self.store.find_by_auth_id(&auth_id)).await?.is_some() {
            return Ok(Decision::skip("account already exists", Some(auth_id)));
        }
        self.plan_insert(auth_id, profile, version).await
    }

    async fn plan_user_updated(
        &self,
        payload: &UserPayload,
        version: Option<i64>,
    ) -> Result<Decision, ReconcileError> {
        let auth_id = auth_id(&payload.auth_id)?;
        let profile = profile_fields(payload)?;

        let Some(mut account) = self.timed(self.store.find_by_auth_id(&auth_id)).await? else {
            return match self.policy.unknown_profile_update {
                UnknownProfilePolicy::Reject => Err(ReconcileError::UnknownUser {
                    identity: format!("auth user {}", auth_id),
                }),
                UnknownProfilePolicy::Create => self.plan_insert(auth_id, profile, version).await,
            };
        };

        if account.is_deleted() {
            return Ok(Decision::skip("account is deleted", Some(auth_id)));
        }
        if account.is_profile_stale(version) {
            return Ok(Decision::Stale { auth_id });
        }
        if profile.email != account.email {
            self.ensure_email_free(&profile.email, &auth_id).await?;
        }

        let expected_revision = account.revision;
        account.apply_profile(profile, version);
        Ok(Decision::update(account, expected_revision))
    }

    async fn plan_user_deleted(&self, auth_id: AuthUserId) -> Result<Decision, ReconcileError> {
        let Some(mut account) = self.timed(self.store.find_by_auth_id(&auth_id)).await? else {
            return Ok(Decision::skip("unknown user", Some(auth_id)));
        };
        if account.is_deleted() {
            return Ok(Decision::skip("account already deleted", Some(auth_id)));
        }

        let expected_revision = account.revision;
        account.mark_deleted(self.policy.cascade_cancel_on_delete);
        Ok(Decision::update(account, expected_revision))
    }

    /// Link `customer` to the account found by billing id, then by email
    async fn plan_link(
        &self,
        customer: BillingCustomerId,
        email_hint: Option<&str>,
    ) -> Result<Decision, ReconcileError> {
        if let Some(account) = self.timed(self.store.find_by_billing_id(&customer)).await? {
            return Ok(Decision::skip(
                "billing customer already linked",
                Some(account.external_auth_id),
            ));
        }

        let Some(hint) = email_hint else {
            return Err(ReconcileError::UnknownUser {
                identity: format!("billing customer {}", customer),
            });
        };
        let email = email(hint)?;

        let mut matches = self.timed(self.store.find_by_email(&email)).await?;
        matches.retain(|a| !a.is_deleted());
        let mut account = match matches.len() {
            0 => {
                return Err(ReconcileError::UnknownUser {
                    identity: format!("billing customer {} ({})", customer, email),
                })
            }
            1 => matches.remove(0),
            n => {
                return Err(ReconcileError::ambiguous(format!(
                    "email {} matches {} accounts",
                    email, n
                )))
            }
        };

        let expected_revision = account.revision;
        match account.link_billing(&customer) {
            Ok(true) => Ok(Decision::update(account, expected_revision)),
            Ok(false) => Ok(Decision::skip(
                "billing customer already linked",
                Some(account.external_auth_id),
            )),
            Err(conflict) => Err(ReconcileError::ambiguous(conflict.to_string())),
        }
    }

    async fn plan_customer(&self, payload: &CustomerPayload) -> Result<Decision, ReconcileError> {
        let customer = customer_id(&payload.customer_id)?;
        self.plan_link(customer, payload.email.as_deref()).await
    }

    async fn plan_checkout(&self, payload: &CheckoutPayload) -> Result<Decision, ReconcileError> {
        let customer = customer_id(&payload.customer_id)?;
        self.plan_link(customer, payload.email.as_deref()).await
    }

    async fn subscriber(&self, customer: &BillingCustomerId) -> Result<UserAccount, ReconcileError> {
        self.timed(self.store.find_by_billing_id(customer))
            .await?
            .ok_or_else(|| ReconcileError::UnknownUser {
                identity: format!("billing customer {}", customer),
            })
    }

    async fn plan_subscription(
        &self,
        payload: &SubscriptionPayload,
        version: Option<i64>,
        requires_plan: bool,
    ) -> Result<Decision, ReconcileError> {
        let customer = customer_id(&payload.customer_id)?;
        let status = required(&payload.status, "status")?;
        let state = SubscriptionState::from_provider_status(status).ok_or_else(|| {
            ReconcileError::schema("status", format!("unrecognized subscription status '{}'", status))
        })?;
        let plan = match payload.plan_id.as_deref() {
            Some(plan) => Some(
                PlanId::new(plan).map_err(|e| ReconcileError::schema("plan_id", e.to_string()))?,
            ),
            None if requires_plan => {
                return Err(ReconcileError::schema(
                    "plan_id",
                    "new subscription carries no plan",
                ))
            }
            None => None,
        };

        let mut account = self.subscriber(&customer).await?;
        if account.is_subscription_stale(version) {
            return Ok(Decision::Stale {
                auth_id: account.external_auth_id,
            });
        }

        let expected_revision = account.revision;
        account.apply_subscription(state, plan, version);
        Ok(Decision::update(account, expected_revision))
    }

    async fn plan_subscription_deleted(
        &self,
        payload: &SubscriptionPayload,
        version: Option<i64>,
    ) -> Result<Decision, ReconcileError> {
        let customer = customer_id(&payload.customer_id)?;
        let mut account = self.subscriber(&customer).await?;
        if account.is_subscription_stale(version) {
            return Ok(Decision::Stale {
                auth_id: account.external_auth_id,
            });
        }

        let expected_revision = account.revision;
        account.apply_subscription(SubscriptionState::Canceled, None, version);
        Ok(Decision::update(account, expected_revision))
    }
}

#[cfg(test)]
#[path = "reconciler_tests.rs"]
mod tests;
