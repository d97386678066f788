//! # User Account Model
//!
//! The locally held mirror of a user as reported by the authentication and
//! billing providers.
//!
//! Invariants maintained by the methods on [`UserAccount`]:
//! - `external_auth_id` is fixed at construction
//! - `external_billing_id` is assigned at most once
//! - `is_subscribed()` is derived from [`SubscriptionState`] and never stored
//!   independently
//! - updates carrying a provider version lower than the last applied one are
//!   rejected as stale

use crate::{AuthUserId, BillingCustomerId, EmailAddress, PlanId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Subscription State
// ============================================================================

/// Subscription lifecycle state, driven only by billing provider events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    #[default]
    None,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionState {
    /// Map a billing provider subscription status to a local state.
    ///
    /// Returns `None` for statuses this service does not recognize; callers
    /// treat that as a schema violation rather than guessing.
    pub fn from_provider_status(status: &str) -> Option<Self> {
        match status {
            "active" | "trialing" => Some(Self::Active),
            "past_due" | "unpaid" => Some(Self::PastDue),
            "canceled" | "incomplete_expired" => Some(Self::Canceled),
            "incomplete" | "paused" => Some(Self::None),
            _ => None,
        }
    }

    /// Whether an account in this state counts as subscribed
    pub fn is_subscribed(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionState {
    type Err = crate::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            _ => Err(crate::ParseError::InvalidFormat {
                expected: "none, active, past_due, or canceled".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

/// Logical account status. Deleted accounts are kept to preserve billing history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Active,
    Deleted,
}

impl AccountStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deleted => "deleted",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = crate::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "deleted" => Ok(Self::Deleted),
            _ => Err(crate::ParseError::InvalidFormat {
                expected: "active or deleted".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Profile Fields
// ============================================================================

/// Profile attributes reported by the authentication provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    pub email: EmailAddress,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: Option<String>,
    pub phone: Option<String>,
}

impl ProfileFields {
    /// Profile with only an email address
    pub fn with_email(email: EmailAddress) -> Self {
        Self {
            email,
            username: None,
            first_name: None,
            last_name: None,
            full_name: None,
            phone: None,
        }
    }
}

/// Error returned when an account is already linked to a different billing customer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("account is linked to billing customer {existing}, refusing to relink to {requested}")]
pub struct BillingLinkConflict {
    pub existing: BillingCustomerId,
    pub requested: BillingCustomerId,
}

// ============================================================================
// User Account
// ============================================================================

/// Local record of one end user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub external_auth_id: AuthUserId,
    pub email: EmailAddress,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub status: AccountStatus,
    pub subscription_state: SubscriptionState,
    pub external_billing_id: Option<BillingCustomerId>,
    pub external_plan_id: Option<PlanId>,

    /// Last provider-reported version applied to the profile fields
    pub profile_version: Option<i64>,

    /// Last provider-reported version applied to the subscription fields
    pub subscription_version: Option<i64>,

    /// Optimistic concurrency counter, bumped by the store on every write
    pub revision: u64,

    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl UserAccount {
    /// Create a new, unsubscribed account from an auth provider profile.
    ///
    /// `created_at`/`updated_at` are provisional; the store assigns the
    /// authoritative values on insert.
    pub fn new(external_auth_id: AuthUserId, profile: ProfileFields, version: Option<i64>) -> Self {
        let now = Timestamp::now();
        Self {
            external_auth_id,
            email: profile.email,
            username: profile.username,
            first_name: profile.first_name,
            last_name: profile.last_name,
            full_name: profile.full_name,
            phone: profile.phone,
            status: AccountStatus::Active,
            subscription_state: SubscriptionState::None,
            external_billing_id: None,
            external_plan_id: None,
            profile_version: version,
            subscription_version: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Derived subscription flag
    pub fn is_subscribed(&self) -> bool {
        self.subscription_state.is_subscribed()
    }

    /// Whether the account has been logically deleted
    pub fn is_deleted(&self) -> bool {
        self.status == AccountStatus::Deleted
    }

    /// True when `version` is older than the last applied profile version
    pub fn is_profile_stale(&self, version: Option<i64>) -> bool {
        is_older(version, self.profile_version)
    }

    /// True when `version` is older than the last applied subscription version
    pub fn is_subscription_stale(&self, version: Option<i64>) -> bool {
        is_older(version, self.subscription_version)
    }

    /// Overwrite profile fields. Returns `false` without mutating when stale.
    pub fn apply_profile(&mut self, profile: ProfileFields, version: Option<i64>) -> bool {
        if self.is_profile_stale(version) {
            return false;
        }

        self.email = profile.email;
        self.username = profile.username;
        self.first_name = profile.first_name;
        self.last_name = profile.last_name;
        self.full_name = profile.full_name;
        self.phone = profile.phone;
        if version.is_some() {
            self.profile_version = version;
        }
        true
    }

    /// Associate a billing customer.
    ///
    /// Returns `Ok(true)` when the link was created, `Ok(false)` when the same
    /// customer was already linked.
    pub fn link_billing(
        &mut self,
        customer: &BillingCustomerId,
    ) -> Result<bool, BillingLinkConflict> {
        match &self.external_billing_id {
            Some(existing) if existing == customer => Ok(false),
            Some(existing) => Err(BillingLinkConflict {
                existing: existing.clone(),
                requested: customer.clone(),
            }),
            None => {
                self.external_billing_id = Some(customer.clone());
                Ok(true)
            }
        }
    }

    /// Apply a provider-reported subscription state. Returns `false` when stale.
    ///
    /// A missing plan keeps the previously known plan.
    pub fn apply_subscription(
        &mut self,
        state: SubscriptionState,
        plan: Option<PlanId>,
        version: Option<i64>,
    ) -> bool {
        if self.is_subscription_stale(version) {
            return false;
        }

        self.subscription_state = state;
        if plan.is_some() {
            self.external_plan_id = plan;
        }
        if version.is_some() {
            self.subscription_version = version;
        }
        true
    }

    /// Logically delete the account.
    ///
    /// With `cascade_cancel`, a live subscription state is set to `Canceled`
    /// locally. The billing link and plan are kept for history.
    pub fn mark_deleted(&mut self, cascade_cancel: bool) {
        self.status = AccountStatus::Deleted;
        if cascade_cancel
            && matches!(
                self.subscription_state,
                SubscriptionState::Active | SubscriptionState::PastDue
            )
        {
            self.subscription_state = SubscriptionState::Canceled;
        }
    }
}

fn is_older(candidate: Option<i64>, applied: Option<i64>) -> bool {
    match (candidate, applied) {
        (Some(candidate), Some(applied)) => candidate < applied,
        _ => false,
    }
}

#[cfg(test)]
#[path = "account_tests.rs"]
mod tests;
