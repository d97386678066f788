//! # PostgreSQL Account Store
//!
//! [`AccountStore`] backed by PostgreSQL through `sqlx`.
//!
//! Each [`Commit`] runs in one transaction: the applied-event row is inserted
//! with `ON CONFLICT DO NOTHING` first, and zero affected rows means another
//! delivery already won. The account write follows, guarded by `revision`.
//! Partial unique indexes keep email and username unique among active
//! accounts while deleted accounts retain their history.

use crate::account::UserAccount;
use crate::store::{
    next_updated_at, AccountStore, AccountWrite, AppliedEvent, Commit, CommitResult, StoreError,
};
use crate::{AuthUserId, BillingCustomerId, EmailAddress, EventId, PlanId, ProviderKind, Timestamp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: [&str; 4] = [
    r#"CREATE TABLE IF NOT EXISTS user_accounts (
        external_auth_id     TEXT PRIMARY KEY,
        email                TEXT NOT NULL,
        username             TEXT,
        first_name           TEXT,
        last_name            TEXT,
        full_name            TEXT,
        phone                TEXT,
        status               TEXT NOT NULL,
        subscription_state   TEXT NOT NULL,
        external_billing_id  TEXT,
        external_plan_id     TEXT,
        profile_version      BIGINT,
        subscription_version BIGINT,
        revision             BIGINT NOT NULL,
        created_at           TIMESTAMPTZ NOT NULL,
        updated_at           TIMESTAMPTZ NOT NULL,
        CONSTRAINT user_accounts_billing_key UNIQUE (external_billing_id)
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS user_accounts_email_key
        ON user_accounts (email) WHERE status = 'active'"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS user_accounts_username_key
        ON user_accounts (username) WHERE status = 'active' AND username IS NOT NULL"#,
    r#"CREATE TABLE IF NOT EXISTS applied_events (
        provider    TEXT NOT NULL,
        event_id    TEXT NOT NULL,
        event_type  TEXT NOT NULL,
        auth_id     TEXT,
        outcome     TEXT NOT NULL,
        applied_at  TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (provider, event_id)
    )"#,
];

const ACCOUNT_COLUMNS: &str = "external_auth_id, email, username, first_name, last_name, \
    full_name, phone, status, subscription_state, external_billing_id, external_plan_id, \
    profile_version, subscription_version, revision, created_at, updated_at";

/// PostgreSQL-backed account store
#[derive(Debug, Clone)]
pub struct PostgresAccountStore {
    pool: PgPool,
}

impl PostgresAccountStore {
    /// Connect a pool to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when no connection can be opened
    /// within `acquire_timeout`.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(map_sqlx_error)?;
        info!(max_connections, "Connected to PostgreSQL account store");
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        debug!("Account store schema ensured");
        Ok(())
    }

    async fn fetch_one_where(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Option<UserAccount>, StoreError> {
        let sql = format!(
            "SELECT {} FROM user_accounts WHERE {} = $1",
            ACCOUNT_COLUMNS, column
        );
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn insert_account(
        tx: &mut Transaction<'_, Postgres>,
        account: &UserAccount,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO user_accounts ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            ACCOUNT_COLUMNS
        );
        sqlx::query(&sql)
            .bind(account.external_auth_id.as_str())
            .bind(account.email.as_str())
            .bind(account.username.as_deref())
            .bind(account.first_name.as_deref())
            .bind(account.last_name.as_deref())
            .bind(account.full_name.as_deref())
            .bind(account.phone.as_deref())
            .bind(account.status.as_str())
            .bind(account.subscription_state.as_str())
            .bind(account.external_billing_id.as_ref().map(|id| id.as_str()))
            .bind(account.external_plan_id.as_ref().map(|id| id.as_str()))
            .bind(account.profile_version)
            .bind(account.subscription_version)
            .bind(revision_to_db(account.revision)?)
            .bind(*account.created_at.as_datetime())
            .bind(*account.updated_at.as_datetime())
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn update_account(
        tx: &mut Transaction<'_, Postgres>,
        account: &UserAccount,
        expected_revision: u64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE user_accounts SET \
               email = $2, username = $3, first_name = $4, last_name = $5, full_name = $6, \
               phone = $7, status = $8, subscription_state = $9, external_billing_id = $10, \
               external_plan_id = $11, profile_version = $12, subscription_version = $13, \
               revision = $14, updated_at = $15 \
             WHERE external_auth_id = $1 AND revision = $16",
        )
        .bind(account.external_auth_id.as_str())
        .bind(account.email.as_str())
        .bind(account.username.as_deref())
        .bind(account.first_name.as_deref())
        .bind(account.last_name.as_deref())
        .bind(account.full_name.as_deref())
        .bind(account.phone.as_deref())
        .bind(account.status.as_str())
        .bind(account.subscription_state.as_str())
        .bind(account.external_billing_id.as_ref().map(|id| id.as_str()))
        .bind(account.external_plan_id.as_ref().map(|id| id.as_str()))
        .bind(account.profile_version)
        .bind(account.subscription_version)
        .bind(revision_to_db(account.revision)?)
        .bind(*account.updated_at.as_datetime())
        .bind(revision_to_db(expected_revision)?)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                auth_id: account.external_auth_id.clone(),
                expected: expected_revision,
            });
        }
        Ok(())
    }

    async fn insert_applied(
        tx: &mut Transaction<'_, Postgres>,
        applied: &AppliedEvent,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO applied_events \
               (provider, event_id, event_type, auth_id, outcome, applied_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (provider, event_id) DO NOTHING",
        )
        .bind(applied.provider.as_str())
        .bind(applied.event_id.as_str())
        .bind(&applied.event_type)
        .bind(applied.auth_id.as_ref().map(|id| id.as_str()))
        .bind(&applied.outcome)
        .bind(*applied.applied_at.as_datetime())
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    async fn find_by_auth_id(&self, id: &AuthUserId) -> Result<Option<UserAccount>, StoreError> {
        self.fetch_one_where("external_auth_id", id.as_str()).await
    }

    async fn find_by_billing_id(
        &self,
        id: &BillingCustomerId,
    ) -> Result<Option<UserAccount>, StoreError> {
        self.fetch_one_where("external_billing_id", id.as_str()).await
    }

    async fn find_by_email(&self, email: &EmailAddress) -> Result<Vec<UserAccount>, StoreError> {
        let sql = format!(
            "SELECT {} FROM user_accounts WHERE email = $1 ORDER BY created_at",
            ACCOUNT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(email.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(row_to_account).collect()
    }

    async fn is_applied(
        &self,
        provider: ProviderKind,
        event_id: &EventId,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM applied_events WHERE provider = $1 AND event_id = $2")
            .bind(provider.as_str())
            .bind(event_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.is_some())
    }

    async fn commit(&self, commit: Commit) -> Result<CommitResult, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        if !Self::insert_applied(&mut tx, &commit.applied).await? {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Ok(CommitResult::AlreadyApplied);
        }

        let now = Timestamp::now();
        let stored = match commit.write {
            None => None,
            Some(AccountWrite::Insert(mut account)) => {
                account.created_at = now;
                account.updated_at = now;
                account.revision = 1;
                Self::insert_account(&mut tx, &account).await?;
                Some(account)
            }
            Some(AccountWrite::Update {
                mut account,
                expected_revision,
            }) => {
                // The revision guard ensures `updated_at` is still the stored value.
                account.updated_at = next_updated_at(Some(account.updated_at), now);
                account.revision = expected_revision + 1;
                Self::update_account(&mut tx, &account, expected_revision).await?;
                Some(account)
            }
        };

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(CommitResult::Committed(stored))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

fn revision_to_db(revision: u64) -> Result<i64, StoreError> {
    i64::try_from(revision).map_err(|_| StoreError::Unavailable {
        message: format!("revision {} exceeds column range", revision),
    })
}

fn corrupt(column: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable {
        message: format!("invalid value in column '{}': {}", column, detail),
    }
}

fn row_to_account(row: &PgRow) -> Result<UserAccount, StoreError> {
    let text = |column: &str| -> Result<String, StoreError> {
        row.try_get::<String, _>(column).map_err(map_sqlx_error)
    };
    let optional = |column: &str| -> Result<Option<String>, StoreError> {
        row.try_get::<Option<String>, _>(column).map_err(map_sqlx_error)
    };
    let timestamp = |column: &str| -> Result<Timestamp, StoreError> {
        row.try_get::<DateTime<Utc>, _>(column)
            .map(Timestamp::from_datetime)
            .map_err(map_sqlx_error)
    };

    let revision: i64 = row.try_get("revision").map_err(map_sqlx_error)?;

    Ok(UserAccount {
        external_auth_id: AuthUserId::new(text("external_auth_id")?)
            .map_err(|e| corrupt("external_auth_id", e))?,
        email: EmailAddress::new(text("email")?).map_err(|e| corrupt("email", e))?,
        username: optional("username")?,
        first_name: optional("first_name")?,
        last_name: optional("last_name")?,
        full_name: optional("full_name")?,
        phone: optional("phone")?,
        status: text("status")?.parse().map_err(|e| corrupt("status", e))?,
        subscription_state: text("subscription_state")?
            .parse()
            .map_err(|e| corrupt("subscription_state", e))?,
        external_billing_id: optional("external_billing_id")?
            .map(BillingCustomerId::new)
            .transpose()
            .map_err(|e| corrupt("external_billing_id", e))?,
        external_plan_id: optional("external_plan_id")?
            .map(PlanId::new)
            .transpose()
            .map_err(|e| corrupt("external_plan_id", e))?,
        profile_version: row.try_get("profile_version").map_err(map_sqlx_error)?,
        subscription_version: row
            .try_get("subscription_version")
            .map_err(map_sqlx_error)?,
        revision: u64::try_from(revision).map_err(|e| corrupt("revision", e))?,
        created_at: timestamp("created_at")?,
        updated_at: timestamp("updated_at")?,
    })
}

/// Map a constraint name to the account field it protects
fn constraint_field(constraint: Option<&str>) -> String {
    match constraint {
        Some("user_accounts_pkey") => "external_auth_id",
        Some("user_accounts_billing_key") => "external_billing_id",
        Some("user_accounts_email_key") => "email",
        Some("user_accounts_username_key") => "username",
        Some(other) => other,
        None => "unknown",
    }
    .to_string()
}

fn map_sqlx_error(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            StoreError::UniqueViolation {
                field: constraint_field(db.constraint()),
            }
        }
        _ => StoreError::Unavailable {
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
#[path = "postgres_store_tests.rs"]
mod tests;
