//! Tests for the PostgreSQL account store.
//!
//! Tests touching a database run only when `DATABASE_URL` is set and return
//! early otherwise.

use super::*;
use crate::account::{AccountStatus, ProfileFields, SubscriptionState};

fn unique(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

fn account(auth_id: &str, email: &str) -> UserAccount {
    let mut profile = ProfileFields::with_email(EmailAddress::new(email).unwrap());
    profile.username = Some(auth_id.to_string());
    profile.first_name = Some("Ada".to_string());
    UserAccount::new(AuthUserId::new(auth_id).unwrap(), profile, Some(1_000))
}

fn applied(event_id: &str) -> AppliedEvent {
    AppliedEvent {
        provider: ProviderKind::Billing,
        event_id: EventId::new(event_id).unwrap(),
        event_type: "customer.subscription.updated".to_string(),
        auth_id: None,
        outcome: "applied".to_string(),
        applied_at: Timestamp::now(),
    }
}

async fn connect() -> Option<PostgresAccountStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let store = PostgresAccountStore::connect(&url, 2, Duration::from_secs(5))
        .await
        .unwrap();
    store.ensure_schema().await.unwrap();
    Some(store)
}

async fn insert(store: &PostgresAccountStore, account: UserAccount) -> UserAccount {
    match store
        .commit(Commit::with_write(
            applied(&unique("evt")),
            AccountWrite::Insert(account),
        ))
        .await
        .unwrap()
    {
        CommitResult::Committed(Some(stored)) => stored,
        other => panic!("unexpected commit result {:?}", other),
    }
}

// ============================================================================
// Error mapping
// ============================================================================

mod error_mapping_tests {
    use super::*;

    #[test]
    fn test_constraint_names_map_to_account_fields() {
        assert_eq!(constraint_field(Some("user_accounts_pkey")), "external_auth_id");
        assert_eq!(
            constraint_field(Some("user_accounts_billing_key")),
            "external_billing_id"
        );
        assert_eq!(constraint_field(Some("user_accounts_email_key")), "email");
        assert_eq!(constraint_field(Some("user_accounts_username_key")), "username");
        assert_eq!(constraint_field(Some("other_key")), "other_key");
        assert_eq!(constraint_field(None), "unknown");
    }

    #[test]
    fn test_driver_failures_are_unavailable() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable { .. }
        ));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            StoreError::Unavailable { .. }
        ));
    }

    #[test]
    fn test_revision_beyond_bigint_is_rejected() {
        assert_eq!(revision_to_db(7).unwrap(), 7);
        assert!(matches!(
            revision_to_db(u64::MAX),
            Err(StoreError::Unavailable { .. })
        ));
    }

    #[test]
    fn test_schema_keeps_email_unique_among_active_accounts_only() {
        assert!(SCHEMA[1].contains("WHERE status = 'active'"));
        assert!(SCHEMA[2].contains("WHERE status = 'active'"));
        assert!(SCHEMA[3].contains("PRIMARY KEY (provider, event_id)"));
    }
}

// ============================================================================
// Database tests
// ============================================================================

mod database_tests {
    use super::*;

    #[tokio::test]
    async fn test_inserted_account_reads_back_by_every_key() {
        let Some(store) = connect().await else {
            return;
        };
        let auth_id = unique("user");
        let email = format!("{}@example.com", auth_id);
        let mut candidate = account(&auth_id, &email);
        candidate.external_billing_id = Some(BillingCustomerId::new(unique("cus")).unwrap());

        let stored = insert(&store, candidate).await;
        assert_eq!(stored.revision, 1);

        let by_auth = store
            .find_by_auth_id(&stored.external_auth_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_auth.email, stored.email);
        assert_eq!(by_auth.username, stored.username);
        assert_eq!(by_auth.first_name.as_deref(), Some("Ada"));
        assert_eq!(by_auth.status, AccountStatus::Active);
        assert_eq!(by_auth.subscription_state, SubscriptionState::None);
        assert_eq!(by_auth.profile_version, Some(1_000));
        assert_eq!(by_auth.revision, 1);
        assert_eq!(
            by_auth.created_at.unix_seconds(),
            stored.created_at.unix_seconds()
        );

        let billing_id = stored.external_billing_id.clone().unwrap();
        let by_billing = store.find_by_billing_id(&billing_id).await.unwrap().unwrap();
        assert_eq!(by_billing.external_auth_id, stored.external_auth_id);

        let by_email = store.find_by_email(&stored.email).await.unwrap();
        assert_eq!(by_email.len(), 1);
    }

    #[tokio::test]
    async fn test_update_with_stale_revision_is_conflict() {
        let Some(store) = connect().await else {
            return;
        };
        let auth_id = unique("user");
        let stored = insert(&store, account(&auth_id, &format!("{}@example.com", auth_id))).await;

        let mut first = stored.clone();
        first.apply_subscription(SubscriptionState::Active, None, Some(10));
        let result = store
            .commit(Commit::with_write(
                applied(&unique("evt")),
                AccountWrite::Update {
                    account: first,
                    expected_revision: 1,
                },
            ))
            .await
            .unwrap();
        assert!(matches!(result, CommitResult::Committed(Some(ref a)) if a.revision == 2));

        let mut second = stored;
        second.apply_subscription(SubscriptionState::Canceled, None, Some(11));
        let event = applied(&unique("evt"));
        let result = store
            .commit(Commit::with_write(
                event.clone(),
                AccountWrite::Update {
                    account: second,
                    expected_revision: 1,
                },
            ))
            .await;
        assert!(matches!(result, Err(StoreError::Conflict { expected: 1, .. })));

        // The failed transaction left no applied-event row behind
        assert!(!store
            .is_applied(event.provider, &event.event_id)
            .await
            .unwrap());
        let current = store
            .find_by_auth_id(&AuthUserId::new(&auth_id).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.subscription_state, SubscriptionState::Active);
    }

    #[tokio::test]
    async fn test_second_commit_of_same_event_is_already_applied() {
        let Some(store) = connect().await else {
            return;
        };
        let event = applied(&unique("evt"));

        let first = store.commit(Commit::record_only(event.clone())).await.unwrap();
        let second = store.commit(Commit::record_only(event.clone())).await.unwrap();

        assert_eq!(first, CommitResult::Committed(None));
        assert_eq!(second, CommitResult::AlreadyApplied);
        assert!(store.is_applied(event.provider, &event.event_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_auth_id_insert_is_unique_violation() {
        let Some(store) = connect().await else {
            return;
        };
        let auth_id = unique("user");
        insert(&store, account(&auth_id, &format!("{}@example.com", auth_id))).await;

        let result = store
            .commit(Commit::with_write(
                applied(&unique("evt")),
                AccountWrite::Insert(account(&auth_id, &format!("other_{}@example.com", auth_id))),
            ))
            .await;

        assert_eq!(
            result,
            Err(StoreError::UniqueViolation {
                field: "external_auth_id".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_health_check_succeeds_on_live_pool() {
        let Some(store) = connect().await else {
            return;
        };
        assert!(store.health_check().await.is_ok());
    }
}
