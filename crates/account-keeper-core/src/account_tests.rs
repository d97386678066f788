//! Tests for [`UserAccount`] and [`SubscriptionState`].

use super::*;

fn account() -> UserAccount {
    UserAccount::new(
        AuthUserId::new("u1").unwrap(),
        ProfileFields::with_email(EmailAddress::new("a@b.com").unwrap()),
        Some(1_000),
    )
}

mod subscription_state_tests {
    use super::*;

    #[test]
    fn test_only_active_is_subscribed() {
        for state in [
            SubscriptionState::None,
            SubscriptionState::Active,
            SubscriptionState::PastDue,
            SubscriptionState::Canceled,
        ] {
            assert_eq!(
                state.is_subscribed(),
                state == SubscriptionState::Active,
                "unexpected is_subscribed for {state}"
            );
        }
    }

    #[test]
    fn test_provider_status_mapping() {
        let cases = [
            ("active", SubscriptionState::Active),
            ("trialing", SubscriptionState::Active),
            ("past_due", SubscriptionState::PastDue),
            ("unpaid", SubscriptionState::PastDue),
            ("canceled", SubscriptionState::Canceled),
            ("incomplete_expired", SubscriptionState::Canceled),
            ("incomplete", SubscriptionState::None),
            ("paused", SubscriptionState::None),
        ];
        for (status, expected) in cases {
            assert_eq!(
                SubscriptionState::from_provider_status(status),
                Some(expected),
                "status {status}"
            );
        }
    }

    #[test]
    fn test_unknown_provider_status_is_not_guessed() {
        assert_eq!(SubscriptionState::from_provider_status("exploded"), None);
        assert_eq!(SubscriptionState::from_provider_status(""), None);
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in [
            SubscriptionState::None,
            SubscriptionState::Active,
            SubscriptionState::PastDue,
            SubscriptionState::Canceled,
        ] {
            assert_eq!(state.as_str().parse::<SubscriptionState>().unwrap(), state);
        }
    }
}

mod account_tests {
    use super::*;

    #[test]
    fn test_new_account_is_not_subscribed() {
        let account = account();
        assert_eq!(account.subscription_state, SubscriptionState::None);
        assert!(!account.is_subscribed());
        assert!(!account.is_deleted());
        assert_eq!(account.revision, 0);
    }

    #[test]
    fn test_stale_profile_update_is_discarded() {
        let mut account = account();
        let mut profile = ProfileFields::with_email(EmailAddress::new("new@b.com").unwrap());
        profile.first_name = Some("Ada".to_string());

        assert!(!account.apply_profile(profile.clone(), Some(999)));
        assert_eq!(account.email.as_str(), "a@b.com");

        assert!(account.apply_profile(profile, Some(1_001)));
        assert_eq!(account.email.as_str(), "new@b.com");
        assert_eq!(account.profile_version, Some(1_001));
    }

    #[test]
    fn test_link_billing_is_assigned_once() {
        let mut account = account();
        let c1 = BillingCustomerId::new("cus_1").unwrap();
        let c2 = BillingCustomerId::new("cus_2").unwrap();

        assert_eq!(account.link_billing(&c1), Ok(true));
        assert_eq!(account.link_billing(&c1), Ok(false));

        let conflict = account.link_billing(&c2).unwrap_err();
        assert_eq!(conflict.existing, c1);
        assert_eq!(account.external_billing_id, Some(c1));
    }

    #[test]
    fn test_subscription_versions_are_last_writer_wins() {
        let mut account = account();
        let plan = PlanId::new("price_pro").unwrap();

        assert!(account.apply_subscription(SubscriptionState::Canceled, None, Some(20)));
        // Older event arriving late must not resurrect the subscription.
        assert!(!account.apply_subscription(SubscriptionState::Active, Some(plan), Some(10)));

        assert_eq!(account.subscription_state, SubscriptionState::Canceled);
        assert_eq!(account.external_plan_id, None);
        assert_eq!(account.subscription_version, Some(20));
    }

    #[test]
    fn test_equal_subscription_version_is_applied() {
        let mut account = account();
        assert!(account.apply_subscription(SubscriptionState::Active, None, Some(10)));
        assert!(account.apply_subscription(SubscriptionState::PastDue, None, Some(10)));
        assert_eq!(account.subscription_state, SubscriptionState::PastDue);
    }

    #[test]
    fn test_missing_plan_keeps_previous_plan() {
        let mut account = account();
        let plan = PlanId::new("price_basic").unwrap();
        account.apply_subscription(SubscriptionState::Active, Some(plan.clone()), Some(1));
        account.apply_subscription(SubscriptionState::PastDue, None, Some(2));
        assert_eq!(account.external_plan_id, Some(plan));
    }

    #[test]
    fn test_mark_deleted_without_cascade_keeps_subscription() {
        let mut account = account();
        account.apply_subscription(SubscriptionState::Active, None, Some(1));
        account.mark_deleted(false);

        assert!(account.is_deleted());
        assert!(account.is_subscribed());
    }

    #[test]
    fn test_mark_deleted_with_cascade_cancels_live_subscription() {
        let mut account = account();
        account.link_billing(&BillingCustomerId::new("cus_1").unwrap()).unwrap();
        account.apply_subscription(SubscriptionState::PastDue, None, Some(1));
        account.mark_deleted(true);

        assert_eq!(account.subscription_state, SubscriptionState::Canceled);
        assert!(!account.is_subscribed());
        assert!(account.external_billing_id.is_some(), "billing history kept");
    }
}
