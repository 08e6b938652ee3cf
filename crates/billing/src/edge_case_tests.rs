// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Credit Ledger
//!
//! Boundary conditions and races across the authorizer, the webhook
//! reconciler and the in-memory store:
//! - Concurrent debits against a small balance
//! - Ledger conservation after mixed operations
//! - Subscribed accounts and metering
//! - Concurrent webhook redelivery

#[cfg(test)]
mod concurrency_tests {
    use std::sync::Arc;

    use tokio::sync::Barrier;
    use uuid::Uuid;

    use crate::authorizer::{Authorization, DebitAuthorizer};
    use crate::ledger::{EventClaim, LedgerStore, ReconcileOutcome, SubscriptionActivation};
    use crate::plans::{BillingCycle, Plan};
    use crate::store::InMemoryLedgerStore;

    async fn account_with_balance(store: &InMemoryLedgerStore, target: i64) -> Uuid {
        let account_id = Uuid::new_v4();
        store.register_account(account_id, None).await.unwrap();
        let spend = store.get_balance(account_id).await.unwrap() - target;
        if spend > 0 {
            store.debit(account_id, spend, "setup").await.unwrap();
        }
        account_id
    }

    // =========================================================================
    // One credit left, many concurrent generations: exactly one is charged
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_last_credit_charged_once() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let account_id = account_with_balance(&store, 1).await;
        let authorizer = Arc::new(DebitAuthorizer::new(store.clone()));

        let barrier = Arc::new(Barrier::new(16));
        let mut handles = vec![];
        for _ in 0..16 {
            let authorizer = Arc::clone(&authorizer);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                authorizer.authorize(account_id, 1).await.unwrap()
            }));
        }

        let mut authorized = 0;
        for handle in handles {
            if handle.await.unwrap().is_authorized() {
                authorized += 1;
            }
        }

        assert_eq!(authorized, 1, "Exactly one request may spend the last credit");
        assert_eq!(store.get_balance(account_id).await.unwrap(), 0);
        assert_eq!(store.movement_total(account_id).await, 0);
    }

    // =========================================================================
    // Concurrent debits never overdraw and never lose a charge
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_conserve_balance() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let account_id = account_with_balance(&store, 10).await;
        let authorizer = Arc::new(DebitAuthorizer::new(store.clone()));

        let barrier = Arc::new(Barrier::new(25));
        let mut handles = vec![];
        for _ in 0..25 {
            let authorizer = Arc::clone(&authorizer);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                authorizer.authorize(account_id, 1).await.unwrap()
            }));
        }

        let mut authorized = 0;
        for handle in handles {
            if handle.await.unwrap().is_authorized() {
                authorized += 1;
            }
        }

        assert_eq!(authorized, 10);
        let balance = store.get_balance(account_id).await.unwrap();
        assert_eq!(balance, 0);
        assert_eq!(balance, store.movement_total(account_id).await);
    }

    // =========================================================================
    // The same checkout event delivered concurrently is applied once
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_redelivery_applied_once() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let account_id = account_with_balance(&store, 5).await;

        let barrier = Arc::new(Barrier::new(8));
        let mut handles = vec![];
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store
                    .activate_subscription(
                        &EventClaim::new("evt_same", "checkout.session.completed"),
                        &SubscriptionActivation {
                            account_id,
                            plan: Plan::Premium,
                            billing_cycle: BillingCycle::Monthly,
                            provider_customer_id: None,
                            provider_subscription_id: Some("sub_race".to_string()),
                        },
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap() == ReconcileOutcome::Applied {
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(store.get_balance(account_id).await.unwrap(), 155);
        assert_eq!(store.subscription_count(account_id).await, 1);
        assert_eq!(store.movement_total(account_id).await, 155);
    }

    #[tokio::test]
    async fn test_subscribed_account_is_never_debited() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let account_id = account_with_balance(&store, 0).await;
        store
            .activate_subscription(
                &EventClaim::new("evt_annual", "checkout.session.completed"),
                &SubscriptionActivation {
                    account_id,
                    plan: Plan::Premium,
                    billing_cycle: BillingCycle::Annual,
                    provider_customer_id: None,
                    provider_subscription_id: Some("sub_annual".to_string()),
                },
            )
            .await
            .unwrap();

        let authorizer = DebitAuthorizer::new(store.clone());
        for _ in 0..50 {
            let result = authorizer.authorize(account_id, 1).await.unwrap();
            assert_eq!(result, Authorization::Authorized { balance_after: None });
        }

        assert_eq!(store.get_balance(account_id).await.unwrap(), 1800);
        assert_eq!(store.movement_total(account_id).await, 1800);
    }
}

#[cfg(test)]
mod ledger_tests {
    use std::sync::Arc;

    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::authorizer::DebitAuthorizer;
    use crate::ledger::{
        CreditKind, CreditPurchase, EventClaim, HistoryPage, LedgerStore, ReconcileOutcome,
        SubscriptionActivation, MAX_HISTORY_PAGE_SIZE,
    };
    use crate::plans::{BillingCycle, CreditPack, Plan};
    use crate::store::InMemoryLedgerStore;

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = InMemoryLedgerStore::new();
        let account_id = Uuid::new_v4();

        store.register_account(account_id, Some("a@example.com")).await.unwrap();
        store.debit(account_id, 3, "use").await.unwrap();
        let again = store.register_account(account_id, None).await.unwrap();

        assert_eq!(again.credits, 7);
        assert_eq!(store.movement_total(account_id).await, 7);
    }

    #[tokio::test]
    async fn test_history_is_newest_first_and_paginated() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let account_id = Uuid::new_v4();
        store.register_account(account_id, None).await.unwrap();
        let authorizer = DebitAuthorizer::new(store.clone());
        for _ in 0..4 {
            authorizer.authorize(account_id, 1).await.unwrap();
        }
        store
            .purchase_credits(
                &EventClaim::new("evt_pack", "checkout.session.completed"),
                &CreditPurchase {
                    account_id,
                    pack: CreditPack::Medium,
                },
            )
            .await
            .unwrap();

        let first = store
            .get_history(account_id, HistoryPage::new(Some(1), Some(2)))
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].kind, CreditKind::Purchase);
        assert_eq!(first[1].kind, CreditKind::Usage);

        let last = store
            .get_history(account_id, HistoryPage::new(Some(3), Some(2)))
            .await
            .unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last[1].kind, CreditKind::Welcome);

        let beyond = store
            .get_history(account_id, HistoryPage::new(Some(9), Some(2)))
            .await
            .unwrap();
        assert!(beyond.is_empty());

        let far_beyond = store
            .get_history(account_id, HistoryPage::new(Some(i64::MAX), Some(100)))
            .await
            .unwrap();
        assert!(far_beyond.is_empty());
    }

    #[test]
    fn test_history_page_clamped() {
        let page = HistoryPage::new(Some(0), Some(10_000));
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, MAX_HISTORY_PAGE_SIZE);
        assert_eq!(page.offset(), 0);
    }

    #[tokio::test]
    async fn test_new_subscription_supersedes_active_one() {
        let store = InMemoryLedgerStore::new();
        let account_id = Uuid::new_v4();
        store.register_account(account_id, None).await.unwrap();

        for (event, cycle, sub) in [
            ("evt_1", BillingCycle::Monthly, "sub_1"),
            ("evt_2", BillingCycle::Annual, "sub_2"),
        ] {
            let outcome = store
                .activate_subscription(
                    &EventClaim::new(event, "checkout.session.completed"),
                    &SubscriptionActivation {
                        account_id,
                        plan: Plan::Premium,
                        billing_cycle: cycle,
                        provider_customer_id: None,
                        provider_subscription_id: Some(sub.to_string()),
                    },
                )
                .await
                .unwrap();
            assert_eq!(outcome, ReconcileOutcome::Applied);
        }

        let current = store.current_subscription(account_id).await.unwrap().unwrap();
        assert_eq!(current.billing_cycle, BillingCycle::Annual);
        assert!(current.is_active());
        assert_eq!(store.subscription_count(account_id).await, 2);
        assert_eq!(store.get_balance(account_id).await.unwrap(), 10 + 150 + 1800);

        // Deleting the superseded subscription leaves entitlement intact
        let outcome = store
            .cancel_subscription(
                &EventClaim::new("evt_del_1", "customer.subscription.deleted"),
                "sub_1",
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Ignored);
        assert!(store.get_account(account_id).await.unwrap().unwrap().is_subscribed);
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_claims() {
        let store = InMemoryLedgerStore::new();
        let account_id = Uuid::new_v4();
        store.register_account(account_id, None).await.unwrap();
        let claim = EventClaim::new("evt_recent", "checkout.session.completed");
        let purchase = CreditPurchase {
            account_id,
            pack: CreditPack::Small,
        };
        store.purchase_credits(&claim, &purchase).await.unwrap();

        let pruned = store
            .prune_processed_events(OffsetDateTime::now_utc() - time::Duration::days(90))
            .await
            .unwrap();
        assert_eq!(pruned, 0);
        assert_eq!(
            store.purchase_credits(&claim, &purchase).await.unwrap(),
            ReconcileOutcome::Duplicate
        );

        let pruned = store
            .prune_processed_events(OffsetDateTime::now_utc() + time::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
    }
}
