//! Subscription management

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerStore, SubscriptionRecord};
use crate::retry::retry_on_conflict;

/// Entitlement view of one account
#[derive(Debug, Clone, Serialize)]
pub struct EntitlementSummary {
    pub account_id: Uuid,
    pub credits: i64,
    pub is_subscribed: bool,
    pub subscription: Option<SubscriptionRecord>,
}

pub struct SubscriptionService {
    stripe: StripeClient,
    store: Arc<dyn LedgerStore>,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, store: Arc<dyn LedgerStore>) -> Self {
        Self { stripe, store }
    }

    /// Current entitlement: balance, subscribed flag and the active
    /// subscription if any
    pub async fn status(&self, account_id: Uuid) -> BillingResult<EntitlementSummary> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(BillingError::AccountNotFound(account_id))?;

        let subscription = self.store.current_subscription(account_id).await?;

        Ok(EntitlementSummary {
            account_id,
            credits: account.credits,
            is_subscribed: account.is_subscribed,
            subscription,
        })
    }

    /// Cancel the account's active subscription immediately.
    ///
    /// The provider is told first; the local record is only marked canceled
    /// once the provider call succeeds. The `customer.subscription.deleted`
    /// webhook that follows finds the record already canceled and is a no-op.
    /// Credits are left untouched.
    pub async fn cancel(&self, account_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let current = self
            .store
            .current_subscription(account_id)
            .await?
            .filter(SubscriptionRecord::is_active)
            .ok_or(BillingError::SubscriptionNotFound(account_id))?;

        if let Some(provider_id) = current.provider_subscription_id.as_deref() {
            self.stripe.cancel_subscription(provider_id).await?;
        }

        let ended_at = OffsetDateTime::now_utc();
        let canceled = retry_on_conflict("cancel_subscription", || {
            self.store.cancel_account_subscription(account_id, ended_at)
        })
        .await?
        .ok_or(BillingError::SubscriptionNotFound(account_id))?;

        tracing::info!(
            account_id = %account_id,
            subscription_id = %canceled.id,
            "Cancelled subscription"
        );

        Ok(canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_client;
    use crate::fixtures;
    use crate::ledger::{EventClaim, SubscriptionActivation, SubscriptionStatus};
    use crate::plans::{BillingCycle, Plan};
    use crate::store::InMemoryLedgerStore;

    async fn subscribed_account(store: &InMemoryLedgerStore) -> Uuid {
        let account_id = Uuid::new_v4();
        store.register_account(account_id, None).await.unwrap();
        store
            .activate_subscription(
                &EventClaim::new("evt_sub", "checkout.session.completed"),
                &SubscriptionActivation {
                    account_id,
                    plan: Plan::Premium,
                    billing_cycle: BillingCycle::Monthly,
                    provider_customer_id: Some("cus_1".to_string()),
                    provider_subscription_id: Some("sub_1".to_string()),
                },
            )
            .await
            .unwrap();
        account_id
    }

    #[tokio::test]
    async fn test_status_reports_active_subscription() {
        let server = mockito::Server::new_async().await;
        let store = Arc::new(InMemoryLedgerStore::new());
        let account_id = subscribed_account(&store).await;

        let service = SubscriptionService::new(test_client(&server.url()), store);
        let summary = service.status(account_id).await.unwrap();

        assert!(summary.is_subscribed);
        assert_eq!(summary.credits, 160);
        let sub = summary.subscription.unwrap();
        assert_eq!(sub.billing_cycle, BillingCycle::Monthly);
        assert!(sub.is_active());
    }

    #[tokio::test]
    async fn test_cancel_calls_provider_and_keeps_credits() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/v1/subscriptions/sub_1")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                fixtures::subscription("sub_1", "cus_1", "canceled", serde_json::json!({}))
                    .to_string(),
            )
            .create_async()
            .await;

        let store = Arc::new(InMemoryLedgerStore::new());
        let account_id = subscribed_account(&store).await;
        let service = SubscriptionService::new(test_client(&server.url()), store.clone());

        let canceled = service.cancel(account_id).await.unwrap();
        mock.assert_async().await;

        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert!(canceled.end_date.is_some());
        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert!(!account.is_subscribed);
        assert_eq!(account.credits, 160);
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_subscription_active() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/v1/subscriptions/sub_1")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .with_body(fixtures::error_body("api_error", "boom"))
            .create_async()
            .await;

        let store = Arc::new(InMemoryLedgerStore::new());
        let account_id = subscribed_account(&store).await;
        let service = SubscriptionService::new(test_client(&server.url()), store.clone());

        assert!(matches!(
            service.cancel(account_id).await,
            Err(BillingError::ProviderApi(_))
        ));
        assert!(store.get_account(account_id).await.unwrap().unwrap().is_subscribed);
    }

    #[tokio::test]
    async fn test_cancel_without_subscription() {
        let server = mockito::Server::new_async().await;
        let store = Arc::new(InMemoryLedgerStore::new());
        let account_id = Uuid::new_v4();
        store.register_account(account_id, None).await.unwrap();
        let service = SubscriptionService::new(test_client(&server.url()), store);

        assert!(matches!(
            service.cancel(account_id).await,
            Err(BillingError::SubscriptionNotFound(_))
        ));
    }
}
