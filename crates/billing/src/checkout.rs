//! Checkout session creation

use std::sync::Arc;

use serde::Serialize;
use stripe::{
    CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, Metadata,
};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{Account, LedgerStore};
use crate::plans::{BillingCycle, CreditPack, Plan};
use crate::webhooks::metadata_keys;

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

/// What a checkout sells and how the resulting webhook should be read
struct CheckoutItem<'a> {
    mode: CheckoutSessionMode,
    price_id: &'a str,
    metadata: Metadata,
    subscription_metadata: Option<Metadata>,
}

pub struct CheckoutService {
    stripe: StripeClient,
    store: Arc<dyn LedgerStore>,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, store: Arc<dyn LedgerStore>) -> Self {
        Self { stripe, store }
    }

    async fn load_account(&self, account_id: Uuid) -> BillingResult<Account> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or(BillingError::AccountNotFound(account_id))
    }

    async fn create_session(
        &self,
        account: &Account,
        item: CheckoutItem<'_>,
    ) -> BillingResult<CheckoutResponse> {
        if item.price_id.is_empty() {
            return Err(BillingError::Config(format!(
                "No Stripe price configured for {} checkout",
                item.mode
            )));
        }

        let app_url = self.stripe.config().app_url.trim_end_matches('/');
        let success_url = format!("{}/billing?checkout=success", app_url);
        let cancel_url = format!("{}/billing?checkout=canceled", app_url);
        let client_reference_id = account.id.to_string();

        let mut metadata = item.metadata;
        metadata.insert(metadata_keys::ACCOUNT_ID.to_string(), account.id.to_string());

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(item.mode);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(item.price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.client_reference_id = Some(&client_reference_id);
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.customer_email = account.email.as_deref();
        params.metadata = Some(metadata);
        params.subscription_data =
            item.subscription_metadata
                .map(|metadata| CreateCheckoutSessionSubscriptionData {
                    metadata: Some(metadata),
                    ..Default::default()
                });

        let session = self.stripe.create_checkout_session(params).await?;

        Ok(CheckoutResponse {
            session_id: session.id.to_string(),
            url: session.url,
        })
    }

    pub async fn create_subscription_checkout(
        &self,
        account_id: Uuid,
        plan: Plan,
        billing_cycle: BillingCycle,
    ) -> BillingResult<CheckoutResponse> {
        let account = self.load_account(account_id).await?;

        if account.is_subscribed {
            return Err(BillingError::InvalidInput(
                "Account already has an active subscription".to_string(),
            ));
        }

        let metadata = Metadata::from([
            (
                metadata_keys::CHECKOUT_TYPE.to_string(),
                metadata_keys::TYPE_SUBSCRIPTION.to_string(),
            ),
            (metadata_keys::PLAN.to_string(), plan.to_string()),
            (
                metadata_keys::BILLING_CYCLE.to_string(),
                billing_cycle.to_string(),
            ),
        ]);
        let subscription_metadata =
            Metadata::from([(metadata_keys::ACCOUNT_ID.to_string(), account_id.to_string())]);

        let response = self
            .create_session(
                &account,
                CheckoutItem {
                    mode: CheckoutSessionMode::Subscription,
                    price_id: self.stripe.config().price_ids.for_plan(plan, billing_cycle),
                    metadata,
                    subscription_metadata: Some(subscription_metadata),
                },
            )
            .await?;

        tracing::info!(
            account_id = %account_id,
            plan = %plan,
            billing_cycle = %billing_cycle,
            session_id = %response.session_id,
            "Subscription checkout session created"
        );

        Ok(response)
    }

    pub async fn create_credit_checkout(
        &self,
        account_id: Uuid,
        pack: CreditPack,
    ) -> BillingResult<CheckoutResponse> {
        let account = self.load_account(account_id).await?;

        let metadata = Metadata::from([
            (
                metadata_keys::CHECKOUT_TYPE.to_string(),
                metadata_keys::TYPE_CREDITS.to_string(),
            ),
            (metadata_keys::CREDIT_PACK.to_string(), pack.to_string()),
        ]);

        let response = self
            .create_session(
                &account,
                CheckoutItem {
                    mode: CheckoutSessionMode::Payment,
                    price_id: self.stripe.config().price_ids.for_pack(pack),
                    metadata,
                    subscription_metadata: None,
                },
            )
            .await?;

        tracing::info!(
            account_id = %account_id,
            pack = %pack,
            session_id = %response.session_id,
            "Credit checkout session created"
        );

        Ok(response)
    }
}
