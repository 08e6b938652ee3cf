//! Stripe API client
//!
//! Wraps the `async-stripe` client together with the price ids and redirect
//! settings the billing services need.

use std::sync::Arc;

use stripe::{
    CancelSubscription, CheckoutSession, Client, CreateCheckoutSession, StripeError,
    Subscription, SubscriptionId,
};

use crate::error::{BillingError, BillingResult};
use crate::plans::{BillingCycle, CreditPack, Plan};
use crate::webhooks::DEFAULT_TOLERANCE_SECS;

pub const DEFAULT_API_BASE: &str = "https://api.stripe.com/";

/// Stripe price ids per purchasable item
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub premium_monthly: String,
    pub premium_annual: String,
    pub credits_small: String,
    pub credits_medium: String,
    pub credits_large: String,
}

impl PriceIds {
    pub fn for_plan(&self, plan: Plan, cycle: BillingCycle) -> &str {
        match (plan, cycle) {
            (Plan::Premium, BillingCycle::Monthly) => &self.premium_monthly,
            (Plan::Premium, BillingCycle::Annual) => &self.premium_annual,
        }
    }

    pub fn for_pack(&self, pack: CreditPack) -> &str {
        match pack {
            CreditPack::Small => &self.credits_small,
            CreditPack::Medium => &self.credits_medium,
            CreditPack::Large => &self.credits_large,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_base: String,
    /// Public app URL used for checkout redirects
    pub app_url: String,
    pub webhook_tolerance_secs: i64,
    pub price_ids: PriceIds,
}

fn required_env(name: &str) -> BillingResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| BillingError::Config(format!("{} must be set", name)))
}

fn optional_env(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let webhook_tolerance_secs = match std::env::var("WEBHOOK_TOLERANCE_SECS") {
            Ok(v) => v.parse().map_err(|_| {
                BillingError::Config("WEBHOOK_TOLERANCE_SECS must be an integer".to_string())
            })?,
            Err(_) => DEFAULT_TOLERANCE_SECS,
        };

        Ok(Self {
            secret_key: required_env("STRIPE_SECRET_KEY")?,
            webhook_secret: required_env("STRIPE_WEBHOOK_SECRET")?,
            api_base: std::env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            app_url: std::env::var("APP_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            webhook_tolerance_secs,
            price_ids: PriceIds {
                premium_monthly: optional_env("STRIPE_PRICE_MONTHLY"),
                premium_annual: optional_env("STRIPE_PRICE_ANNUAL"),
                credits_small: optional_env("STRIPE_PRICE_CREDITS_SMALL"),
                credits_medium: optional_env("STRIPE_PRICE_CREDITS_MEDIUM"),
                credits_large: optional_env("STRIPE_PRICE_CREDITS_LARGE"),
            },
        })
    }
}

#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> BillingResult<Self> {
        // Client::from_url panics on an unparseable base
        reqwest::Url::parse(&config.api_base).map_err(|e| {
            BillingError::Config(format!("Invalid STRIPE_API_BASE '{}': {}", config.api_base, e))
        })?;

        Ok(Self {
            inner: Client::from_url(config.api_base.as_str(), config.secret_key.as_str()),
            config: Arc::new(config),
        })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(StripeConfig::from_env()?)
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    pub async fn create_checkout_session(
        &self,
        params: CreateCheckoutSession<'_>,
    ) -> BillingResult<CheckoutSession> {
        CheckoutSession::create(&self.inner, params)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Stripe checkout session creation failed");
                e.into()
            })
    }

    /// Cancel immediately. A subscription Stripe no longer knows about is
    /// treated as already canceled.
    pub async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let sub_id: SubscriptionId = subscription_id.parse().map_err(|_| {
            BillingError::InvalidInput(format!("Invalid subscription id '{}'", subscription_id))
        })?;

        match Subscription::cancel(&self.inner, &sub_id, CancelSubscription::new()).await {
            Ok(subscription) => {
                tracing::debug!(
                    subscription_id = %subscription.id,
                    status = %subscription.status,
                    "Stripe subscription canceled"
                );
                Ok(())
            }
            Err(StripeError::Stripe(err)) if err.http_status == 404 => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    "Stripe has no such subscription, treating as canceled"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config(api_base: &str) -> StripeConfig {
    StripeConfig {
        secret_key: "sk_test_123".to_string(),
        webhook_secret: "whsec_test".to_string(),
        api_base: api_base.to_string(),
        app_url: "https://app.example.com".to_string(),
        webhook_tolerance_secs: DEFAULT_TOLERANCE_SECS,
        price_ids: PriceIds {
            premium_monthly: "price_monthly".to_string(),
            premium_annual: "price_annual".to_string(),
            credits_small: "price_small".to_string(),
            credits_medium: "price_medium".to_string(),
            credits_large: "price_large".to_string(),
        },
    }
}

#[cfg(test)]
pub(crate) fn test_client(api_base: &str) -> StripeClient {
    StripeClient::new(test_config(api_base)).unwrap()
}
