//! Checkout and subscription management

use axum::{extract::State, Extension, Json};
use mindcanvas_billing::{BillingCycle, CheckoutResponse, CreditPack, Plan};
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthUser,
    error::ApiResult,
    routes::accounts::{AccountResponse, SubscriptionResponse},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CheckoutRequest {
    Subscription {
        #[serde(default)]
        plan: Option<String>,
        #[serde(rename = "billingCycle")]
        billing_cycle: String,
    },
    Credits {
        pack: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSessionResponse {
    pub session_id: String,
    pub url: Option<String>,
}

impl From<CheckoutResponse> for CheckoutSessionResponse {
    fn from(response: CheckoutResponse) -> Self {
        Self {
            session_id: response.session_id,
            url: response.url,
        }
    }
}

/// POST /api/billing/checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutSessionResponse>> {
    let response = match request {
        CheckoutRequest::Subscription {
            plan,
            billing_cycle,
        } => {
            let plan = match plan {
                Some(p) => p.parse::<Plan>()?,
                None => Plan::Premium,
            };
            let cycle = billing_cycle.parse::<BillingCycle>()?;
            state
                .billing
                .checkout
                .create_subscription_checkout(user.account_id, plan, cycle)
                .await?
        }
        CheckoutRequest::Credits { pack } => {
            let pack = pack.parse::<CreditPack>()?;
            state
                .billing
                .checkout
                .create_credit_checkout(user.account_id, pack)
                .await?
        }
    };

    Ok(Json(response.into()))
}

/// GET /api/billing/subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<AccountResponse>> {
    let summary = state.billing.subscriptions.status(user.account_id).await?;

    Ok(Json(AccountResponse {
        account_id: summary.account_id,
        email: user.email,
        credits: summary.credits,
        is_subscribed: summary.is_subscribed,
        subscription: summary.subscription.map(Into::into),
    }))
}

/// POST /api/billing/subscription/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let canceled = state.billing.subscriptions.cancel(user.account_id).await?;
    Ok(Json(canceled.into()))
}
