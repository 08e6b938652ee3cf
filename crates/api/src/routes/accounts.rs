//! Account provisioning and entitlement view

use axum::{extract::State, Extension, Json};
use mindcanvas_billing::{BillingCycle, Plan, SubscriptionRecord, SubscriptionStatus};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub id: Uuid,
    pub plan: Plan,
    pub billing_cycle: BillingCycle,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
}

impl From<SubscriptionRecord> for SubscriptionResponse {
    fn from(record: SubscriptionRecord) -> Self {
        Self {
            id: record.id,
            plan: record.plan,
            billing_cycle: record.billing_cycle,
            status: record.status,
            start_date: record.start_date,
            end_date: record.end_date,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub account_id: Uuid,
    pub email: Option<String>,
    pub credits: i64,
    pub is_subscribed: bool,
    pub subscription: Option<SubscriptionResponse>,
}

/// POST /api/accounts
///
/// Provisions the caller's account with the welcome bonus. Calling it again
/// returns the existing account unchanged.
pub async fn register(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<AccountResponse>> {
    let account = state
        .billing
        .store
        .register_account(user.account_id, user.email.as_deref())
        .await?;

    tracing::info!(account_id = %account.id, credits = account.credits, "Account provisioned");

    let subscription = state.billing.store.current_subscription(account.id).await?;

    Ok(Json(AccountResponse {
        account_id: account.id,
        email: account.email,
        credits: account.credits,
        is_subscribed: account.is_subscribed,
        subscription: subscription.map(Into::into),
    }))
}

/// GET /api/account
pub async fn get_account(
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
