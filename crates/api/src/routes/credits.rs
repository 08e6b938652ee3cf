//! Balance and credit history

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use mindcanvas_billing::{BillingError, CreditKind, CreditMovement, HistoryPage};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub account_id: Uuid,
    pub credits: i64,
    pub is_subscribed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementResponse {
    pub id: Uuid,
    pub amount: i64,
    pub kind: CreditKind,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<CreditMovement> for MovementResponse {
    fn from(movement: CreditMovement) -> Self {
        Self {
            id: movement.id,
            amount: movement.amount,
            kind: movement.kind,
            description: movement.description,
            created_at: movement.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub page: i64,
    pub page_size: i64,
    pub items: Vec<MovementResponse>,
}

/// GET /api/credits
pub async fn get_balance(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<BalanceResponse>> {
    let account = state
        .billing
        .store
        .get_account(user.account_id)
        .await?
        .ok_or(BillingError::AccountNotFound(user.account_id))?;

    Ok(Json(BalanceResponse {
        account_id: account.id,
        credits: account.credits,
        is_subscribed: account.is_subscribed,
    }))
}

/// GET /api/credits/history?page=&pageSize=
pub async fn get_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let page = HistoryPage::new(query.page, query.page_size);
    let movements = state
        .billing
        .store
        .get_history(user.account_id, page)
        .await?;

    Ok(Json(HistoryResponse {
        page: page.page,
        page_size: page.page_size,
        items: movements.into_iter().map(Into::into).collect(),
    }))
}
