//! Paid image generation

use axum::{extract::State, http::StatusCode, Extension, Json};
use mindcanvas_billing::GENERATION_COST;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::ApiResult,
    generation::{record_generation, validate_prompt},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    pub generation_id: Option<Uuid>,
    pub prediction_id: String,
    pub status: String,
    /// `None` for subscribed accounts
    pub credits_remaining: Option<i64>,
}

/// POST /api/generations
///
/// Charges one credit before contacting the provider. A denied debit returns
/// 402 and the provider is never called.
pub async fn create_generation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<GenerationRequest>,
) -> ApiResult<(StatusCode, Json<GenerationResponse>)> {
    let prompt = validate_prompt(&request.prompt)?;

    let credits_remaining = state
        .billing
        .authorizer
        .authorize(user.account_id, GENERATION_COST)
        .await?
        .into_result(GENERATION_COST)?;

    let prediction = state.generator.create_prediction(prompt).await?;

    let generation_id =
        match record_generation(&state.pool, user.account_id, prompt, &prediction).await {
            Ok(record) => Some(record.id),
            Err(e) => {
                tracing::error!(
                    account_id = %user.account_id,
                    prediction_id = %prediction.id,
                    error = ?e,
                    "Failed to record generation"
                );
                None
            }
        };

    tracing::info!(
        account_id = %user.account_id,
        prediction_id = %prediction.id,
        "Generation started"
    );

    Ok((
        StatusCode::CREATED,
        Json(GenerationResponse {
            generation_id,
            prediction_id: prediction.id,
            status: prediction.status,
            credits_remaining,
        }),
    ))
}
