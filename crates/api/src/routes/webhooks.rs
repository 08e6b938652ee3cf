//! Stripe webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use mindcanvas_billing::ReconcileOutcome;
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// POST /api/webhooks/stripe
///
/// The body must be the exact bytes Stripe sent, so it is taken as a string
/// and verified before any parsing. Any non-2xx response makes Stripe retry.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::SignatureInvalid)?;

    let outcome = state
        .billing
        .webhooks
        .handle(&body, signature)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "Stripe webhook rejected");
            ApiError::from(e)
        })?;

    let outcome = match outcome {
        ReconcileOutcome::Applied => "applied",
        ReconcileOutcome::Duplicate => "duplicate",
        ReconcileOutcome::Ignored => "ignored",
    };

    Ok(Json(json!({ "received": true, "outcome": outcome })))
}
