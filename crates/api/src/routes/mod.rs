//! HTTP routes

pub mod accounts;
pub mod billing;
pub mod credits;
pub mod generations;
pub mod health;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::{auth::require_auth, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/accounts", post(accounts::register))
        .route("/api/account", get(accounts::get_account))
        .route("/api/credits", get(credits::get_balance))
        .route("/api/credits/history", get(credits::get_history))
        .route("/api/generations", post(generations::create_generation))
        .route("/api/billing/checkout", post(billing::create_checkout))
        .route("/api/billing/subscription", get(billing::get_subscription))
        .route(
            "/api/billing/subscription/cancel",
            post(billing::cancel_subscription),
        )
        .layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    let public = Router::new()
        .route("/health", get(health::health))
        .route("/api/webhooks/stripe", post(webhooks::stripe_webhook));

    Router::new()
        .merge(protected)
        .merge(public)
        .with_state(state)
}
