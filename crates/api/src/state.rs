//! Application state

use std::sync::Arc;

use mindcanvas_billing::{BillingResult, BillingService};
use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
    generation::GenerationClient,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
    pub generator: GenerationClient,
}

impl AppState {
    /// Build state with the Postgres-backed billing service configured from
    /// the environment
    pub fn new(pool: PgPool, config: Config) -> BillingResult<Self> {
        let billing = BillingService::from_env(pool.clone())?;
        tracing::info!("Stripe billing service initialized");
        Ok(Self::with_billing(pool, config, billing))
    }

    pub fn with_billing(pool: PgPool, config: Config, billing: BillingService) -> Self {
        Self {
            jwt_manager: JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours),
            generator: GenerationClient::new(config.generation.clone()),
            billing: Arc::new(billing),
            pool,
            config,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }
}
