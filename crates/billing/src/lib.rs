// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! MindCanvas Billing Module
//!
//! Credit ledger and entitlement reconciliation.
//!
//! ## Features
//!
//! - **Ledger**: Append-only credit movements with a cached per-account balance
//! - **Debit Authorization**: Atomic check-and-debit for paid actions
//! - **Subscriptions**: Premium plan status and cancellation
//! - **Checkout**: Stripe checkout sessions for plans and credit packs
//! - **Webhooks**: Verified, idempotent reconciliation of Stripe events
//! - **Invariants**: Read-only consistency checks over the ledger tables

pub mod authorizer;
pub mod checkout;
pub mod client;
pub mod error;
#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;
pub mod invariants;
pub mod ledger;
pub mod plans;
pub mod retry;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

// Authorizer
pub use authorizer::{Authorization, DebitAuthorizer, DenialReason, GENERATION_COST};

// Checkout
pub use checkout::{CheckoutResponse, CheckoutService};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{
    Account, CreditKind, CreditMovement, HistoryPage, LedgerStore, ReconcileOutcome,
    SubscriptionRecord, SubscriptionStatus, WELCOME_CREDITS,
};

// Plans
pub use plans::{BillingCycle, CreditPack, Plan, PlanTerms};

// Store
pub use store::{InMemoryLedgerStore, PgLedgerStore};

// Subscriptions
pub use subscriptions::{EntitlementSummary, SubscriptionService};

// Webhooks
pub use webhooks::{ReconcileEvent, WebhookHandler};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub store: Arc<dyn LedgerStore>,
    pub authorizer: DebitAuthorizer,
    pub checkout: CheckoutService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a Postgres-backed billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_client(stripe, Arc::new(PgLedgerStore::new(pool))))
    }

    /// Create a new billing service with explicit config and store
    pub fn new(config: StripeConfig, store: Arc<dyn LedgerStore>) -> BillingResult<Self> {
        Ok(Self::with_client(StripeClient::new(config)?, store))
    }

    fn with_client(stripe: StripeClient, store: Arc<dyn LedgerStore>) -> Self {
        let config = stripe.config();
        let webhooks = WebhookHandler::new(store.clone(), config.webhook_secret.clone())
            .with_tolerance(config.webhook_tolerance_secs);

        Self {
            authorizer: DebitAuthorizer::new(store.clone()),
            checkout: CheckoutService::new(stripe.clone(), store.clone()),
            subscriptions: SubscriptionService::new(stripe, store.clone()),
            webhooks,
            store,
        }
    }
}
