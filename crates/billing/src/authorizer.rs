//! Debit authorization for credit-consuming actions
//!
//! `authorize` is the only gate a paid action may rely on. `check` exists for
//! display purposes and can be stale by the time the action runs.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{DebitOutcome, LedgerStore};
use crate::retry::retry_on_conflict;

/// Credits charged per image generation
pub const GENERATION_COST: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    InsufficientCredits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Authorization {
    /// The action may proceed. `balance_after` is `None` for subscribed
    /// accounts, which are not metered.
    Authorized { balance_after: Option<i64> },
    Denied { reason: DenialReason, balance: i64 },
}

impl Authorization {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Authorization::Authorized { .. })
    }

    /// Convert a denial into an error for `?`-style callers
    pub fn into_result(self, cost: i64) -> BillingResult<Option<i64>> {
        match self {
            Authorization::Authorized { balance_after } => Ok(balance_after),
            Authorization::Denied {
                reason: DenialReason::InsufficientCredits,
                balance,
            } => Err(BillingError::InsufficientCredits { balance, cost }),
        }
    }
}

#[derive(Clone)]
pub struct DebitAuthorizer {
    store: Arc<dyn LedgerStore>,
}

impl DebitAuthorizer {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Authorize and, for metered accounts, debit `cost` credits in one step.
    pub async fn authorize(&self, account_id: Uuid, cost: i64) -> BillingResult<Authorization> {
        self.authorize_for(account_id, cost, "Image generation").await
    }

    /// Same as [`authorize`](Self::authorize) with a custom history description
    pub async fn authorize_for(
        &self,
        account_id: Uuid,
        cost: i64,
        description: &str,
    ) -> BillingResult<Authorization> {
        if cost <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "Cost must be positive, got {}",
                cost
            )));
        }

        let outcome = retry_on_conflict("authorize", || {
            self.store.debit(account_id, cost, description)
        })
        .await?;

        let authorization = match outcome {
            DebitOutcome::Debited { balance_after } => {
                tracing::info!(
                    account_id = %account_id,
                    cost = cost,
                    balance_after = balance_after,
                    "Credits debited"
                );
                Authorization::Authorized {
                    balance_after: Some(balance_after),
                }
            }
            DebitOutcome::Unmetered => {
                tracing::debug!(account_id = %account_id, "Subscribed account, not metered");
                Authorization::Authorized {
                    balance_after: None,
                }
            }
            DebitOutcome::Insufficient { balance } => {
                tracing::info!(
                    account_id = %account_id,
                    cost = cost,
                    balance = balance,
                    "Debit denied: insufficient credits"
                );
                Authorization::Denied {
                    reason: DenialReason::InsufficientCredits,
                    balance,
                }
            }
        };

        Ok(authorization)
    }

    /// Advisory, read-only check. Never use the result to skip `authorize`.
    pub async fn check(&self, account_id: Uuid, cost: i64) -> BillingResult<bool> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(BillingError::AccountNotFound(account_id))?;

        Ok(account.is_subscribed || account.credits >= cost)
    }
}
