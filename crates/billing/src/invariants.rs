//! Ledger Invariants
//!
//! Runnable consistency checks over the ledger tables. They only read, so
//! they are safe to run against production at any time, and are meant to be
//! run after webhook replays and on a schedule by the worker.
//!
//! Checks:
//!
//! 1. `ledger_matches_balance`: every account's cached balance equals the sum
//!    of its credit movements
//! 2. `non_negative_balance`: no balance below zero
//! 3. `single_active_subscription`: at most one active subscription per account
//! 4. `subscribed_flag_matches_subscription`: `is_subscribed` is set exactly
//!    when an active subscription exists
//! 5. `canceled_has_end_date`: canceled subscriptions carry an end date

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub account_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Credits are wrong or could be spent twice
    Critical,
    /// Entitlement state is inconsistent
    High,
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceDriftRow {
    account_id: Uuid,
    cached: i64,
    ledger_sum: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    account_id: Uuid,
    credits: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    account_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct FlagMismatchRow {
    account_id: Uuid,
    is_subscribed: bool,
    active_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledNoEndRow {
    sub_id: Uuid,
    account_id: Uuid,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_ledger_matches_balance().await?);
        violations.extend(self.check_non_negative_balance().await?);
        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_subscribed_flag_matches_subscription().await?);
        violations.extend(self.check_canceled_has_end_date().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    async fn check_ledger_matches_balance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BalanceDriftRow> = sqlx::query_as(
            r#"
            SELECT a.id AS account_id,
                   a.credits AS cached,
                   COALESCE(SUM(m.amount), 0)::BIGINT AS ledger_sum
            FROM accounts a
            LEFT JOIN credit_movements m ON m.account_id = a.id
            GROUP BY a.id, a.credits
            HAVING a.credits <> COALESCE(SUM(m.amount), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "ledger_matches_balance".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Cached balance {} differs from ledger sum {}",
                    row.cached, row.ledger_sum
                ),
                context: serde_json::json!({
                    "cached": row.cached,
                    "ledger_sum": row.ledger_sum,
                    "drift": row.cached - row.ledger_sum,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_non_negative_balance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> =
            sqlx::query_as("SELECT id AS account_id, credits FROM accounts WHERE credits < 0")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_balance".to_string(),
                account_ids: vec![row.account_id],
                description: format!("Account balance is negative ({})", row.credits),
                context: serde_json::json!({ "credits": row.credits }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT account_id, COUNT(*) AS sub_count
            FROM subscriptions
            WHERE status = 'active'
            GROUP BY account_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Account has {} active subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscription_count": row.sub_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_subscribed_flag_matches_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<FlagMismatchRow> = sqlx::query_as(
            r#"
            SELECT a.id AS account_id,
                   a.is_subscribed,
                   COUNT(s.id) AS active_count
            FROM accounts a
            LEFT JOIN subscriptions s
                   ON s.account_id = a.id AND s.status = 'active'
            GROUP BY a.id, a.is_subscribed
            HAVING a.is_subscribed <> (COUNT(s.id) > 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscribed_flag_matches_subscription".to_string(),
                account_ids: vec![row.account_id],
                description: if row.is_subscribed {
                    "Account flagged subscribed without an active subscription".to_string()
                } else {
                    "Account has an active subscription but is not flagged subscribed".to_string()
                },
                context: serde_json::json!({
                    "is_subscribed": row.is_subscribed,
                    "active_subscriptions": row.active_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_canceled_has_end_date(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoEndRow> = sqlx::query_as(
            r#"
            SELECT id AS sub_id, account_id
            FROM subscriptions
            WHERE status = 'canceled' AND end_date IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_end_date".to_string(),
                account_ids: vec![row.account_id],
                description: "Canceled subscription has no end date".to_string(),
                context: serde_json::json!({ "subscription_id": row.sub_id }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "ledger_matches_balance" => self.check_ledger_matches_balance().await,
            "non_negative_balance" => self.check_non_negative_balance().await,
            "single_active_subscription" => self.check_single_active_subscription().await,
            "subscribed_flag_matches_subscription" => {
                self.check_subscribed_flag_matches_subscription().await
            }
            "canceled_has_end_date" => self.check_canceled_has_end_date().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "ledger_matches_balance",
            "non_negative_balance",
            "single_active_subscription",
            "subscribed_flag_matches_subscription",
            "canceled_has_end_date",
        ]
    }
}
