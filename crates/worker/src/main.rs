#![cfg_attr(test, allow(clippy::unwrap_used))]

//! MindCanvas Background Worker
//!
//! Handles scheduled jobs including:
//! - Ledger invariant sweep (hourly)
//! - Pruning of processed webhook event ids (daily at 3:30 AM UTC)

use std::sync::Arc;
use std::time::Duration;

use mindcanvas_api::telemetry;
use mindcanvas_billing::{
    InvariantCheckSummary, InvariantChecker, LedgerStore, PgLedgerStore, ViolationSeverity,
};
use mindcanvas_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Webhook event ids are kept this long for redelivery detection. Stripe
/// stops retrying after three days.
const PROCESSED_EVENT_RETENTION_DAYS: i64 = 90;

fn retention_cutoff(now: OffsetDateTime) -> OffsetDateTime {
    now - time::Duration::days(PROCESSED_EVENT_RETENTION_DAYS)
}

/// Log results of an invariant sweep
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Ledger invariants hold");
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Ledger invariant violations found"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical => error!(
                invariant = %violation.invariant,
                account_ids = ?violation.account_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            _ => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                account_ids = ?violation.account_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let log_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    telemetry::init_tracing("info,mindcanvas_worker=debug", log_json);

    info!("Starting MindCanvas Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let checker = Arc::new(InvariantChecker::new(pool.clone()));
    let store = Arc::new(PgLedgerStore::new(pool));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Ledger invariant sweep (hourly, on the hour)
    let sweep_checker = checker.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = sweep_checker.clone();
            Box::pin(async move {
                info!("Running ledger invariant sweep");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant sweep (hourly)");

    // Job 2: Prune processed webhook event ids (daily at 3:30 AM UTC)
    let prune_store = store.clone();
    scheduler
        .add(Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let store = prune_store.clone();
            Box::pin(async move {
                let cutoff = retention_cutoff(OffsetDateTime::now_utc());
                match store.prune_processed_events(cutoff).await {
                    Ok(deleted) => info!(deleted = deleted, "Processed webhook events pruned"),
                    Err(e) => error!(error = %e, "Processed webhook event pruning failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Processed webhook event pruning (daily at 3:30 AM UTC)");

    // Initial sweep at startup
    match checker.run_all_checks().await {
        Ok(summary) => log_invariant_summary(&summary),
        Err(e) => error!(error = %e, "Startup invariant sweep failed"),
    }

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("MindCanvas Worker started successfully with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindcanvas_billing::InvariantViolation;

    #[test]
    fn test_retention_cutoff() {
        let now = OffsetDateTime::now_utc();
        assert_eq!((now - retention_cutoff(now)).whole_days(), 90);
    }

    #[test]
    fn test_log_summary_with_violations_does_not_panic() {
        let summary = InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            checks_run: 5,
            checks_passed: 4,
            checks_failed: 1,
            violations: vec![InvariantViolation {
                invariant: "non_negative_balance".to_string(),
                account_ids: vec![],
                description: "Account balance is negative (-1)".to_string(),
                context: serde_json::json!({ "credits": -1 }),
                severity: ViolationSeverity::Critical,
            }],
            healthy: false,
        };
        log_invariant_summary(&summary);
    }
}
