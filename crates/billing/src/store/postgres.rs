//! Postgres-backed ledger
//!
//! Each write runs in one transaction that first locks the account row
//! (`SELECT ... FOR UPDATE`), so concurrent debits against the same account
//! queue behind each other and always see the committed balance.

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{
    purchase_description, subscription_description, Account, CreditKind, CreditMovement,
    CreditPurchase, DebitOutcome, EventClaim, HistoryPage, LedgerStore, ReconcileOutcome,
    SubscriptionActivation, SubscriptionRecord, SubscriptionStatus, WELCOME_CREDITS,
};

#[derive(Debug, sqlx::FromRow)]
struct MovementRow {
    id: Uuid,
    account_id: Uuid,
    amount: i64,
    kind: String,
    description: String,
    created_at: OffsetDateTime,
}

impl TryFrom<MovementRow> for CreditMovement {
    type Error = BillingError;

    fn try_from(row: MovementRow) -> Result<Self, Self::Error> {
        Ok(CreditMovement {
            id: row.id,
            account_id: row.account_id,
            amount: row.amount,
            kind: row.kind.parse()?,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    account_id: Uuid,
    plan: String,
    billing_cycle: String,
    status: String,
    provider_customer_id: Option<String>,
    provider_subscription_id: Option<String>,
    start_date: OffsetDateTime,
    end_date: Option<OffsetDateTime>,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(SubscriptionRecord {
            id: row.id,
            account_id: row.account_id,
            plan: row.plan.parse()?,
            billing_cycle: row.billing_cycle.parse()?,
            status: row.status.parse()?,
            provider_customer_id: row.provider_customer_id,
            provider_subscription_id: row.provider_subscription_id,
            start_date: row.start_date,
            end_date: row.end_date,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, account_id, plan, billing_cycle, status,
    provider_customer_id, provider_subscription_id, start_date, end_date
"#;

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Record the event id. Returns false if it was already processed.
async fn claim_event(conn: &mut PgConnection, claim: &EventClaim) -> BillingResult<bool> {
    let rows = sqlx::query(
        r#"
        INSERT INTO processed_webhook_events (event_id, event_type)
        VALUES ($1, $2)
        ON CONFLICT (event_id) DO NOTHING
        "#,
    )
    .bind(&claim.event_id)
    .bind(&claim.event_type)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(rows == 1)
}

/// Lock the account row for the rest of the transaction
async fn lock_account(
    conn: &mut PgConnection,
    account_id: Uuid,
) -> BillingResult<(i64, bool)> {
    let row: Option<(i64, bool)> =
        sqlx::query_as("SELECT credits, is_subscribed FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(account_id)
            .fetch_optional(&mut *conn)
            .await?;

    row.ok_or(BillingError::AccountNotFound(account_id))
}

async fn append_movement(
    conn: &mut PgConnection,
    account_id: Uuid,
    amount: i64,
    kind: CreditKind,
    description: &str,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO credit_movements (id, account_id, amount, kind, description, created_at)
        VALUES ($1, $2, $3, $4, $5, clock_timestamp())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(account_id)
    .bind(amount)
    .bind(kind.as_str())
    .bind(description)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Recompute the subscribed flag from the subscriptions table
async fn refresh_subscribed_flag(conn: &mut PgConnection, account_id: Uuid) -> BillingResult<bool> {
    let is_subscribed: bool = sqlx::query_scalar(
        r#"
        UPDATE accounts SET
            is_subscribed = EXISTS (
                SELECT 1 FROM subscriptions
                WHERE account_id = $1 AND status = 'active'
            ),
            updated_at = NOW()
        WHERE id = $1
        RETURNING is_subscribed
        "#,
    )
    .bind(account_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(is_subscribed)
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn register_account(
        &self,
        account_id: Uuid,
        email: Option<&str>,
    ) -> BillingResult<Account> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO accounts (id, email, credits, is_subscribed)
            VALUES ($1, $2, $3, FALSE)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(email)
        .bind(WELCOME_CREDITS)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            append_movement(
                &mut tx,
                account_id,
                WELCOME_CREDITS,
                CreditKind::Welcome,
                "Welcome bonus",
            )
            .await?;
        }

        let account: Account = sqlx::query_as(
            "SELECT id, email, credits, is_subscribed, created_at FROM accounts WHERE id = $1",
        )
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        if inserted {
            tracing::info!(
                account_id = %account_id,
                welcome_credits = WELCOME_CREDITS,
                "Account registered with welcome bonus"
            );
        }

        Ok(account)
    }

    async fn get_account(&self, account_id: Uuid) -> BillingResult<Option<Account>> {
        let account = sqlx::query_as(
            "SELECT id, email, credits, is_subscribed, created_at FROM accounts WHERE id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn get_history(
        &self,
        account_id: Uuid,
        page: HistoryPage,
    ) -> BillingResult<Vec<CreditMovement>> {
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(BillingError::AccountNotFound(account_id));
        }

        let rows: Vec<MovementRow> = sqlx::query_as(
            r#"
            SELECT id, account_id, amount, kind, description, created_at
            FROM credit_movements
            WHERE account_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(account_id)
        .bind(page.page_size)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CreditMovement::try_from).collect()
    }

    async fn current_subscription(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE account_id = $1 \
             AND status IN ('active', 'canceled') \
             ORDER BY start_date DESC, created_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn debit(
        &self,
        account_id: Uuid,
        cost: i64,
        description: &str,
    ) -> BillingResult<DebitOutcome> {
        let mut tx = self.pool.begin().await?;

        let (credits, is_subscribed) = lock_account(&mut tx, account_id).await?;

        if is_subscribed {
            return Ok(DebitOutcome::Unmetered);
        }
        if credits < cost {
            return Ok(DebitOutcome::Insufficient { balance: credits });
        }

        // Guarded decrement; never takes the balance below zero
        let balance_after: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE accounts SET credits = credits - $2, updated_at = NOW()
            WHERE id = $1 AND credits >= $2 AND is_subscribed = FALSE
            RETURNING credits
            "#,
        )
        .bind(account_id)
        .bind(cost)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(balance_after) = balance_after else {
            return Err(BillingError::ConcurrentModification(format!(
                "Balance of account {} changed during debit",
                account_id
            )));
        };

        append_movement(&mut tx, account_id, -cost, CreditKind::Usage, description).await?;

        tx.commit().await?;

        Ok(DebitOutcome::Debited { balance_after })
    }

    async fn activate_subscription(
        &self,
        claim: &EventClaim,
        activation: &SubscriptionActivation,
    ) -> BillingResult<ReconcileOutcome> {
        let mut tx = self.pool.begin().await?;

        if !claim_event(&mut tx, claim).await? {
            return Ok(ReconcileOutcome::Duplicate);
        }

        let account_id = activation.account_id;
        lock_account(&mut tx, account_id).await?;

        // One active subscription per account
        let superseded = sqlx::query(
            r#"
            UPDATE subscriptions SET status = 'canceled', end_date = NOW(), updated_at = NOW()
            WHERE account_id = $1 AND status = 'active'
            "#,
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if superseded > 0 {
            tracing::warn!(
                account_id = %account_id,
                superseded = superseded,
                "Existing active subscription superseded by new checkout"
            );
        }

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, account_id, plan, billing_cycle, status,
                provider_customer_id, provider_subscription_id, start_date
            )
            VALUES ($1, $2, $3, $4, 'active', $5, $6, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(activation.plan.as_str())
        .bind(activation.billing_cycle.as_str())
        .bind(&activation.provider_customer_id)
        .bind(&activation.provider_subscription_id)
        .execute(&mut *tx)
        .await?;

        let bonus = activation.plan.terms(activation.billing_cycle).bonus_credits;

        sqlx::query(
            r#"
            UPDATE accounts SET is_subscribed = TRUE, credits = credits + $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .bind(bonus)
        .execute(&mut *tx)
        .await?;

        append_movement(
            &mut tx,
            account_id,
            bonus,
            CreditKind::Subscription,
            &subscription_description(activation),
        )
        .await?;

        tx.commit().await?;

        Ok(ReconcileOutcome::Applied)
    }

    async fn purchase_credits(
        &self,
        claim: &EventClaim,
        purchase: &CreditPurchase,
    ) -> BillingResult<ReconcileOutcome> {
        let mut tx = self.pool.begin().await?;

        if !claim_event(&mut tx, claim).await? {
            return Ok(ReconcileOutcome::Duplicate);
        }

        lock_account(&mut tx, purchase.account_id).await?;

        let credits = purchase.pack.credits();
        sqlx::query("UPDATE accounts SET credits = credits + $2, updated_at = NOW() WHERE id = $1")
            .bind(purchase.account_id)
            .bind(credits)
            .execute(&mut *tx)
            .await?;

        append_movement(
            &mut tx,
            purchase.account_id,
            credits,
            CreditKind::Purchase,
            &purchase_description(purchase.pack),
        )
        .await?;

        tx.commit().await?;

        Ok(ReconcileOutcome::Applied)
    }

    async fn cancel_subscription(
        &self,
        claim: &EventClaim,
        provider_subscription_id: &str,
        ended_at: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        let mut tx = self.pool.begin().await?;

        if !claim_event(&mut tx, claim).await? {
            return Ok(ReconcileOutcome::Duplicate);
        }

        let found: Option<(Uuid, Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, account_id, status FROM subscriptions
            WHERE provider_subscription_id = $1
            ORDER BY start_date DESC
            LIMIT 1
            "#,
        )
        .bind(provider_subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((subscription_id, account_id, _)) =
            found.filter(|(_, _, status)| status == SubscriptionStatus::Active.as_str())
        else {
            // Unknown or already canceled; keep the claim so redelivery stays a no-op
            tx.commit().await?;
            return Ok(ReconcileOutcome::Ignored);
        };

        lock_account(&mut tx, account_id).await?;

        let updated = sqlx::query(
            r#"
            UPDATE subscriptions SET status = 'canceled', end_date = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(subscription_id)
        .bind(ended_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "Subscription {} changed during cancellation",
                subscription_id
            )));
        }

        refresh_subscribed_flag(&mut tx, account_id).await?;

        tx.commit().await?;

        Ok(ReconcileOutcome::Applied)
    }

    async fn cancel_account_subscription(
        &self,
        account_id: Uuid,
        ended_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let mut tx = self.pool.begin().await?;

        lock_account(&mut tx, account_id).await?;

        let sql = format!(
            "UPDATE subscriptions SET status = 'canceled', end_date = $2, updated_at = NOW() \
             WHERE account_id = $1 AND status = 'active' RETURNING {}",
            SUBSCRIPTION_COLUMNS
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(account_id)
            .bind(ended_at)
            .fetch_all(&mut *tx)
            .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        refresh_subscribed_flag(&mut tx, account_id).await?;

        tx.commit().await?;

        rows.into_iter()
            .map(SubscriptionRecord::try_from)
            .next()
            .transpose()
    }

    async fn prune_processed_events(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let deleted = sqlx::query("DELETE FROM processed_webhook_events WHERE processed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted)
    }
}

// Needs a reachable Postgres: DATABASE_URL=... cargo test -- --ignored
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::plans::{BillingCycle, CreditPack, Plan};

    async fn account_with_balance(store: &PgLedgerStore, target: i64) -> Uuid {
        let account_id = Uuid::new_v4();
        store.register_account(account_id, None).await.unwrap();
        let spend = WELCOME_CREDITS - target;
        if spend > 0 {
            store.debit(account_id, spend, "setup").await.unwrap();
        }
        account_id
    }

    async fn movement_sum(pool: &PgPool, account_id: Uuid) -> i64 {
        sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM credit_movements WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_one(pool)
        .await
        .unwrap()
    }

    async fn is_claimed(pool: &PgPool, event_id: &str) -> bool {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT event_id FROM processed_webhook_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(pool)
                .await
                .unwrap();
        row.is_some()
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_last_credit_charged_once(pool: PgPool) {
        let store = Arc::new(PgLedgerStore::new(pool.clone()));
        let account_id = account_with_balance(&store, 1).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.debit(account_id, 1, "generation").await
            }));
        }

        let mut debited = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                DebitOutcome::Debited { balance_after } => {
                    assert_eq!(balance_after, 0);
                    debited += 1;
                }
                DebitOutcome::Insufficient { balance } => assert_eq!(balance, 0),
                DebitOutcome::Unmetered => panic!("account is not subscribed"),
            }
        }

        assert_eq!(debited, 1);
        assert_eq!(store.get_balance(account_id).await.unwrap(), 0);
        assert_eq!(movement_sum(&pool, account_id).await, 0);
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_concurrent_debits_conserve_balance(pool: PgPool) {
        let store = Arc::new(PgLedgerStore::new(pool.clone()));
        let account_id = account_with_balance(&store, WELCOME_CREDITS).await;

        let mut handles = Vec::new();
        for _ in 0..(WELCOME_CREDITS * 2) {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.debit(account_id, 1, "generation").await
            }));
        }

        let mut debited = 0;
        for handle in handles {
            if let DebitOutcome::Debited { balance_after } = handle.await.unwrap().unwrap() {
                assert!(balance_after >= 0);
                debited += 1;
            }
        }

        assert_eq!(debited, WELCOME_CREDITS);
        let balance = store.get_balance(account_id).await.unwrap();
        assert_eq!(balance, 0);
        assert_eq!(movement_sum(&pool, account_id).await, balance);
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_subscribed_debit_records_nothing(pool: PgPool) {
        let store = PgLedgerStore::new(pool.clone());
        let account_id = account_with_balance(&store, WELCOME_CREDITS).await;
        store
            .activate_subscription(
                &EventClaim::new("evt_sub", "checkout.session.completed"),
                &SubscriptionActivation {
                    account_id,
                    plan: Plan::Premium,
                    billing_cycle: BillingCycle::Monthly,
                    provider_customer_id: Some("cus_1".to_string()),
                    provider_subscription_id: Some("sub_1".to_string()),
                },
            )
            .await
            .unwrap();

        let outcome = store.debit(account_id, 5, "generation").await.unwrap();
        assert_eq!(outcome, DebitOutcome::Unmetered);
        assert_eq!(store.get_balance(account_id).await.unwrap(), 160);
        assert_eq!(movement_sum(&pool, account_id).await, 160);
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_claim_released_when_account_missing(pool: PgPool) {
        let store = PgLedgerStore::new(pool.clone());
        let account_id = Uuid::new_v4();
        let claim = EventClaim::new("evt_early", "checkout.session.completed");
        let purchase = CreditPurchase {
            account_id,
            pack: CreditPack::Small,
        };

        let result = store.purchase_credits(&claim, &purchase).await;
        assert!(matches!(result, Err(BillingError::AccountNotFound(_))));
        assert!(!is_claimed(&pool, "evt_early").await);

        store.register_account(account_id, None).await.unwrap();
        let outcome = store.purchase_credits(&claim, &purchase).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Applied);
        assert!(is_claimed(&pool, "evt_early").await);
        assert_eq!(
            store.get_balance(account_id).await.unwrap(),
            WELCOME_CREDITS + CreditPack::Small.credits()
        );
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_unknown_subscription_cancel_is_claimed(pool: PgPool) {
        let store = PgLedgerStore::new(pool.clone());
        let claim = EventClaim::new("evt_del_unknown", "customer.subscription.deleted");

        let first = store
            .cancel_subscription(&claim, "sub_missing", OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(first, ReconcileOutcome::Ignored);
        assert!(is_claimed(&pool, "evt_del_unknown").await);

        let second = store
            .cancel_subscription(&claim, "sub_missing", OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(second, ReconcileOutcome::Duplicate);
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_cancel_keeps_credits_and_history(pool: PgPool) {
        let store = PgLedgerStore::new(pool.clone());
        let account_id = account_with_balance(&store, WELCOME_CREDITS).await;
        store
            .activate_subscription(
                &EventClaim::new("evt_buy", "checkout.session.completed"),
                &SubscriptionActivation {
                    account_id,
                    plan: Plan::Premium,
                    billing_cycle: BillingCycle::Annual,
                    provider_customer_id: None,
                    provider_subscription_id: Some("sub_annual".to_string()),
                },
            )
            .await
            .unwrap();

        let outcome = store
            .cancel_subscription(
                &EventClaim::new("evt_del", "customer.subscription.deleted"),
                "sub_annual",
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Applied);

        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert!(!account.is_subscribed);
        assert_eq!(account.credits, WELCOME_CREDITS + 1800);
        assert_eq!(movement_sum(&pool, account_id).await, account.credits);

        let sub = store.current_subscription(account_id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert!(sub.end_date.is_some());
    }
}
