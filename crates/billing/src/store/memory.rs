//! In-memory ledger
//!
//! All state sits behind one async mutex, so every operation is a single
//! critical section and trivially atomic. Used by tests and single-process
//! embedding; it offers no durability.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{
    purchase_description, subscription_description, Account, CreditKind, CreditMovement,
    CreditPurchase, DebitOutcome, EventClaim, HistoryPage, LedgerStore, ReconcileOutcome,
    SubscriptionActivation, SubscriptionRecord, SubscriptionStatus, WELCOME_CREDITS,
};

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<Uuid, Account>,
    /// Append order is creation order
    movements: Vec<CreditMovement>,
    subscriptions: Vec<SubscriptionRecord>,
    processed_events: HashMap<String, OffsetDateTime>,
}

impl LedgerState {
    fn account_mut(&mut self, account_id: Uuid) -> BillingResult<&mut Account> {
        self.accounts
            .get_mut(&account_id)
            .ok_or(BillingError::AccountNotFound(account_id))
    }

    fn append(&mut self, account_id: Uuid, amount: i64, kind: CreditKind, description: String) {
        self.movements.push(CreditMovement {
            id: Uuid::new_v4(),
            account_id,
            amount,
            kind,
            description,
            created_at: OffsetDateTime::now_utc(),
        });
    }

    fn has_active_subscription(&self, account_id: Uuid) -> bool {
        self.subscriptions
            .iter()
            .any(|s| s.account_id == account_id && s.is_active())
    }

    fn is_processed(&self, claim: &EventClaim) -> bool {
        self.processed_events.contains_key(&claim.event_id)
    }

    fn mark_processed(&mut self, claim: &EventClaim) {
        self.processed_events
            .insert(claim.event_id.clone(), OffsetDateTime::now_utc());
    }
}

#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<LedgerState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subscription rows ever created for the account
    pub async fn subscription_count(&self, account_id: Uuid) -> usize {
        let state = self.state.lock().await;
        state
            .subscriptions
            .iter()
            .filter(|s| s.account_id == account_id)
            .count()
    }

    /// Sum of all movements recorded for the account
    pub async fn movement_total(&self, account_id: Uuid) -> i64 {
        let state = self.state.lock().await;
        state
            .movements
            .iter()
            .filter(|m| m.account_id == account_id)
            .map(|m| m.amount)
            .sum()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn register_account(
        &self,
        account_id: Uuid,
        email: Option<&str>,
    ) -> BillingResult<Account> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.accounts.get(&account_id) {
            return Ok(existing.clone());
        }

        let account = Account {
            id: account_id,
            email: email.map(str::to_string),
            credits: WELCOME_CREDITS,
            is_subscribed: false,
            created_at: OffsetDateTime::now_utc(),
        };
        state.accounts.insert(account_id, account.clone());
        state.append(
            account_id,
            WELCOME_CREDITS,
            CreditKind::Welcome,
            "Welcome bonus".to_string(),
        );

        Ok(account)
    }

    async fn get_account(&self, account_id: Uuid) -> BillingResult<Option<Account>> {
        Ok(self.state.lock().await.accounts.get(&account_id).cloned())
    }

    async fn get_history(
        &self,
        account_id: Uuid,
        page: HistoryPage,
    ) -> BillingResult<Vec<CreditMovement>> {
        let state = self.state.lock().await;
        if !state.accounts.contains_key(&account_id) {
            return Err(BillingError::AccountNotFound(account_id));
        }

        Ok(state
            .movements
            .iter()
            .rev()
            .filter(|m| m.account_id == account_id)
            .skip(page.offset() as usize)
            .take(page.page_size as usize)
            .cloned()
            .collect())
    }

    async fn current_subscription(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .iter()
            .rev()
            .find(|s| s.account_id == account_id)
            .cloned())
    }

    async fn debit(
        &self,
        account_id: Uuid,
        cost: i64,
        description: &str,
    ) -> BillingResult<DebitOutcome> {
        let mut state = self.state.lock().await;
        let account = state.account_mut(account_id)?;

        if account.is_subscribed {
            return Ok(DebitOutcome::Unmetered);
        }
        if account.credits < cost {
            return Ok(DebitOutcome::Insufficient {
                balance: account.credits,
            });
        }

        account.credits -= cost;
        let balance_after = account.credits;
        state.append(account_id, -cost, CreditKind::Usage, description.to_string());

        Ok(DebitOutcome::Debited { balance_after })
    }

    async fn activate_subscription(
        &self,
        claim: &EventClaim,
        activation: &SubscriptionActivation,
    ) -> BillingResult<ReconcileOutcome> {
        let mut state = self.state.lock().await;

        if state.is_processed(claim) {
            return Ok(ReconcileOutcome::Duplicate);
        }

        let account_id = activation.account_id;
        let bonus = activation.plan.terms(activation.billing_cycle).bonus_credits;
        let now = OffsetDateTime::now_utc();

        // Validate before any mutation so a missing account leaves no trace
        state.account_mut(account_id)?;

        state.mark_processed(claim);
        for existing in state
            .subscriptions
            .iter_mut()
            .filter(|s| s.account_id == account_id && s.is_active())
        {
            existing.status = SubscriptionStatus::Canceled;
            existing.end_date = Some(now);
        }
        state.subscriptions.push(SubscriptionRecord {
            id: Uuid::new_v4(),
            account_id,
            plan: activation.plan,
            billing_cycle: activation.billing_cycle,
            status: SubscriptionStatus::Active,
            provider_customer_id: activation.provider_customer_id.clone(),
            provider_subscription_id: activation.provider_subscription_id.clone(),
            start_date: now,
            end_date: None,
        });

        let account = state.account_mut(account_id)?;
        account.is_subscribed = true;
        account.credits += bonus;
        state.append(
            account_id,
            bonus,
            CreditKind::Subscription,
            subscription_description(activation),
        );

        Ok(ReconcileOutcome::Applied)
    }

    async fn purchase_credits(
        &self,
        claim: &EventClaim,
        purchase: &CreditPurchase,
    ) -> BillingResult<ReconcileOutcome> {
        let mut state = self.state.lock().await;

        if state.is_processed(claim) {
            return Ok(ReconcileOutcome::Duplicate);
        }

        let credits = purchase.pack.credits();
        state.account_mut(purchase.account_id)?.credits += credits;
        state.mark_processed(claim);
        state.append(
            purchase.account_id,
            credits,
            CreditKind::Purchase,
            purchase_description(purchase.pack),
        );

        Ok(ReconcileOutcome::Applied)
    }

    async fn cancel_subscription(
        &self,
        claim: &EventClaim,
        provider_subscription_id: &str,
        ended_at: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        let mut state = self.state.lock().await;

        if state.is_processed(claim) {
            return Ok(ReconcileOutcome::Duplicate);
        }
        state.mark_processed(claim);

        let Some(subscription) = state
            .subscriptions
            .iter_mut()
            .rev()
            .find(|s| s.provider_subscription_id.as_deref() == Some(provider_subscription_id))
            .filter(|s| s.is_active())
        else {
            return Ok(ReconcileOutcome::Ignored);
        };

        subscription.status = SubscriptionStatus::Canceled;
        subscription.end_date = Some(ended_at);
        let account_id = subscription.account_id;

        let still_subscribed = state.has_active_subscription(account_id);
        if let Some(account) = state.accounts.get_mut(&account_id) {
            account.is_subscribed = still_subscribed;
        }

        Ok(ReconcileOutcome::Applied)
    }

    async fn cancel_account_subscription(
        &self,
        account_id: Uuid,
        ended_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let mut state = self.state.lock().await;
        state.account_mut(account_id)?;

        let Some(subscription) = state
            .subscriptions
            .iter_mut()
            .rev()
            .find(|s| s.account_id == account_id && s.is_active())
        else {
            return Ok(None);
        };

        subscription.status = SubscriptionStatus::Canceled;
        subscription.end_date = Some(ended_at);
        let canceled = subscription.clone();

        let still_subscribed = state.has_active_subscription(account_id);
        state.account_mut(account_id)?.is_subscribed = still_subscribed;

        Ok(Some(canceled))
    }

    async fn prune_processed_events(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.processed_events.len();
        state
            .processed_events
            .retain(|_, processed_at| *processed_at >= older_than);
        Ok((before - state.processed_events.len()) as u64)
    }
}
