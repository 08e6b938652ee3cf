//! Credit ledger model and storage contract
//!
//! An account's `credits` balance is only ever changed together with an
//! appended [`CreditMovement`], inside one store transaction, so the sum of an
//! account's movements always equals its balance.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plans::{BillingCycle, CreditPack, Plan};

/// Credits granted when an account is registered
pub const WELCOME_CREDITS: i64 = 10;

/// Largest page a history read will return
pub const MAX_HISTORY_PAGE_SIZE: i64 = 100;

/// Default history page size
pub const DEFAULT_HISTORY_PAGE_SIZE: i64 = 20;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub email: Option<String>,
    pub credits: i64,
    pub is_subscribed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditKind {
    Welcome,
    Subscription,
    Purchase,
    Usage,
}

impl CreditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditKind::Welcome => "welcome",
            CreditKind::Subscription => "subscription",
            CreditKind::Purchase => "purchase",
            CreditKind::Usage => "usage",
        }
    }
}

impl FromStr for CreditKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "welcome" => Ok(CreditKind::Welcome),
            "subscription" => Ok(CreditKind::Subscription),
            "purchase" => Ok(CreditKind::Purchase),
            "usage" => Ok(CreditKind::Usage),
            other => Err(BillingError::Internal(format!(
                "Unknown credit movement kind '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for CreditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One signed change to an account balance. Never updated or deleted.
#[derive(Debug, Clone, Serialize)]
pub struct CreditMovement {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Negative for debits, positive for credits
    pub amount: i64,
    pub kind: CreditKind,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(BillingError::Internal(format!(
                "Unknown subscription status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub plan: Plan,
    pub billing_cycle: BillingCycle,
    pub status: SubscriptionStatus,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
}

impl SubscriptionRecord {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }
}

/// 1-based page of credit history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPage {
    pub page: i64,
    pub page_size: i64,
}

impl HistoryPage {
    pub fn new(page: Option<i64>, page_size: Option<i64>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size
                .unwrap_or(DEFAULT_HISTORY_PAGE_SIZE)
                .clamp(1, MAX_HISTORY_PAGE_SIZE),
        }
    }

    /// Rows to skip; pages past the addressable range saturate
    pub fn offset(&self) -> i64 {
        self.page.saturating_sub(1).saturating_mul(self.page_size)
    }
}

impl Default for HistoryPage {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Result of an atomic debit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    /// Balance was reduced and a usage movement appended
    Debited { balance_after: i64 },
    /// Subscribed account; nothing was recorded
    Unmetered,
    /// Balance too low; nothing was recorded
    Insufficient { balance: i64 },
}

/// Result of applying a provider event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// State changed
    Applied,
    /// Event id was already processed; nothing changed
    Duplicate,
    /// Event was recorded but had nothing to change
    Ignored,
}

/// Provider event identity used as the idempotency key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventClaim {
    pub event_id: String,
    pub event_type: String,
}

impl EventClaim {
    pub fn new(event_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
        }
    }
}

/// A completed subscription checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionActivation {
    pub account_id: Uuid,
    pub plan: Plan,
    pub billing_cycle: BillingCycle,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
}

/// A completed one-time credit checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditPurchase {
    pub account_id: Uuid,
    pub pack: CreditPack,
}

/// Persistent ledger and entitlement state.
///
/// Every write method is a single all-or-nothing unit. Implementations must
/// serialize writes per account so that a balance check and the matching
/// decrement observe the same state.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the account with its welcome bonus. Returns the existing account
    /// unchanged if it is already registered.
    async fn register_account(&self, account_id: Uuid, email: Option<&str>)
        -> BillingResult<Account>;

    async fn get_account(&self, account_id: Uuid) -> BillingResult<Option<Account>>;

    async fn get_balance(&self, account_id: Uuid) -> BillingResult<i64> {
        self.get_account(account_id)
            .await?
            .map(|account| account.credits)
            .ok_or(BillingError::AccountNotFound(account_id))
    }

    /// Movements newest first
    async fn get_history(
        &self,
        account_id: Uuid,
        page: HistoryPage,
    ) -> BillingResult<Vec<CreditMovement>>;

    /// Most recent subscription, active or canceled
    async fn current_subscription(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn debit(&self, account_id: Uuid, cost: i64, description: &str)
        -> BillingResult<DebitOutcome>;

    async fn activate_subscription(
        &self,
        claim: &EventClaim,
        activation: &SubscriptionActivation,
    ) -> BillingResult<ReconcileOutcome>;

    async fn purchase_credits(
        &self,
        claim: &EventClaim,
        purchase: &CreditPurchase,
    ) -> BillingResult<ReconcileOutcome>;

    async fn cancel_subscription(
        &self,
        claim: &EventClaim,
        provider_subscription_id: &str,
        ended_at: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome>;

    /// User-initiated cancel of the account's active subscription
    async fn cancel_account_subscription(
        &self,
        account_id: Uuid,
        ended_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Drop idempotency records older than the cutoff
    async fn prune_processed_events(&self, older_than: OffsetDateTime) -> BillingResult<u64>;
}

pub(crate) fn subscription_description(activation: &SubscriptionActivation) -> String {
    format!(
        "{} {} subscription bonus",
        activation.plan, activation.billing_cycle
    )
}

pub(crate) fn purchase_description(pack: CreditPack) -> String {
    format!("Purchased {} credit pack", pack)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_page_defaults_and_clamps() {
        let page = HistoryPage::new(None, None);
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, DEFAULT_HISTORY_PAGE_SIZE);
        assert_eq!(page.offset(), 0);

        let page = HistoryPage::new(Some(0), Some(10_000));
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, MAX_HISTORY_PAGE_SIZE);

        let page = HistoryPage::new(Some(3), Some(25));
        assert_eq!(page.offset(), 50);
    }

    #[test]
    fn test_history_page_offset_saturates() {
        let page = HistoryPage::new(Some(i64::MAX), Some(MAX_HISTORY_PAGE_SIZE));
        assert_eq!(page.page, i64::MAX);
        assert_eq!(page.offset(), i64::MAX);

        let page = HistoryPage::new(Some(i64::MIN), Some(i64::MIN));
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, 1);
        assert_eq!(page.offset(), 0);
    }

    #[test]
    fn test_credit_kind_serializes_uppercase() {
        let json = serde_json::to_string(&CreditKind::Usage).unwrap();
        assert_eq!(json, "\"USAGE\"");
        assert_eq!("usage".parse::<CreditKind>().unwrap(), CreditKind::Usage);
    }

    #[test]
    fn test_unknown_status_is_internal_error() {
        assert!(matches!(
            "paused".parse::<SubscriptionStatus>(),
            Err(BillingError::Internal(_))
        ));
    }
}
