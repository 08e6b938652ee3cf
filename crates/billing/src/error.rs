//! Billing error types

use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Account {0} not found")]
    AccountNotFound(Uuid),

    #[error("Insufficient credits: balance {balance}, cost {cost}")]
    InsufficientCredits { balance: i64, cost: i64 },

    #[error("No active subscription for account {0}")]
    SubscriptionNotFound(Uuid),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Backing store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payment provider error: {0}")]
    ProviderApi(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the whole operation may be retried from the start.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::ConcurrentModification(_))
    }
}

/// Postgres SQLSTATE codes for serialization failure and deadlock
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                    BillingError::ConcurrentModification(db.message().to_string())
                }
                _ => BillingError::Database(err.to_string()),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                BillingError::Unavailable(err.to_string())
            }
            _ => BillingError::Database(err.to_string()),
        }
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::ProviderApi(err.to_string())
    }
}
