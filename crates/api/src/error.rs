//! API error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mindcanvas_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("Insufficient credits: balance {balance}, cost {cost}")]
    InsufficientCredits { balance: i64, cost: i64 },

    #[error("Invalid webhook signature")]
    SignatureInvalid,

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    BadGateway(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("{0}")]
    Validation(String),

    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::InsufficientCredits { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "insufficient_credits")
            }
            ApiError::SignatureInvalid => (StatusCode::BAD_REQUEST, "signature_invalid"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "transaction_conflict"),
            ApiError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable")
            }
            ApiError::BadGateway(_) => (StatusCode::BAD_GATEWAY, "provider_error"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if status.is_server_error() {
            tracing::error!(error = ?self, "Request failed");
        }

        let mut body = json!({
            "error": code,
            "message": self.to_string(),
        });
        if let ApiError::InsufficientCredits { balance, cost } = self {
            body["balance"] = json!(balance);
            body["cost"] = json!(cost);
        }

        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotFound(what) => ApiError::NotFound(what),
            BillingError::AccountNotFound(_) | BillingError::SubscriptionNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            BillingError::InsufficientCredits { balance, cost } => {
                ApiError::InsufficientCredits { balance, cost }
            }
            BillingError::WebhookSignatureInvalid => ApiError::SignatureInvalid,
            BillingError::ConcurrentModification(msg) => ApiError::Conflict(msg),
            BillingError::Unavailable(msg) => ApiError::ServiceUnavailable(msg),
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::ProviderApi(msg) => ApiError::BadGateway(msg),
            BillingError::Database(msg)
            | BillingError::Config(msg)
            | BillingError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn status_of(err: BillingError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_billing_errors_map_to_status() {
        assert_eq!(
            status_of(BillingError::AccountNotFound(Uuid::new_v4())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(BillingError::InsufficientCredits { balance: 0, cost: 1 }),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_of(BillingError::WebhookSignatureInvalid),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(BillingError::ConcurrentModification("busy".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(BillingError::Unavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(BillingError::InvalidInput("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(BillingError::Database("oops".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_message_not_leaked() {
        let err = ApiError::from(BillingError::Database("password=hunter2".into()));
        assert_eq!(err.to_string(), "Internal server error");
    }
}
