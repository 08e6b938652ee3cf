//! Unit tests for authentication middleware
//!
//! Runs `require_auth` in front of a handler that echoes the caller's
//! account id.

#[cfg(test)]
mod tests {
    use super::super::jwt::JwtManager;
    use super::super::middleware::*;
    use axum::{
        body::Body,
        extract::Request,
        http::StatusCode,
        middleware,
        routing::get,
        Extension, Router,
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    async fn whoami(Extension(user): Extension<AuthUser>) -> String {
        user.account_id.to_string()
    }

    fn app() -> Router {
        let auth_state = AuthState {
            jwt_manager: JwtManager::new(SECRET, 24),
        };
        Router::new()
            .route("/whoami", get(whoami))
            .layer(middleware::from_fn_with_state(auth_state, require_auth))
    }

    async fn call(authorization: Option<&str>) -> (StatusCode, String) {
        let mut builder = Request::builder().uri("/whoami");
        if let Some(value) = authorization {
            builder = builder.header("Authorization", value);
        }
        let response = app()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_valid_token_reaches_handler() {
        let account_id = Uuid::new_v4();
        let token = JwtManager::new(SECRET, 24)
            .generate_token(account_id, None)
            .unwrap();

        let (status, body) = call(Some(&format!("Bearer {}", token))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, account_id.to_string());
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let (status, body) = call(None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("Authentication required"));
    }

    #[tokio::test]
    async fn test_foreign_token_is_unauthorized() {
        let token = JwtManager::new("someone-elses-secret-someone-elses", 24)
            .generate_token(Uuid::new_v4(), None)
            .unwrap();

        let (status, body) = call(Some(&format!("Bearer {}", token))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("Invalid or expired token"));
    }
}
