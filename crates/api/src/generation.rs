//! Image generation provider client
//!
//! Starts a prediction on a Replicate-compatible API and records it in the
//! `generations` table. The caller is expected to have charged the account
//! before calling [`GenerationClient::create_prediction`].

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::GenerationConfig;
use crate::error::{ApiError, ApiResult};

/// Maximum prompt length accepted from clients
pub const MAX_PROMPT_CHARS: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct PredictionRequest<'a> {
    version: &'a str,
    input: PredictionInput<'a>,
}

#[derive(Debug, Serialize)]
struct PredictionInput<'a> {
    prompt: &'a str,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GenerationRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub prompt: String,
    pub prediction_id: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub fn validate_prompt(prompt: &str) -> ApiResult<&str> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(ApiError::Validation("Prompt must not be empty".to_string()));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(ApiError::Validation(format!(
            "Prompt must be at most {} characters",
            MAX_PROMPT_CHARS
        )));
    }
    Ok(prompt)
}

#[derive(Clone)]
pub struct GenerationClient {
    http: reqwest::Client,
    config: GenerationConfig,
}

impl GenerationClient {
    pub fn new(config: GenerationConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub async fn create_prediction(&self, prompt: &str) -> ApiResult<Prediction> {
        let url = format!(
            "{}/v1/predictions",
            self.config.api_base.trim_end_matches('/')
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_token)
            .json(&PredictionRequest {
                version: &self.config.model_version,
                input: PredictionInput { prompt },
            })
            .send()
            .await
            .map_err(|e| ApiError::BadGateway(format!("Generation provider unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::BadGateway(format!(
                "Generation provider returned {}: {}",
                status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::BadGateway(format!("Invalid provider response: {}", e)))
    }
}

pub async fn record_generation(
    pool: &PgPool,
    account_id: Uuid,
    prompt: &str,
    prediction: &Prediction,
) -> ApiResult<GenerationRecord> {
    let record: GenerationRecord = sqlx::query_as(
        r#"
        INSERT INTO generations (id, account_id, prompt, prediction_id, status, created_at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        RETURNING id, account_id, prompt, prediction_id, status, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(account_id)
    .bind(prompt)
    .bind(&prediction.id)
    .bind(&prediction.status)
    .fetch_one(pool)
    .await?;

    Ok(record)
}
