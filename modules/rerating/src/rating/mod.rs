//! Rating engine collaborator
//!
//! The dispatcher hands flattened wallet operation id lists to a
//! [`RatingEngine`]; `HttpRatingEngine` is the production implementation.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RatingError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error (status {status_code}): {message}")]
    Api { status_code: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl RatingError {
    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        matches!(self, RatingError::Api { status_code, .. } if (500..600).contains(status_code))
    }
}

/// Result of one mass rerate call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerateOutcome {
    pub rerated: u64,
    pub failed: u64,
}

#[async_trait]
pub trait RatingEngine: Send + Sync {
    async fn apply_mass_rerate(
        &self,
        wo_ids: &[i64],
        use_same_price_plan: bool,
        edr_date_filter: Option<NaiveDate>,
    ) -> Result<RerateOutcome, RatingError>;
}

#[derive(Debug, Serialize)]
struct MassRerateRequest<'a> {
    wallet_operation_ids: &'a [i64],
    use_same_price_plan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    edr_date_filter: Option<NaiveDate>,
}

/// Rating engine reached over HTTP
#[derive(Clone)]
pub struct HttpRatingEngine {
    base_url: String,
    http_client: Client,
}

impl HttpRatingEngine {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RatingError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RatingError::Http(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/rating/mass-rerate", self.base_url)
    }
}

#[async_trait]
impl RatingEngine for HttpRatingEngine {
    async fn apply_mass_rerate(
        &self,
        wo_ids: &[i64],
        use_same_price_plan: bool,
        edr_date_filter: Option<NaiveDate>,
    ) -> Result<RerateOutcome, RatingError> {
        let body = MassRerateRequest {
            wallet_operation_ids: wo_ids,
            use_same_price_plan,
            edr_date_filter,
        };

        let response = self
            .http_client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|e| RatingError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RatingError::Api {
                status_code: status.as_u16(),
                message,
            });
        }

        response
            .json::<RerateOutcome>()
            .await
            .map_err(|e| RatingError::Parse(e.to_string()))
    }
}
