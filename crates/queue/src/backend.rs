//! Client for the backend's result endpoints.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use engine::models::{ActionResult, ExecutionStatus};

use crate::DeliveryError;

/// The two backend calls a worker makes.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// `POST /api/v1/streams`
    async fn post_result(&self, result: &ActionResult) -> Result<(), DeliveryError>;

    /// `POST /api/v1/streams/results`, reduced to the execution's status.
    async fn fetch_status(&self, execution_id: Uuid, authorization: &str) -> Result<ExecutionStatus, DeliveryError>;
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct StatusOnly {
    status: ExecutionStatus,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { client, base_url }
    }

    async fn send(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response, DeliveryError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.post(&url).json(&body).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Fatal(format!("{url} answered {status}: {text}")));
        }
        debug!(%url, %status, "Backend accepted request");
        Ok(response)
    }
}

/// Transport failures are worth retrying; everything else isn't.
fn classify(err: reqwest::Error) -> DeliveryError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        DeliveryError::Retryable(err.to_string())
    } else {
        DeliveryError::Fatal(err.to_string())
    }
}

#[async_trait]
impl ResultBackend for HttpBackend {
    async fn post_result(&self, result: &ActionResult) -> Result<(), DeliveryError> {
        let body = serde_json::to_value(result).map_err(|e| DeliveryError::Fatal(e.to_string()))?;
        self.send("/api/v1/streams", body).await?;
        Ok(())
    }

    async fn fetch_status(&self, execution_id: Uuid, authorization: &str) -> Result<ExecutionStatus, DeliveryError> {
        let body = json!({ "execution_id": execution_id, "authorization": authorization });
        let response = self.send("/api/v1/streams/results", body).await?;
        let parsed: StatusOnly = response.json().await.map_err(|e| DeliveryError::Fatal(e.to_string()))?;
        Ok(parsed.status)
    }
}
