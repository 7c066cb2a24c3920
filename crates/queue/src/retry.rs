//! Bounded redelivery of results to the backend.
//!
//! Delivery is retried at a fixed interval, only for transport errors, and
//! at most `max_attempts` times. In clustered deployments the execution's
//! status is checked before every retry: once it is no longer EXECUTING the
//! result is stale and is dropped.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use engine::models::{ActionResult, ExecutionStatus};

use crate::{DeliveryError, ResultBackend};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub interval: Duration,
    /// Poll execution status before retrying.
    pub clustered: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5, interval: Duration::from_secs(5), clustered: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered { attempts: u32 },
    /// The execution moved on; the result was dropped.
    Abandoned,
}

pub struct RetryDispatcher {
    backend: Arc<dyn ResultBackend>,
    config: RetryConfig,
}

impl RetryDispatcher {
    pub fn new(backend: Arc<dyn ResultBackend>, config: RetryConfig) -> Self {
        Self { backend, config }
    }

    /// Deliver `result`, retrying transport failures.
    ///
    /// # Errors
    /// `Fatal` as soon as the backend rejects the result, `Exhausted` once
    /// every attempt failed.
    #[instrument(skip_all, fields(execution_id = %result.execution_id, node_id = %result.action.id))]
    pub async fn deliver(&self, result: &ActionResult) -> Result<Delivery, DeliveryError> {
        let max = self.config.max_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=max {
            if attempt > 1 {
                tokio::time::sleep(self.config.interval).await;
                if self.config.clustered && self.is_stale(result).await {
                    return Ok(Delivery::Abandoned);
                }
            }

            match self.backend.post_result(result).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(attempt, "Result delivered after retry");
                    }
                    return Ok(Delivery::Delivered { attempts: attempt });
                }
                Err(DeliveryError::Retryable(msg)) => {
                    warn!(attempt, max, error = %msg, "Result delivery failed; will retry");
                    last = msg;
                }
                Err(e) => return Err(e),
            }
        }

        error!(attempts = max, error = %last, "Giving up on result delivery");
        Err(DeliveryError::Exhausted { attempts: max, last })
    }

    async fn is_stale(&self, result: &ActionResult) -> bool {
        match self.backend.fetch_status(result.execution_id, &result.authorization).await {
            Ok(ExecutionStatus::Executing) => false,
            Ok(status) => {
                info!(%status, "Execution is no longer running; dropping result");
                true
            }
            // Can't tell; keep trying to deliver.
            Err(e) => {
                warn!(error = %e, "Status check failed");
                false
            }
        }
    }
}
