//! Delivery error type.

use thiserror::Error;

/// Errors from reporting a result to the backend.
///
/// The variant decides retry behaviour:
/// - `Retryable`: transport trouble; the delivery is attempted again.
/// - `Fatal`: the backend rejected it; retrying won't help.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeliveryError {
    /// Transient failure (connection refused, timeout, socket exhaustion).
    #[error("retryable delivery error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal delivery error: {0}")]
    Fatal(String),

    #[error("delivery failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}
