//! `queue` crate: the worker side of the engine boundary.
//!
//! Workers report results to the backend's `/api/v1/streams` endpoint.
//! [`RetryDispatcher`] redelivers them when the transport fails, and
//! [`HttpTokenRefresher`] performs OAuth2 refreshes for the engine.

pub mod backend;
pub mod error;
pub mod oauth;
pub mod retry;

pub use backend::{HttpBackend, ResultBackend};
pub use error::DeliveryError;
pub use oauth::HttpTokenRefresher;
pub use retry::{Delivery, RetryConfig, RetryDispatcher};
