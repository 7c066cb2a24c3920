//! Engine configuration.
//!
//! One immutable value built at startup and shared (behind an `Arc`) by
//! every component. Nothing reads configuration from globals.

use std::time::Duration;

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL workers and children use to reach this backend.
    pub backend_url: String,
    /// Serialized size above which an execution gets compressed.
    pub compression_ceiling: usize,
    /// Any single field larger than this is moved to blob storage once the
    /// ceiling is exceeded.
    pub compression_field_threshold: usize,
    /// TTL of the per-node `{execution}_{action}_result` cache entries.
    pub result_cache_ttl: Duration,
    /// TTL of the "already dispatched" markers.
    pub dispatch_marker_ttl: Duration,
    /// TTL of the subflow dedup key.
    pub subflow_dedup_ttl: Duration,
    /// Deepest allowed subflow nesting.
    pub max_execution_depth: u32,
    /// Refresh OAuth2 tokens expiring within this window.
    pub oauth2_refresh_window: Duration,
    /// Read-modify-write attempts before giving up on a contended execution.
    pub max_write_conflicts: u32,
    /// Master secret mixed into every per-credential key.
    pub encryption_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8080".to_owned(),
            compression_ceiling: 1_000_000,
            compression_field_threshold: 50_000,
            result_cache_ttl: Duration::from_secs(30 * 60),
            dispatch_marker_ttl: Duration::from_secs(60),
            subflow_dedup_ttl: Duration::from_secs(60),
            max_execution_depth: 10,
            oauth2_refresh_window: Duration::from_secs(120),
            max_write_conflicts: 5,
            encryption_key: String::new(),
        }
    }
}

impl EngineConfig {
    /// Endpoint workers POST results to.
    pub fn streams_url(&self) -> String {
        format!("{}/api/v1/streams", self.backend_url.trim_end_matches('/'))
    }
}

/// Cache key of a node's latest result.
pub fn result_cache_key(execution_id: &uuid::Uuid, node_id: &str) -> String {
    format!("{execution_id}_{node_id}_result")
}

/// Cache key marking a node as already handed to a worker.
pub fn dispatch_marker_key(execution_id: &uuid::Uuid, node_id: &str) -> String {
    format!("{execution_id}_{node_id}_dispatched")
}

/// Mailbox a looping child writes its result to before the parent's slot
/// list is guaranteed to exist.
pub fn subflow_mailbox_key(child_execution_id: &str, parent_node: &str) -> String {
    format!("{child_execution_id}_{parent_node}_subflowresult")
}
