//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models and carry no domain behaviour.
//! Domain types live in the `engine` crate; executions and workflows are
//! stored as opaque JSON documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
pub use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow definition row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub org_id: String,
    pub name: String,
    /// Full JSON workflow definition (actions, triggers, branches, …)
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// workflow_executions
// ---------------------------------------------------------------------------

/// A persisted workflow execution document.
///
/// `version` is bumped on every successful write and is the basis for
/// optimistic concurrency control: writers pass the version they read.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub org_id: String,
    pub status: String,
    pub version: i64,
    pub body: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// organizations / environments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrgRow {
    pub id: String,
    pub name: String,
}

/// An execution environment (a pool of workers) owned by an org.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EnvironmentRow {
    pub id: Uuid,
    pub org_id: String,
    pub name: String,
    /// `"cloud"` or `"onprem"`.
    pub env_type: String,
    pub is_default: bool,
    pub archived: bool,
}

// ---------------------------------------------------------------------------
// app authentication
// ---------------------------------------------------------------------------

/// One key/value of a stored credential. `value` may be ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFieldRow {
    pub key: String,
    pub value: String,
}

/// A stored credential record referenced by `Action.authentication_id`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AppAuthRow {
    pub id: String,
    pub org_id: String,
    pub label: String,
    pub app_name: String,
    pub active: bool,
    /// `"basic"`, `"apikey"`, `"oauth2"`, …
    pub auth_type: String,
    pub encrypted: bool,
    pub fields: Json<Vec<AuthFieldRow>>,
    /// Creation timestamp (unix seconds), part of the per-record key derivation.
    pub created: i64,
}

// ---------------------------------------------------------------------------
// job_queue
// ---------------------------------------------------------------------------

/// Possible statuses for a queued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLettered,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending      => write!(f, "pending"),
            Self::Processing   => write!(f, "processing"),
            Self::Completed    => write!(f, "completed"),
            Self::Failed       => write!(f, "failed"),
            Self::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

/// A job row fetched from the queue table. One job = one dispatched action.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
