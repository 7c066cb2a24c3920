//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the execution engine.
///
/// Only validation and environment problems abort an operation visibly;
/// everything else is either self-healed or degrades toward eventual
/// completion and is logged instead of returned.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// No explicit, configured or flagged start node could be resolved.
    #[error("start node not found: '{0}'")]
    StartNodeNotFound(String),

    /// The workflow graph is malformed.
    #[error("workflow validation failed: {0}")]
    Validation(String),

    // ------ Preparation errors ------

    #[error("environment resolution failed: {0}")]
    EnvironmentResolution(String),

    #[error("no active environment for org '{0}'")]
    NoActiveEnvironmentForOrg(String),

    /// Subflow recursion went deeper than the configured bound.
    #[error("max execution depth exceeded: {depth} > {max}")]
    MaxExecutionDepthExceeded { depth: u32, max: u32 },

    // ------ Execution errors ------

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    /// The caller's authorization token doesn't match the execution.
    #[error("authorization mismatch for execution {0}")]
    Unauthorized(Uuid),

    /// The execution isn't in a state that allows the requested operation.
    #[error("execution {id} is {status}")]
    InvalidState { id: Uuid, status: String },

    /// Optimistic writes kept losing to concurrent writers.
    #[error("execution {0} kept changing underneath us; giving up")]
    WriteContention(Uuid),

    /// A credential could not be decrypted or refreshed.
    #[error("credential error: {0}")]
    Credential(String),

    /// Handing actions to workers failed.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
