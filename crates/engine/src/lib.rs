//! `engine` crate: domain models, graph index and the workflow execution
//! engine: preparation, scheduling, result processing and subflow
//! propagation.

pub mod auth;
pub mod compression;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod graph;
pub mod models;
pub mod notify;
pub mod persist;
pub mod preparer;
pub mod processor;
pub mod scheduler;
pub mod subflow;

pub use config::EngineConfig;
pub use error::EngineError;
pub use executor::{ExecutionOutcome, WorkflowExecutor};
pub use graph::{find_child_nodes, validate_workflow, GraphIndex};
pub use models::{ActionResult, ActionStatus, ExecutionStatus, Workflow, WorkflowExecution};
pub use preparer::{resolve_start, ExecutionRequest};

#[cfg(test)]
mod executor_tests;
