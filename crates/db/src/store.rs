//! The `Store` trait: the persistence and config gateway consumed by the engine.
//!
//! Every engine component talks to storage exclusively through this trait so
//! the same code runs against Postgres in production and [`MemoryStore`]
//! in tests.
//!
//! [`MemoryStore`]: crate::memory::MemoryStore

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    DbError,
    models::{AppAuthRow, EnvironmentRow, ExecutionRow, JobRow, OrgRow, WorkflowRow},
};

#[async_trait]
pub trait Store: Send + Sync {
    // ------ workflows ------

    async fn save_workflow(&self, row: WorkflowRow) -> Result<WorkflowRow, DbError>;

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError>;

    async fn list_workflows(&self) -> Result<Vec<WorkflowRow>, DbError>;

    async fn delete_workflow(&self, id: Uuid) -> Result<(), DbError>;

    // ------ executions ------

    /// Fetch an execution document. `DbError::NotFound` if absent.
    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRow, DbError>;

    /// Write an execution document if its stored version still equals
    /// `expected_version` (0 for a record that must not exist yet).
    ///
    /// Returns the new version on success and `DbError::VersionConflict`
    /// when another writer got there first.
    async fn set_execution(&self, row: ExecutionRow, expected_version: i64) -> Result<i64, DbError>;

    // ------ short-TTL cache ------

    async fn get_cache(&self, key: &str) -> Result<Option<String>, DbError>;

    async fn set_cache(&self, key: &str, value: String, ttl: Duration) -> Result<(), DbError>;

    async fn delete_cache(&self, key: &str) -> Result<(), DbError>;

    // ------ org configuration ------

    async fn get_org(&self, org_id: &str) -> Result<OrgRow, DbError>;

    async fn get_environments(&self, org_id: &str) -> Result<Vec<EnvironmentRow>, DbError>;

    // ------ credentials ------

    async fn get_app_auth(&self, org_id: &str, id: &str) -> Result<Option<AppAuthRow>, DbError>;

    async fn get_all_app_auth(&self, org_id: &str) -> Result<Vec<AppAuthRow>, DbError>;

    async fn set_app_auth(&self, row: AppAuthRow) -> Result<(), DbError>;

    // ------ blob storage ------

    async fn put_blob(&self, key: &str, data: Vec<u8>) -> Result<(), DbError>;

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, DbError>;

    // ------ job queue ------

    async fn enqueue_job(
        &self,
        execution_id: Uuid,
        workflow_id: Uuid,
        priority: i32,
        payload: serde_json::Value,
    ) -> Result<JobRow, DbError>;

    /// Claim the highest-priority, oldest pending job.
    async fn fetch_next_job(&self) -> Result<Option<JobRow>, DbError>;

    async fn complete_job(&self, job_id: Uuid) -> Result<(), DbError>;
}
