//! Postgres-backed [`Store`].

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::{
    DbError,
    models::{AppAuthRow, EnvironmentRow, ExecutionRow, JobRow, OrgRow, WorkflowRow},
    repository::{blobs, cache, executions, jobs, orgs, workflows},
    store::Store,
};

/// Type alias for the shared Postgres pool used across the whole application.
pub type DbPool = PgPool;

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Connect with a pool ceiling of `max_connections`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, DbError> {
        info!("Connecting to database (max_connections={})", max_connections);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Run the embedded migrations from `./migrations` at the workspace root.
    pub async fn migrate(&self) -> Result<(), DbError> {
        info!("Running database migrations");
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn save_workflow(&self, row: WorkflowRow) -> Result<WorkflowRow, DbError> {
        workflows::upsert_workflow(&self.pool, &row).await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError> {
        workflows::get_workflow(&self.pool, id).await
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRow>, DbError> {
        workflows::list_workflows(&self.pool).await
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), DbError> {
        workflows::delete_workflow(&self.pool, id).await
    }

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRow, DbError> {
        executions::get_execution(&self.pool, id).await
    }

    async fn set_execution(&self, row: ExecutionRow, expected_version: i64) -> Result<i64, DbError> {
        executions::set_execution(&self.pool, &row, expected_version).await
    }

    async fn get_cache(&self, key: &str) -> Result<Option<String>, DbError> {
        cache::get_cache(&self.pool, key).await
    }

    async fn set_cache(&self, key: &str, value: String, ttl: Duration) -> Result<(), DbError> {
        cache::set_cache(&self.pool, key, &value, ttl).await
    }

    async fn delete_cache(&self, key: &str) -> Result<(), DbError> {
        cache::delete_cache(&self.pool, key).await
    }

    async fn get_org(&self, org_id: &str) -> Result<OrgRow, DbError> {
        orgs::get_org(&self.pool, org_id).await
    }

    async fn get_environments(&self, org_id: &str) -> Result<Vec<EnvironmentRow>, DbError> {
        orgs::get_environments(&self.pool, org_id).await
    }

    async fn get_app_auth(&self, org_id: &str, id: &str) -> Result<Option<AppAuthRow>, DbError> {
        orgs::get_app_auth(&self.pool, org_id, id).await
    }

    async fn get_all_app_auth(&self, org_id: &str) -> Result<Vec<AppAuthRow>, DbError> {
        orgs::get_all_app_auth(&self.pool, org_id).await
    }

    async fn set_app_auth(&self, row: AppAuthRow) -> Result<(), DbError> {
        orgs::upsert_app_auth(&self.pool, &row).await
    }

    async fn put_blob(&self, key: &str, data: Vec<u8>) -> Result<(), DbError> {
        blobs::put_blob(&self.pool, key, &data).await
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        blobs::get_blob(&self.pool, key).await
    }

    async fn enqueue_job(
        &self,
        execution_id: Uuid,
        workflow_id: Uuid,
        priority: i32,
        payload: serde_json::Value,
    ) -> Result<JobRow, DbError> {
        jobs::enqueue_job(&self.pool, execution_id, workflow_id, priority, payload).await
    }

    async fn fetch_next_job(&self) -> Result<Option<JobRow>, DbError> {
        jobs::fetch_next_job(&self.pool).await
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<(), DbError> {
        jobs::complete_job(&self.pool, job_id).await
    }
}
