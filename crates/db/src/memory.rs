//! In-process [`Store`] backed by `DashMap`s.
//!
//! Used by the test-suites and by single-node deployments that don't need
//! durability across restarts. Semantics (versioning, TTL expiry, job
//! ordering) match the Postgres implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    DbError,
    models::{AppAuthRow, EnvironmentRow, ExecutionRow, JobRow, JobStatus, OrgRow, WorkflowRow},
    store::Store,
};

#[derive(Default)]
pub struct MemoryStore {
    workflows: DashMap<Uuid, WorkflowRow>,
    executions: DashMap<Uuid, ExecutionRow>,
    cache: DashMap<String, (String, Instant)>,
    orgs: DashMap<String, OrgRow>,
    environments: DashMap<String, Vec<EnvironmentRow>>,
    auth: DashMap<(String, String), AppAuthRow>,
    blobs: DashMap<String, Vec<u8>>,
    jobs: Mutex<Vec<JobRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an organization together with its environments.
    pub fn insert_org(&self, org: OrgRow, environments: Vec<EnvironmentRow>) {
        self.environments.insert(org.id.clone(), environments);
        self.orgs.insert(org.id.clone(), org);
    }

    /// Number of jobs in any state. Handy in tests.
    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_workflow(&self, row: WorkflowRow) -> Result<WorkflowRow, DbError> {
        self.workflows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError> {
        self.workflows
            .get(&id)
            .map(|r| r.clone())
            .ok_or(DbError::NotFound)
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRow>, DbError> {
        let mut rows: Vec<WorkflowRow> = self.workflows.iter().map(|r| r.clone()).collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), DbError> {
        self.workflows.remove(&id).map(|_| ()).ok_or(DbError::NotFound)
    }

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRow, DbError> {
        self.executions
            .get(&id)
            .map(|r| r.clone())
            .ok_or(DbError::NotFound)
    }

    async fn set_execution(&self, mut row: ExecutionRow, expected_version: i64) -> Result<i64, DbError> {
        let id = row.id;
        row.updated_at = Utc::now();

        match self.executions.entry(id) {
            Entry::Occupied(mut existing) => {
                let found = existing.get().version;
                if found != expected_version {
                    return Err(DbError::VersionConflict { id, expected: expected_version, found });
                }
                row.version = found + 1;
                existing.insert(row);
                Ok(found + 1)
            }
            Entry::Vacant(slot) => {
                if expected_version != 0 {
                    return Err(DbError::VersionConflict { id, expected: expected_version, found: 0 });
                }
                row.version = 1;
                slot.insert(row);
                Ok(1)
            }
        }
    }

    async fn get_cache(&self, key: &str) -> Result<Option<String>, DbError> {
        let hit = match self.cache.get(key) {
            Some(entry) if entry.1 > Instant::now() => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if hit {
            // Expired: drop lazily.
            self.cache.remove(key);
        }
        Ok(None)
    }

    async fn set_cache(&self, key: &str, value: String, ttl: Duration) -> Result<(), DbError> {
        self.cache.insert(key.to_owned(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete_cache(&self, key: &str) -> Result<(), DbError> {
        self.cache.remove(key);
        Ok(())
    }

    async fn get_org(&self, org_id: &str) -> Result<OrgRow, DbError> {
        self.orgs.get(org_id).map(|r| r.clone()).ok_or(DbError::NotFound)
    }

    async fn get_environments(&self, org_id: &str) -> Result<Vec<EnvironmentRow>, DbError> {
        Ok(self.environments.get(org_id).map(|r| r.clone()).unwrap_or_default())
    }

    async fn get_app_auth(&self, org_id: &str, id: &str) -> Result<Option<AppAuthRow>, DbError> {
        Ok(self
            .auth
            .get(&(org_id.to_owned(), id.to_owned()))
            .map(|r| r.clone()))
    }

    async fn get_all_app_auth(&self, org_id: &str) -> Result<Vec<AppAuthRow>, DbError> {
        Ok(self
            .auth
            .iter()
            .filter(|r| r.key().0 == org_id)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn set_app_auth(&self, row: AppAuthRow) -> Result<(), DbError> {
        self.auth.insert((row.org_id.clone(), row.id.clone()), row);
        Ok(())
    }

    async fn put_blob(&self, key: &str, data: Vec<u8>) -> Result<(), DbError> {
        self.blobs.insert(key.to_owned(), data);
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.blobs.get(key).map(|b| b.clone()))
    }

    async fn enqueue_job(
        &self,
        execution_id: Uuid,
        workflow_id: Uuid,
        priority: i32,
        payload: serde_json::Value,
    ) -> Result<JobRow, DbError> {
        let now = Utc::now();
        let job = JobRow {
            id: Uuid::new_v4(),
            execution_id,
            workflow_id,
            status: JobStatus::Pending.to_string(),
            attempts: 0,
            max_attempts: 3,
            priority,
            payload,
            created_at: now,
            updated_at: now,
        };
        self.jobs.lock().await.push(job.clone());
        Ok(job)
    }

    async fn fetch_next_job(&self) -> Result<Option<JobRow>, DbError> {
        let mut jobs = self.jobs.lock().await;
        let pending = JobStatus::Pending.to_string();

        // Higher priority first, then FIFO.
        let next = jobs
            .iter_mut()
            .filter(|j| j.status == pending)
            .min_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));

        Ok(next.map(|job| {
            job.status = JobStatus::Processing.to_string();
            job.attempts += 1;
            job.updated_at = Utc::now();
            job.clone()
        }))
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<(), DbError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.iter_mut().find(|j| j.id == job_id).ok_or(DbError::NotFound)?;
        job.status = JobStatus::Completed.to_string();
        job.updated_at = Utc::now();
        Ok(())
    }
}
