//! `api` crate: HTTP surface of the execution engine.
//!
//! Exposes:
//!   GET    /api/v1/workflows
//!   POST   /api/v1/workflows
//!   GET    /api/v1/workflows/{id}
//!   PUT    /api/v1/workflows/{id}
//!   DELETE /api/v1/workflows/{id}
//!   POST   /api/v1/workflows/{id}/execute
//!   POST   /api/v1/hooks/{trigger_id}
//!   POST   /api/v1/streams
//!   POST   /api/v1/streams/results
//!   POST   /api/v1/workers/jobs/next
//!   POST   /api/v1/workers/jobs/{id}/complete

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use db::Store;
use engine::WorkflowExecutor;

pub use error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<WorkflowExecutor>,
}

impl AppState {
    pub fn new(executor: Arc<WorkflowExecutor>) -> Self {
        Self { executor }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.executor.store()
    }
}

pub fn router(state: AppState) -> Router {
    use handlers::{executions, streams, webhooks, workers, workflows};

    Router::new()
        .route("/api/v1/workflows", get(workflows::list).post(workflows::create))
        .route(
            "/api/v1/workflows/:id",
            get(workflows::get).put(workflows::save).delete(workflows::delete),
        )
        .route("/api/v1/workflows/:id/execute", post(executions::execute))
        .route("/api/v1/hooks/:trigger_id", post(webhooks::handle_webhook))
        .route("/api/v1/streams", post(streams::ingest))
        .route("/api/v1/streams/results", post(streams::results))
        .route("/api/v1/workers/jobs/next", post(workers::next_job))
        .route("/api/v1/workers/jobs/:id/complete", post(workers::complete_job))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `addr` and serve until the process is stopped.
pub async fn serve(addr: &str, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}
