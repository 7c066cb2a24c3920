//! HTTP mapping of engine and storage errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use db::DbError;
use engine::EngineError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Db(DbError::NotFound) => StatusCode::NOT_FOUND,
            Self::Db(DbError::VersionConflict { .. }) => StatusCode::CONFLICT,
            Self::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Engine(e) => match e {
                EngineError::StartNodeNotFound(_)
                | EngineError::Validation(_)
                | EngineError::NoActiveEnvironmentForOrg(_)
                | EngineError::MaxExecutionDepthExceeded { .. }
                | EngineError::Serialization(_) => StatusCode::BAD_REQUEST,
                EngineError::ExecutionNotFound(_) | EngineError::Database(DbError::NotFound) => StatusCode::NOT_FOUND,
                EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                EngineError::InvalidState { .. } | EngineError::WriteContention(_) => StatusCode::CONFLICT,
                EngineError::EnvironmentResolution(_)
                | EngineError::Credential(_)
                | EngineError::Dispatch(_)
                | EngineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "success": false, "reason": self.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
