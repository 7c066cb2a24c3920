//! Typed error type for the db crate.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Optimistic concurrency check failed: someone else wrote the record
    /// between our read and our write.
    #[error("version conflict on execution {id}: expected {expected}, found {found}")]
    VersionConflict { id: Uuid, expected: i64, found: i64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
