//! Repository functions, one function per database operation.
//!
//! Every function takes a `&PgPool` and returns a `Result<T, DbError>`.
//! Pure SQL; no domain types.

pub mod workflows;
pub mod executions;
pub mod jobs;
pub mod cache;
pub mod orgs;
pub mod blobs;
