//! `db` crate: pure persistence layer.
//!
//! Provides the [`Store`] gateway trait, typed row structs, a Postgres
//! implementation with one repository function per SQL operation, and an
//! in-memory implementation. No business logic lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use postgres::{DbPool, PgStore};
pub use store::Store;
