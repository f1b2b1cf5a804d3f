//! Persistence layer: libSQL-backed audit store for workers, worker
//! events, messages and reports.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
