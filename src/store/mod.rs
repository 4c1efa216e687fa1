//! Persistence layer: libSQL-backed storage for opt-ins and SMS requests.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
