//! Storage engine for refsync
//!
//! Handles SQLite database operations, WAL mode, and schema management.

mod connection;
pub mod conflict_queries;
pub mod history;
pub mod library_queries;
mod migrations;
pub mod version_store;

pub use connection::Storage;
pub use history::{HistoryFilter, NewRecord};
pub use migrations::SCHEMA_VERSION;
pub use version_store::VersionStore;
