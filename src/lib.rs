//! refsync - reference library synchronization engine
//!
//! Versioned bibliographic items with optimistic concurrency, an
//! append-only modification log, advisory and exclusive locks, and
//! pluggable conflict resolution against an authoritative remote.

pub mod engine;
pub mod error;
pub mod events;
pub mod locks;
pub mod permissions;
pub mod storage;
pub mod sync;
pub mod types;

pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
