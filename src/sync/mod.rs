//! Synchronization pipeline
//!
//! Pull path: the orchestrator pages remote changes through the detector
//! and resolver into the version store. Push path: pending local changes go
//! out through the adapter once no conflict holds them back. The worker
//! schedules passes; everything else is synchronous per item.

pub mod adapter;
pub mod detector;
pub mod merge;
pub mod orchestrator;
pub mod resolver;
pub mod worker;

pub use adapter::{ExternalSourceAdapter, ScriptedAdapter};
pub use detector::{ConflictDetector, ConflictReason, Detection};
pub use orchestrator::{PassOutcome, SyncOrchestrator};
pub use resolver::{ConflictResolver, WriteOutcome};
pub use worker::{SyncCommand, SyncWorker};
