//! Engine event fan-out
//!
//! Conflict, lock, and sync-pass notifications for downstream alerting.
//! Delivery is fire-and-forget over a broadcast channel; subscribers that
//! lag past the channel capacity lose oldest events first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{Conflict, Item, ItemId, LibraryId, LockTarget, PassSummary};

/// Types of engine events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConflictDetected,
    ConflictResolved,
    LockOverridden,
    PassStarted,
    PassCompleted,
    PassFailed,
    ItemCommitted,
}

/// A single engine event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Event type
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Related library (if applicable)
    pub library_id: Option<LibraryId>,
    /// Related item (if applicable)
    pub item_id: Option<ItemId>,
    /// Related item key (if applicable)
    pub external_key: Option<String>,
    /// Related conflict (if applicable)
    pub conflict_id: Option<String>,
    /// Changed fields (for committed items)
    pub changes: Option<Vec<String>>,
    /// Additional data
    pub data: Option<serde_json::Value>,
}

impl EngineEvent {
    fn bare(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            library_id: None,
            item_id: None,
            external_key: None,
            conflict_id: None,
            changes: None,
            data: None,
        }
    }

    pub fn conflict_detected(conflict: &Conflict) -> Self {
        Self {
            library_id: Some(conflict.library_id),
            item_id: Some(conflict.item_id),
            external_key: Some(conflict.external_key.clone()),
            conflict_id: Some(conflict.id.clone()),
            data: Some(serde_json::json!({
                "strategy": conflict.strategy,
                "incoming_source": conflict.incoming_source,
            })),
            ..Self::bare(EventKind::ConflictDetected)
        }
    }

    pub fn conflict_resolved(conflict_id: &str, library_id: LibraryId, resolved_by: &str) -> Self {
        Self {
            library_id: Some(library_id),
            conflict_id: Some(conflict_id.to_string()),
            data: Some(serde_json::json!({ "resolved_by": resolved_by })),
            ..Self::bare(EventKind::ConflictResolved)
        }
    }

    /// A remote write applied over a live hard lock; the holder should refresh
    pub fn lock_overridden(
        target: LockTarget,
        holder: &str,
        library_id: LibraryId,
        external_key: &str,
    ) -> Self {
        Self {
            library_id: Some(library_id),
            item_id: Some(target.target_id),
            external_key: Some(external_key.to_string()),
            data: Some(serde_json::json!({ "holder": holder })),
            ..Self::bare(EventKind::LockOverridden)
        }
    }

    pub fn pass_started(library_id: LibraryId) -> Self {
        Self {
            library_id: Some(library_id),
            ..Self::bare(EventKind::PassStarted)
        }
    }

    pub fn pass_completed(summary: &PassSummary) -> Self {
        Self {
            library_id: Some(summary.library_id),
            data: serde_json::to_value(summary).ok(),
            ..Self::bare(EventKind::PassCompleted)
        }
    }

    pub fn pass_failed(library_id: LibraryId, error: &str) -> Self {
        Self {
            library_id: Some(library_id),
            data: Some(serde_json::json!({ "error": error })),
            ..Self::bare(EventKind::PassFailed)
        }
    }

    pub fn item_committed(item: &Item, changes: Vec<String>) -> Self {
        Self {
            library_id: Some(item.library_id),
            item_id: Some(item.id),
            external_key: Some(item.external_key.clone()),
            changes: Some(changes),
            data: Some(serde_json::json!({ "version": item.version })),
            ..Self::bare(EventKind::ItemCommitted)
        }
    }
}

/// Subscription filter for events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Only events for specific libraries
    pub library_ids: Option<Vec<LibraryId>>,
    /// Only specific event types
    pub kinds: Option<Vec<EventKind>>,
}

impl SubscriptionFilter {
    /// Check if an event matches this filter
    pub fn matches(&self, event: &EngineEvent) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        if let Some(ref ids) = self.library_ids {
            if let Some(library_id) = event.library_id {
                if !ids.contains(&library_id) {
                    return false;
                }
            }
        }

        true
    }
}

/// Broadcast hub for engine events
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; silently dropped when nobody listens
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}
