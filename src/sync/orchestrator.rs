//! Per-library sync passes
//!
//! A pass pulls remote changes through the detector/resolver pipeline, then
//! pushes pending local changes back. The cursor only advances past fully
//! committed pages, so a crash or abort redelivers the unprocessed tail on
//! the next pass and op-id idempotency absorbs the replay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;

use crate::error::{Result, SyncError};
use crate::events::{EngineEvent, EventBus};
use crate::storage::{conflict_queries, library_queries, Storage, VersionStore};
use crate::sync::adapter::ExternalSourceAdapter;
use crate::sync::resolver::{ConflictResolver, WriteOutcome};
use crate::types::{
    Item, ItemKey, Library, LibraryId, PassState, PassSummary, ProposedWrite, PushOutcome,
    RemoteChange, WriteOperation, WriteSource,
};

/// Result of asking for a pass
#[derive(Debug, Clone)]
pub enum PassOutcome {
    Ran(PassSummary),
    /// A pass for this library was already in flight; nothing was done
    AlreadyRunning,
}

/// Drives pull/push passes, one at a time per library
#[derive(Clone)]
pub struct SyncOrchestrator {
    storage: Storage,
    store: VersionStore,
    adapter: Arc<dyn ExternalSourceAdapter>,
    resolver: ConflictResolver,
    events: EventBus,
    /// Presence marks a running pass; the flag requests cancellation
    active: Arc<DashMap<LibraryId, Arc<AtomicBool>>>,
}

/// Removes the library from the active map when the pass ends however it
/// ends
struct ActivePass {
    active: Arc<DashMap<LibraryId, Arc<AtomicBool>>>,
    library_id: LibraryId,
    cancel: Arc<AtomicBool>,
}

impl ActivePass {
    fn try_begin(
        active: Arc<DashMap<LibraryId, Arc<AtomicBool>>>,
        library_id: LibraryId,
    ) -> Option<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let inserted = match active.entry(library_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
                true
            }
        };
        if inserted {
            Some(Self {
                active,
                library_id,
                cancel,
            })
        } else {
            None
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

impl Drop for ActivePass {
    fn drop(&mut self) {
        self.active.remove(&self.library_id);
    }
}

impl SyncOrchestrator {
    pub fn new(
        storage: Storage,
        adapter: Arc<dyn ExternalSourceAdapter>,
        resolver: ConflictResolver,
        events: EventBus,
    ) -> Self {
        Self {
            store: VersionStore::new(storage.clone()),
            storage,
            adapter,
            resolver,
            events,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Run one pull+push pass for a library
    ///
    /// A second call while one is in flight returns `AlreadyRunning`.
    /// Adapter failures finish the pass as `failed` with the cursor where
    /// the last committed page left it.
    pub async fn run_pass(&self, library_id: LibraryId) -> Result<PassOutcome> {
        let guard = match ActivePass::try_begin(self.active.clone(), library_id) {
            Some(guard) => guard,
            None => return Ok(PassOutcome::AlreadyRunning),
        };

        let library = self
            .storage
            .with_connection(|conn| library_queries::get_library(conn, library_id))?
            .ok_or_else(|| SyncError::NotFound(format!("library {}", library_id)))?;

        let pass_id = self
            .storage
            .with_connection(|conn| library_queries::begin_pass(conn, library_id, library.sync_cursor))?;
        self.events.publish(EngineEvent::pass_started(library_id));
        tracing::info!(library = library_id, cursor = library.sync_cursor, "sync pass started");

        let mut summary = PassSummary {
            id: pass_id,
            library_id,
            state: PassState::Running,
            started_at: Utc::now(),
            finished_at: None,
            processed: 0,
            added: 0,
            updated: 0,
            deleted: 0,
            conflicted: 0,
            pushed: 0,
            push_rejected: 0,
            cursor_before: library.sync_cursor,
            cursor_after: library.sync_cursor,
            error: None,
        };

        match self.drive(&library, &guard, &mut summary).await {
            Ok(state) => summary.state = state,
            Err(err) => {
                tracing::warn!(library = library_id, error = %err, "sync pass failed");
                summary.state = PassState::Failed;
                summary.error = Some(err.to_string());
            }
        }
        summary.finished_at = Some(Utc::now());

        self.storage
            .with_connection(|conn| library_queries::finish_pass(conn, &summary))?;

        match summary.state {
            PassState::Failed => {
                let error = summary.error.as_deref().unwrap_or("unknown");
                self.events.publish(EngineEvent::pass_failed(library_id, error));
            }
            _ => self.events.publish(EngineEvent::pass_completed(&summary)),
        }
        tracing::info!(
            library = library_id,
            state = summary.state.as_str(),
            processed = summary.processed,
            conflicted = summary.conflicted,
            pushed = summary.pushed,
            "sync pass finished"
        );

        Ok(PassOutcome::Ran(summary))
    }

    /// Request cancellation of an in-flight pass; true when one was running
    pub fn cancel(&self, library_id: LibraryId) -> bool {
        match self.active.get(&library_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, library_id: LibraryId) -> bool {
        self.active.contains_key(&library_id)
    }

    async fn drive(
        &self,
        library: &Library,
        guard: &ActivePass,
        summary: &mut PassSummary,
    ) -> Result<PassState> {
        let mut cursor = library.sync_cursor;

        loop {
            if guard.cancelled() {
                return Ok(PassState::Cancelled);
            }

            let batch = self
                .adapter
                .fetch_changes_since(&library.remote_id, cursor)
                .await?;

            if batch.changes.is_empty() {
                self.storage.with_connection(|conn| {
                    library_queries::advance_cursor(conn, library.id, cursor, batch.latest_version)
                })?;
                break;
            }

            let mut page_max = cursor;
            for change in &batch.changes {
                // Cursor stays behind an interrupted page; redelivery is
                // absorbed by op-id idempotency
                if guard.cancelled() {
                    return Ok(PassState::Cancelled);
                }
                self.ingest(library.id, change, summary).await?;
                page_max = page_max.max(change.version);
            }

            self.storage.with_connection(|conn| {
                library_queries::advance_cursor(conn, library.id, page_max, batch.latest_version)
            })?;
            cursor = page_max;
            summary.cursor_after = cursor;

            if !batch.has_more {
                break;
            }
        }

        self.push_pending(library, guard, summary).await
    }

    async fn ingest(
        &self,
        library_id: LibraryId,
        change: &RemoteChange,
        summary: &mut PassSummary,
    ) -> Result<()> {
        summary.processed += 1;

        let key = ItemKey::new(library_id, &change.external_key);
        let current = self.store.try_get(&key)?;

        // A tombstone for a key we never held needs no local record
        if change.deleted && current.is_none() {
            return Ok(());
        }

        let existed = current.is_some();
        let write = remote_write(key, change, current.as_ref());

        match self.resolver.submit(&write).await? {
            WriteOutcome::Applied(_) => {
                if change.deleted {
                    summary.deleted += 1;
                } else if existed {
                    summary.updated += 1;
                } else {
                    summary.added += 1;
                }
            }
            WriteOutcome::Merged(_) => summary.updated += 1,
            WriteOutcome::Pending { .. } | WriteOutcome::Escalated { .. } => {
                summary.conflicted += 1;
            }
            WriteOutcome::Unchanged(_) | WriteOutcome::Superseded { .. } => {}
        }
        Ok(())
    }

    async fn push_pending(
        &self,
        library: &Library,
        guard: &ActivePass,
        summary: &mut PassSummary,
    ) -> Result<PassState> {
        let pending = self.store.pending_local_changes(library.id)?;
        if pending.is_empty() {
            return Ok(PassState::Completed);
        }
        let contested = self
            .storage
            .with_connection(|conn| conflict_queries::open_conflict_keys(conn, library.id))?;
        tracing::debug!(library = library.id, count = pending.len(), "pushing local changes");

        for item in pending {
            if guard.cancelled() {
                return Ok(PassState::Cancelled);
            }

            // Contested state stays home until someone resolves the conflict
            if contested.contains(&item.external_key) {
                tracing::debug!(item = %item.external_key, "held back, conflict open");
                continue;
            }

            match self.adapter.push_change(&library.remote_id, &item).await? {
                PushOutcome::Accepted { remote_version } => {
                    let key = ItemKey::new(library.id, &item.external_key);
                    if self.store.mark_pushed(&key, item.version, remote_version)? {
                        summary.pushed += 1;
                    } else {
                        // Edited again while the push was in flight; the newer
                        // state goes out on the next pass
                        tracing::debug!(item = %key, "push confirmed for an old version");
                    }
                }
                PushOutcome::Rejected { reason } => {
                    summary.push_rejected += 1;
                    tracing::warn!(
                        library = library.id,
                        item = %item.external_key,
                        reason = %reason,
                        "remote rejected pushed change"
                    );
                }
            }
        }
        Ok(PassState::Completed)
    }
}

/// Shape a remote change as a proposed write against the last point where
/// local and remote agreed; unpushed local edits make it stale and send it
/// through the merge/conflict machinery
fn remote_write(key: ItemKey, change: &RemoteChange, current: Option<&Item>) -> ProposedWrite {
    let base_version = current.map(|item| item.last_synced_version).unwrap_or(0);
    let operation = if current.is_none() {
        WriteOperation::Create
    } else if change.deleted {
        WriteOperation::Delete
    } else {
        WriteOperation::Update
    };

    ProposedWrite {
        op_id: format!(
            "remote:{}:{}:{}",
            key.library_id, key.external_key, change.version
        ),
        key,
        kind: change.kind,
        base_version,
        payload: change.payload.clone(),
        deleted: change.deleted,
        operation,
        actor: change
            .actor
            .clone()
            .unwrap_or_else(|| "remote".to_string()),
        source: WriteSource::Remote,
        remote_version: Some(change.version),
        resolution: None,
        observed_at: change.observed_at,
    }
}
