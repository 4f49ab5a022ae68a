//! Remote service seam
//!
//! The orchestrator only ever talks to the remote through
//! [`ExternalSourceAdapter`]; network failures surface as
//! `AdapterUnavailable` and abort the pass without touching the cursor.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{Result, SyncError};
use crate::types::{Item, ItemKind, ItemPayload, PushOutcome, RemoteChange, RemoteChangeBatch};

/// A remote source of truth for one or more libraries
///
/// `fetch_changes_since` must return changes ordered by remote version and
/// be restartable from any version: the caller persists the highest fully
/// ingested version and may re-request from it after a crash.
#[async_trait]
pub trait ExternalSourceAdapter: Send + Sync {
    /// One page of changes strictly after `since_version`
    async fn fetch_changes_since(
        &self,
        library_remote_id: &str,
        since_version: i64,
    ) -> Result<RemoteChangeBatch>;

    /// Offer one locally modified item to the remote
    async fn push_change(&self, library_remote_id: &str, item: &Item) -> Result<PushOutcome>;
}

#[derive(Default)]
struct LibraryScript {
    /// Staged changes, kept sorted by remote version
    changes: Vec<RemoteChange>,
    /// Highest version the remote claims to have, >= staged max
    latest_version: i64,
}

#[derive(Default)]
struct ScriptState {
    libraries: HashMap<String, LibraryScript>,
    fail_fetches: u32,
    fail_pushes: u32,
    reject_keys: Vec<String>,
    pushed: Vec<(String, String, i64)>,
    next_push_version: i64,
}

/// In-memory adapter driven entirely by staged data
///
/// Used by tests and the CLI's dry-run mode. Failure injection covers the
/// paths a live service exercises: outages (`fail_next_fetches`,
/// `fail_next_pushes`) and per-item push refusals (`reject_pushes_for`).
pub struct ScriptedAdapter {
    state: Mutex<ScriptState>,
    page_size: usize,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::with_page_size(50)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(ScriptState {
                next_push_version: 1_000,
                ..Default::default()
            }),
            page_size: page_size.max(1),
        }
    }

    /// Stage a fully specified remote change
    pub fn stage(&self, library_remote_id: &str, change: RemoteChange) {
        let mut state = self.state.lock();
        let script = state.libraries.entry(library_remote_id.to_string()).or_default();
        script.latest_version = script.latest_version.max(change.version);
        script.changes.push(change);
        script.changes.sort_by_key(|c| c.version);
    }

    /// Stage an upsert with just the interesting fields
    pub fn stage_update(
        &self,
        library_remote_id: &str,
        external_key: &str,
        version: i64,
        payload: ItemPayload,
    ) {
        self.stage(
            library_remote_id,
            RemoteChange {
                external_key: external_key.to_string(),
                kind: ItemKind::Record,
                version,
                payload,
                deleted: false,
                actor: None,
                observed_at: Utc::now(),
            },
        );
    }

    /// Stage a tombstone
    pub fn stage_delete(&self, library_remote_id: &str, external_key: &str, version: i64) {
        self.stage(
            library_remote_id,
            RemoteChange {
                external_key: external_key.to_string(),
                kind: ItemKind::Record,
                version,
                payload: ItemPayload::new(),
                deleted: true,
                actor: None,
                observed_at: Utc::now(),
            },
        );
    }

    /// The next `n` fetch calls fail as if the service were down
    pub fn fail_next_fetches(&self, n: u32) {
        self.state.lock().fail_fetches = n;
    }

    /// The next `n` push calls fail as if the service were down
    pub fn fail_next_pushes(&self, n: u32) {
        self.state.lock().fail_pushes = n;
    }

    /// Pushes for this external key come back `Rejected`
    pub fn reject_pushes_for(&self, external_key: &str) {
        self.state.lock().reject_keys.push(external_key.to_string());
    }

    /// Accepted pushes so far as (library, external key, pushed version)
    pub fn pushed(&self) -> Vec<(String, String, i64)> {
        self.state.lock().pushed.clone()
    }
}

impl Default for ScriptedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExternalSourceAdapter for ScriptedAdapter {
    async fn fetch_changes_since(
        &self,
        library_remote_id: &str,
        since_version: i64,
    ) -> Result<RemoteChangeBatch> {
        let mut state = self.state.lock();
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(SyncError::AdapterUnavailable(
                "scripted fetch outage".to_string(),
            ));
        }

        let script = match state.libraries.get(library_remote_id) {
            Some(script) => script,
            None => {
                return Ok(RemoteChangeBatch {
                    changes: Vec::new(),
                    latest_version: since_version,
                    has_more: false,
                })
            }
        };

        let remaining: Vec<&RemoteChange> = script
            .changes
            .iter()
            .filter(|c| c.version > since_version)
            .collect();
        let has_more = remaining.len() > self.page_size;
        let changes: Vec<RemoteChange> = remaining
            .into_iter()
            .take(self.page_size)
            .cloned()
            .collect();

        Ok(RemoteChangeBatch {
            changes,
            latest_version: script.latest_version.max(since_version),
            has_more,
        })
    }

    async fn push_change(&self, library_remote_id: &str, item: &Item) -> Result<PushOutcome> {
        let mut state = self.state.lock();
        if state.fail_pushes > 0 {
            state.fail_pushes -= 1;
            return Err(SyncError::AdapterUnavailable(
                "scripted push outage".to_string(),
            ));
        }

        if state.reject_keys.iter().any(|k| k == &item.external_key) {
            return Ok(PushOutcome::Rejected {
                reason: format!("remote refused {}", item.external_key),
            });
        }

        state.next_push_version += 1;
        let remote_version = state.next_push_version;
        state.pushed.push((
            library_remote_id.to_string(),
            item.external_key.clone(),
            item.version,
        ));

        // Accepted pushes also become visible as remote changes, the way a
        // live service would echo them back on the next fetch
        let script = state.libraries.entry(library_remote_id.to_string()).or_default();
        script.latest_version = script.latest_version.max(remote_version);

        Ok(PushOutcome::Accepted { remote_version })
    }
}
