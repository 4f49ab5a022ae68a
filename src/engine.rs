//! Engine facade tying storage, locks, resolution, and sync together
//!
//! `SyncEngine` is the entry point request handling consumes: local edits,
//! lock management, conflict listing and resolution, history reads, and
//! registry setup. Construction opens the store and spawns the background
//! sync worker and lock sweeper.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::events::{EngineEvent, EventBus};
use crate::locks::LockManager;
use crate::permissions::{required_capability, PermissionResolver};
use crate::storage::{conflict_queries, history, library_queries, Storage, VersionStore};
use crate::sync::adapter::ExternalSourceAdapter;
use crate::sync::detector::ConflictDetector;
use crate::sync::orchestrator::{PassOutcome, SyncOrchestrator};
use crate::sync::resolver::{ConflictResolver, WriteOutcome};
use crate::sync::worker::SyncWorker;
use crate::types::{
    normalize_external_key, Conflict, ConnectionId, EngineConfig, Item, ItemKey, ItemPayload,
    Library, LibraryId, LibraryKind, LockMode, LockSession, LockTarget, ModificationRecord,
    PassSummary, ProposedWrite, RemoteConnection, ResolutionStrategy,
};

/// How often a waiting local edit re-probes a held hard lock
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Top-level handle over one sync database
pub struct SyncEngine {
    storage: Storage,
    store: VersionStore,
    locks: LockManager,
    resolver: ConflictResolver,
    orchestrator: SyncOrchestrator,
    worker: SyncWorker,
    events: EventBus,
    permissions: Arc<dyn PermissionResolver>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl SyncEngine {
    /// Open the database and spawn background tasks
    ///
    /// Must be called within a tokio runtime; the sync worker and the lock
    /// sweeper are spawned on it.
    pub fn start(
        config: EngineConfig,
        adapter: Arc<dyn ExternalSourceAdapter>,
        permissions: Arc<dyn PermissionResolver>,
    ) -> Result<Self> {
        let storage = Storage::open(config)?;
        Ok(Self::with_storage(storage, adapter, permissions))
    }

    /// Assemble on an already-open storage handle
    pub fn with_storage(
        storage: Storage,
        adapter: Arc<dyn ExternalSourceAdapter>,
        permissions: Arc<dyn PermissionResolver>,
    ) -> Self {
        let config = storage.config().clone();
        let events = EventBus::new(config.event_capacity);
        let store = VersionStore::new(storage.clone());
        let locks = LockManager::new(storage.clone(), config.lock_ttl_seconds);
        let detector = ConflictDetector::new(storage.clone(), events.clone());
        let resolver = ConflictResolver::new(
            storage.clone(),
            detector,
            events.clone(),
            config.resolve_max_retries,
        );
        let orchestrator =
            SyncOrchestrator::new(storage.clone(), adapter, resolver.clone(), events.clone());
        let worker = SyncWorker::start(
            storage.clone(),
            orchestrator.clone(),
            config.sync_debounce_ms,
            config.sync_interval_ms,
        );
        let sweeper = locks.spawn_sweeper(config.lock_sweep_interval_ms);

        tracing::info!(db = %storage.db_path(), "sync engine started");

        Self {
            storage,
            store,
            locks,
            resolver,
            orchestrator,
            worker,
            events,
            permissions,
            sweeper,
        }
    }

    /// Stop background tasks; libraries still marked dirty are flushed first
    pub async fn stop(&self) -> Result<()> {
        self.worker.stop().await?;
        self.sweeper.abort();
        Ok(())
    }

    /// Submit a local edit under the owning library's strategy
    ///
    /// A held hard lock denies on the spot unless `wait_timeout` is given,
    /// in which case the engine polls for release up to the deadline and
    /// then gives up with the denial it last saw.
    pub async fn propose_local_edit(
        &self,
        mut write: ProposedWrite,
        wait_timeout: Option<Duration>,
    ) -> Result<WriteOutcome> {
        write.key.external_key = normalize_external_key(&write.key.external_key)
            .map_err(|e| SyncError::InvalidInput(e.to_string()))?;

        let deadline = wait_timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            match self.resolver.submit(&write).await {
                Ok(outcome) => {
                    if outcome.is_committed() {
                        self.mark_dirty(write.key.library_id).await;
                    }
                    return Ok(outcome);
                }
                Err(SyncError::LockDenied { holder, expires_at }) => {
                    let now = tokio::time::Instant::now();
                    let Some(deadline) = deadline else {
                        return Err(SyncError::LockDenied { holder, expires_at });
                    };
                    if now >= deadline {
                        return Err(SyncError::LockDenied { holder, expires_at });
                    }
                    tracing::debug!(key = %write.key, holder = %holder, "edit waiting on hard lock");
                    tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Acquire a lock; soft announces presence, hard is exclusive
    pub fn acquire_lock(
        &self,
        target: LockTarget,
        holder: &str,
        mode: LockMode,
        ttl_seconds: Option<i64>,
    ) -> Result<LockSession> {
        match mode {
            LockMode::Soft => self.locks.acquire_soft(target, holder, ttl_seconds),
            LockMode::Hard => self.locks.acquire_hard(target, holder, ttl_seconds),
        }
    }

    /// Drop a held lock; false when nothing was held
    pub fn release_lock(&self, target: LockTarget, holder: &str, mode: LockMode) -> Result<bool> {
        self.locks.release(target, holder, mode)
    }

    /// Extend a held hard lock
    pub fn heartbeat_lock(&self, target: LockTarget, holder: &str) -> Result<LockSession> {
        self.locks.heartbeat(target, holder)
    }

    /// Live hard lock on a target, if any
    pub fn lock_holder(&self, target: LockTarget) -> Result<Option<LockSession>> {
        self.locks.hard_holder(target)
    }

    /// Live soft presence on a target
    pub fn presence(&self, target: LockTarget) -> Result<Vec<LockSession>> {
        self.locks.soft_holders(target)
    }

    /// Conflicts awaiting action, newest first; `None` spans all libraries
    pub fn list_pending_conflicts(
        &self,
        library_id: Option<LibraryId>,
        limit: i64,
    ) -> Result<Vec<Conflict>> {
        self.storage
            .with_connection(|conn| conflict_queries::open_conflicts(conn, library_id, limit))
    }

    pub fn get_conflict(&self, conflict_id: &str) -> Result<Option<Conflict>> {
        self.storage
            .with_connection(|conn| conflict_queries::get_conflict(conn, conflict_id))
    }

    pub fn count_open_conflicts(&self, library_id: Option<LibraryId>) -> Result<i64> {
        self.storage
            .with_connection(|conn| conflict_queries::count_open(conn, library_id))
    }

    /// Complete a pending conflict with the chosen final state
    ///
    /// Privileged strategies check the actor's capability first. The chosen
    /// state re-enters the write pipeline; if it races into a fresh
    /// collision the conflict stays open and the outcome says so.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        chosen_payload: ItemPayload,
        chosen_deleted: bool,
        actor: &str,
        notes: Option<String>,
    ) -> Result<WriteOutcome> {
        let conflict = self
            .get_conflict(conflict_id)?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", conflict_id)))?;

        if let Some(required) = required_capability(conflict.strategy) {
            let granted = self
                .permissions
                .resolve_actor_permissions(actor, conflict.library_id);
            if !granted.grants(required) {
                return Err(SyncError::PermissionDenied(format!(
                    "resolving conflict {} takes the {} capability",
                    conflict_id,
                    required.as_str()
                )));
            }
        }

        let outcome = self
            .resolver
            .resolve_pending(conflict_id, chosen_payload, chosen_deleted, actor, notes)
            .await?;
        if outcome.is_committed() {
            self.mark_dirty(conflict.library_id).await;
        }
        Ok(outcome)
    }

    /// Current state of an item; `None` when the key was never seen
    pub fn get_item(&self, key: &ItemKey) -> Result<Option<Item>> {
        let key = self.normalized(key)?;
        self.store.try_get(&key)
    }

    pub fn list_items(&self, library_id: LibraryId, include_deleted: bool) -> Result<Vec<Item>> {
        self.store.list_items(library_id, include_deleted)
    }

    /// Modification history for an item, newest first
    pub fn history(
        &self,
        key: &ItemKey,
        limit: i64,
        before_version: Option<i64>,
    ) -> Result<Vec<ModificationRecord>> {
        let key = self.normalized(key)?;
        let item = self.store.get(&key)?;
        self.storage
            .with_connection(|conn| history::history_for_item(conn, item.id, limit, before_version))
    }

    /// Local changes not yet accepted by the remote
    pub fn count_pending_changes(&self, library_id: LibraryId) -> Result<i64> {
        self.store.count_pending(library_id)
    }

    /// Register a remote account connection; idempotent per (user, account)
    pub fn register_connection(
        &self,
        user_id: &str,
        account_id: &str,
        label: Option<&str>,
    ) -> Result<RemoteConnection> {
        self.storage.with_transaction(|conn| {
            library_queries::create_connection(conn, user_id, account_id, label)
        })
    }

    /// Register a library under a connection; idempotent per (connection, remote id)
    pub fn register_library(
        &self,
        connection_id: ConnectionId,
        remote_id: &str,
        name: &str,
        kind: LibraryKind,
        strategy: ResolutionStrategy,
    ) -> Result<Library> {
        self.storage.with_transaction(|conn| {
            library_queries::create_library(conn, connection_id, remote_id, name, kind, strategy)
        })
    }

    pub fn set_library_strategy(
        &self,
        library_id: LibraryId,
        strategy: ResolutionStrategy,
    ) -> Result<()> {
        self.storage
            .with_connection(|conn| library_queries::set_strategy(conn, library_id, strategy))
    }

    pub fn get_library(&self, library_id: LibraryId) -> Result<Option<Library>> {
        self.storage
            .with_connection(|conn| library_queries::get_library(conn, library_id))
    }

    pub fn list_libraries(&self) -> Result<Vec<Library>> {
        self.storage.with_connection(library_queries::list_libraries)
    }

    /// Run a pull+push pass now, bypassing the debounce
    pub async fn sync_now(&self, library_id: LibraryId) -> Result<PassOutcome> {
        self.orchestrator.run_pass(library_id).await
    }

    /// Queue a pass through the worker
    pub async fn request_sync(&self, library_id: LibraryId) -> Result<()> {
        self.worker.trigger(library_id).await
    }

    /// Ask an in-flight pass to stop; true when one was running
    pub fn cancel_sync(&self, library_id: LibraryId) -> bool {
        self.orchestrator.cancel(library_id)
    }

    pub fn sync_running(&self, library_id: LibraryId) -> bool {
        self.orchestrator.is_running(library_id)
    }

    /// Latest pass row for a library
    pub fn last_pass(&self, library_id: LibraryId) -> Result<Option<PassSummary>> {
        self.storage
            .with_connection(|conn| library_queries::latest_pass(conn, library_id))
    }

    /// Recent pass rows, newest first
    pub fn pass_history(&self, library_id: LibraryId, limit: i64) -> Result<Vec<PassSummary>> {
        self.storage
            .with_connection(|conn| library_queries::list_passes(conn, library_id, limit))
    }

    /// Subscribe to conflict, lock, and pass events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn normalized(&self, key: &ItemKey) -> Result<ItemKey> {
        let external_key = normalize_external_key(&key.external_key)
            .map_err(|e| SyncError::InvalidInput(e.to_string()))?;
        Ok(ItemKey::new(key.library_id, external_key))
    }

    /// The edit is durable either way; a stopped worker only delays the push
    async fn mark_dirty(&self, library_id: LibraryId) {
        if let Err(err) = self.worker.mark_dirty(library_id).await {
            tracing::debug!(library = library_id, "dirty mark skipped: {}", err);
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{PermissionSet, StaticPermissions};
    use crate::sync::adapter::ScriptedAdapter;
    use crate::types::{ConflictStatus, ItemKind, PassState};

    struct Fixture {
        engine: SyncEngine,
        adapter: Arc<ScriptedAdapter>,
        library: Library,
    }

    fn test_storage() -> Storage {
        let config = EngineConfig {
            db_path: ":memory:".to_string(),
            sync_interval_ms: 0,
            ..EngineConfig::default()
        };
        Storage::open(config).unwrap()
    }

    fn fixture_with(
        strategy: ResolutionStrategy,
        permissions: Arc<dyn PermissionResolver>,
    ) -> Fixture {
        let adapter = Arc::new(ScriptedAdapter::new());
        let engine = SyncEngine::with_storage(test_storage(), adapter.clone(), permissions);
        let connection = engine.register_connection("alice", "acct-1", None).unwrap();
        let library = engine
            .register_library(
                connection.id,
                "lib-1",
                "Papers",
                LibraryKind::Personal,
                strategy,
            )
            .unwrap();
        Fixture {
            engine,
            adapter,
            library,
        }
    }

    fn fixture(strategy: ResolutionStrategy) -> Fixture {
        fixture_with(strategy, Arc::new(StaticPermissions::permissive()))
    }

    fn payload(title: &str) -> ItemPayload {
        let mut payload = ItemPayload::new();
        payload.insert("title".to_string(), serde_json::json!(title));
        payload
    }

    #[tokio::test]
    async fn test_local_edit_and_readback() {
        let fx = fixture(ResolutionStrategy::Manual);
        let key = ItemKey::new(fx.library.id, "AAAA0001");
        let write = ProposedWrite::create(key.clone(), ItemKind::Record, payload("Drafts"), "alice");

        let outcome = fx.engine.propose_local_edit(write, None).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(_)));

        let item = fx.engine.get_item(&key).unwrap().unwrap();
        assert_eq!(item.version, 1);
        assert!(!item.synced);
        assert_eq!(fx.engine.count_pending_changes(fx.library.id).unwrap(), 1);

        let records = fx.engine.history(&key, 10, None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].actor, "alice");
    }

    #[tokio::test]
    async fn test_keys_normalized_at_the_boundary() {
        let fx = fixture(ResolutionStrategy::Manual);
        let write = ProposedWrite::create(
            ItemKey::new(fx.library.id, "  aaaa0001 "),
            ItemKind::Record,
            payload("Drafts"),
            "alice",
        );
        fx.engine.propose_local_edit(write, None).await.unwrap();

        let item = fx
            .engine
            .get_item(&ItemKey::new(fx.library.id, "AAAA0001"))
            .unwrap()
            .unwrap();
        assert_eq!(item.external_key, "AAAA0001");

        let err = fx
            .engine
            .get_item(&ItemKey::new(fx.library.id, "short"))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_blocked_edit_waits_for_lock_release() {
        let fx = fixture(ResolutionStrategy::Manual);
        let key = ItemKey::new(fx.library.id, "AAAA0001");
        let create = ProposedWrite::create(key.clone(), ItemKind::Record, payload("Drafts"), "alice");
        fx.engine.propose_local_edit(create, None).await.unwrap();

        let item = fx.engine.get_item(&key).unwrap().unwrap();
        let target = LockTarget::item(item.id);
        fx.engine
            .acquire_lock(target, "alice", LockMode::Hard, None)
            .unwrap();

        // No wait budget: denied on the spot
        let write = ProposedWrite::update(key.clone(), 1, payload("Revised"), "bob");
        let err = fx
            .engine
            .propose_local_edit(write.clone(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::LockDenied { .. }));

        // Release while the retried edit is polling
        let engine = Arc::new(fx.engine);
        let releaser = {
            let engine = engine.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                engine.release_lock(target, "alice", LockMode::Hard).unwrap();
            })
        };

        let outcome = engine
            .propose_local_edit(write, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(_)));
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_wait_gives_up_at_the_deadline() {
        let fx = fixture(ResolutionStrategy::Manual);
        let key = ItemKey::new(fx.library.id, "AAAA0001");
        let create = ProposedWrite::create(key.clone(), ItemKind::Record, payload("Drafts"), "alice");
        fx.engine.propose_local_edit(create, None).await.unwrap();

        let item = fx.engine.get_item(&key).unwrap().unwrap();
        fx.engine
            .acquire_lock(LockTarget::item(item.id), "alice", LockMode::Hard, None)
            .unwrap();

        let write = ProposedWrite::update(key, 1, payload("Revised"), "bob");
        let started = std::time::Instant::now();
        let err = fx
            .engine
            .propose_local_edit(write, Some(Duration::from_millis(300)))
            .await
            .unwrap_err();

        match err {
            SyncError::LockDenied { holder, .. } => assert_eq!(holder, "alice"),
            other => panic!("expected LockDenied, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_admin_decides_gates_resolution() {
        // First library in a fresh store registers as id 1
        let permissions = StaticPermissions::new()
            .with_fallback(PermissionSet::contributor())
            .grant("dana", 1, PermissionSet::admin());
        let fx = fixture_with(ResolutionStrategy::AdminDecides, Arc::new(permissions));

        let key = ItemKey::new(fx.library.id, "AAAA0001");
        let create = ProposedWrite::create(key.clone(), ItemKind::Record, payload("First"), "alice");
        fx.engine.propose_local_edit(create, None).await.unwrap();
        let update = ProposedWrite::update(key.clone(), 1, payload("Second"), "alice");
        fx.engine.propose_local_edit(update, None).await.unwrap();

        let racing = ProposedWrite::update(key.clone(), 1, payload("Third"), "bob");
        let outcome = fx.engine.propose_local_edit(racing, None).await.unwrap();
        let conflict_id = match outcome {
            WriteOutcome::Pending { conflict_id } => conflict_id,
            other => panic!("expected Pending, got {other:?}"),
        };
        assert_eq!(
            fx.engine
                .list_pending_conflicts(Some(fx.library.id), 10)
                .unwrap()
                .len(),
            1
        );

        let err = fx
            .engine
            .resolve_conflict(&conflict_id, payload("Bob's pick"), false, "bob", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::PermissionDenied(_)));

        let outcome = fx
            .engine
            .resolve_conflict(
                &conflict_id,
                payload("Dana's pick"),
                false,
                "dana",
                Some("admin call".to_string()),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(_)));

        let conflict = fx.engine.get_conflict(&conflict_id).unwrap().unwrap();
        assert_eq!(conflict.status, ConflictStatus::Resolved);
        assert_eq!(conflict.resolved_by.as_deref(), Some("dana"));
        assert!(fx
            .engine
            .list_pending_conflicts(Some(fx.library.id), 10)
            .unwrap()
            .is_empty());

        let item = fx.engine.get_item(&key).unwrap().unwrap();
        assert_eq!(item.payload["title"], serde_json::json!("Dana's pick"));
    }

    #[tokio::test]
    async fn test_sync_now_pulls_remote_changes() {
        let fx = fixture(ResolutionStrategy::Manual);
        fx.adapter
            .stage_update("lib-1", "BBBB0002", 1, payload("Remote paper"));

        let outcome = fx.engine.sync_now(fx.library.id).await.unwrap();
        let summary = match outcome {
            PassOutcome::Ran(summary) => summary,
            PassOutcome::AlreadyRunning => panic!("expected the pass to run"),
        };
        assert_eq!(summary.state, PassState::Completed);
        assert_eq!(summary.added, 1);

        let item = fx
            .engine
            .get_item(&ItemKey::new(fx.library.id, "BBBB0002"))
            .unwrap()
            .unwrap();
        assert!(item.synced);

        let last = fx.engine.last_pass(fx.library.id).unwrap().unwrap();
        assert_eq!(last.id, summary.id);
        assert_eq!(fx.engine.pass_history(fx.library.id, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_edits_survive_worker_shutdown() {
        let fx = fixture(ResolutionStrategy::Manual);
        fx.engine.stop().await.unwrap();

        let write = ProposedWrite::create(
            ItemKey::new(fx.library.id, "AAAA0001"),
            ItemKind::Record,
            payload("After shutdown"),
            "alice",
        );
        let outcome = fx.engine.propose_local_edit(write, None).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(_)));
    }
}
