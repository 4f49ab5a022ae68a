//! End-to-end engine tests
//!
//! Each test drives the public `SyncEngine` surface against a scripted
//! remote: pull/push round trips, conflicts parked and resolved, lock
//! overrides, outages, and state surviving a restart on a real database
//! file.
//!
//! Run with: cargo test --test engine_tests

use std::sync::Arc;

use pretty_assertions::assert_eq;

use refsync::events::EventKind;
use refsync::permissions::StaticPermissions;
use refsync::storage::library_queries;
use refsync::sync::{PassOutcome, ScriptedAdapter, WriteOutcome};
use refsync::types::*;
use refsync::{Storage, SyncEngine, SyncError};

struct Harness {
    engine: SyncEngine,
    adapter: Arc<ScriptedAdapter>,
    library: Library,
}

fn memory_config() -> EngineConfig {
    EngineConfig {
        db_path: ":memory:".to_string(),
        sync_interval_ms: 0,
        ..EngineConfig::default()
    }
}

fn harness(strategy: ResolutionStrategy) -> Harness {
    let adapter = Arc::new(ScriptedAdapter::new());
    let engine = SyncEngine::start(
        memory_config(),
        adapter.clone(),
        Arc::new(StaticPermissions::permissive()),
    )
    .unwrap();
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
    Harness {
        engine,
        adapter,
        library,
    }
}

fn payload(title: &str) -> ItemPayload {
    let mut p = ItemPayload::new();
    p.insert("title".to_string(), serde_json::json!(title));
    p
}

fn ran(outcome: PassOutcome) -> PassSummary {
    match outcome {
        PassOutcome::Ran(summary) => summary,
        PassOutcome::AlreadyRunning => panic!("pass did not run"),
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<refsync::events::EngineEvent>) -> Vec<refsync::events::EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_pull_edit_push_round_trip() {
    let h = harness(ResolutionStrategy::Manual);
    h.adapter
        .stage_update("lib-1", "AAAA0001", 1, payload("Remote paper"));
    h.adapter
        .stage_update("lib-1", "BBBB0002", 2, payload("Another paper"));

    let summary = ran(h.engine.sync_now(h.library.id).await.unwrap());
    assert_eq!(summary.state, PassState::Completed);
    assert_eq!(summary.added, 2);
    assert_eq!(summary.cursor_after, 2);

    let key = ItemKey::new(h.library.id, "AAAA0001");
    let item = h.engine.get_item(&key).unwrap().unwrap();
    assert!(item.synced);

    let write = ProposedWrite::update(key.clone(), item.version, payload("My title"), "alice");
    let outcome = h.engine.propose_local_edit(write, None).await.unwrap();
    assert!(matches!(outcome, WriteOutcome::Applied(_)));
    assert_eq!(h.engine.count_pending_changes(h.library.id).unwrap(), 1);

    let summary = ran(h.engine.sync_now(h.library.id).await.unwrap());
    assert_eq!(summary.pushed, 1);

    let item = h.engine.get_item(&key).unwrap().unwrap();
    assert!(item.synced);
    assert_eq!(item.version, 2);
    assert!(item.remote_version.is_some());
    assert_eq!(
        h.adapter.pushed(),
        vec![("lib-1".to_string(), "AAAA0001".to_string(), 2)]
    );

    // Newest first: the local edit, then the remote ingest that created the row
    let records = h.engine.history(&key, 10, None).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].actor, "alice");
    assert_eq!(records[0].source, WriteSource::Local);
    assert_eq!(records[1].actor, "remote");
    assert_eq!(records[1].operation, WriteOperation::Create);
}

#[tokio::test]
async fn test_edits_and_cursor_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        db_path: dir
            .path()
            .join("refsync.db")
            .to_string_lossy()
            .to_string(),
        sync_interval_ms: 0,
        ..EngineConfig::default()
    };
    let adapter = Arc::new(ScriptedAdapter::new());
    adapter.stage_update("lib-1", "AAAA0001", 1, payload("Remote paper"));
    let key;

    let library_id = {
        let engine = SyncEngine::start(
            config.clone(),
            adapter.clone(),
            Arc::new(StaticPermissions::permissive()),
        )
        .unwrap();
        let connection = engine.register_connection("alice", "acct-1", None).unwrap();
        let library = engine
            .register_library(
                connection.id,
                "lib-1",
                "Papers",
                LibraryKind::Personal,
                ResolutionStrategy::Manual,
            )
            .unwrap();
        ran(engine.sync_now(library.id).await.unwrap());

        key = ItemKey::new(library.id, "AAAA0001");
        let write = ProposedWrite::update(key.clone(), 1, payload("Edited offline"), "alice");
        engine.propose_local_edit(write, None).await.unwrap();

        engine.stop().await.unwrap();
        library.id
    };

    // A crash mid-pass leaves a running row behind
    {
        let storage = Storage::open(config.clone()).unwrap();
        storage
            .with_connection(|conn| library_queries::begin_pass(conn, library_id, 1))
            .unwrap();
    }

    let engine = SyncEngine::start(
        config,
        adapter.clone(),
        Arc::new(StaticPermissions::permissive()),
    )
    .unwrap();

    let item = engine.get_item(&key).unwrap().unwrap();
    assert_eq!(item.payload["title"], serde_json::json!("Edited offline"));
    assert_eq!(item.version, 2);
    assert!(!item.synced);
    assert_eq!(engine.count_pending_changes(library_id).unwrap(), 1);

    let library = engine.get_library(library_id).unwrap().unwrap();
    assert_eq!(library.sync_cursor, 1);

    let summary = ran(engine.sync_now(library_id).await.unwrap());
    assert_eq!(summary.state, PassState::Completed);
    assert_eq!(summary.pushed, 1);
    assert!(engine.get_item(&key).unwrap().unwrap().synced);

    let passes = engine.pass_history(library_id, 10).unwrap();
    assert_eq!(passes.len(), 3);
    let interrupted = passes
        .iter()
        .find(|p| p.error.as_deref() == Some("interrupted"))
        .unwrap();
    assert_eq!(interrupted.state, PassState::Failed);
}

#[tokio::test]
async fn test_remote_override_notifies_lock_holder() {
    let h = harness(ResolutionStrategy::Manual);
    h.adapter
        .stage_update("lib-1", "AAAA0001", 1, payload("Remote paper"));
    ran(h.engine.sync_now(h.library.id).await.unwrap());

    let key = ItemKey::new(h.library.id, "AAAA0001");
    let item = h.engine.get_item(&key).unwrap().unwrap();
    let target = LockTarget::item(item.id);
    h.engine
        .acquire_lock(target, "alice", LockMode::Hard, None)
        .unwrap();

    let mut rx = h.engine.subscribe();
    h.adapter
        .stage_update("lib-1", "AAAA0001", 2, payload("Remote revision"));
    ran(h.engine.sync_now(h.library.id).await.unwrap());

    // The authoritative side applied over the lock and the holder was told
    let item = h.engine.get_item(&key).unwrap().unwrap();
    assert_eq!(item.payload["title"], serde_json::json!("Remote revision"));
    assert_eq!(item.version, 2);

    let events = drain(&mut rx);
    let override_event = events
        .iter()
        .find(|e| e.kind == EventKind::LockOverridden)
        .unwrap();
    assert_eq!(override_event.external_key.as_deref(), Some("AAAA0001"));
    assert_eq!(
        override_event.data.as_ref().unwrap()["holder"],
        serde_json::json!("alice")
    );
    assert!(events.iter().any(|e| e.kind == EventKind::PassStarted));
    assert!(events.iter().any(|e| e.kind == EventKind::PassCompleted));

    // Overriding does not release the lock; other local writers stay blocked
    let holder = h.engine.lock_holder(target).unwrap().unwrap();
    assert_eq!(holder.holder, "alice");
    let write = ProposedWrite::update(key, 2, payload("Bob's edit"), "bob");
    let err = h.engine.propose_local_edit(write, None).await.unwrap_err();
    assert!(matches!(err, SyncError::LockDenied { .. }));
}

#[tokio::test]
async fn test_push_outage_keeps_changes_pending() {
    let h = harness(ResolutionStrategy::Manual);
    let key = ItemKey::new(h.library.id, "AAAA0001");
    let write = ProposedWrite::create(key.clone(), ItemKind::Record, payload("Mine"), "alice");
    h.engine.propose_local_edit(write, None).await.unwrap();

    h.adapter.fail_next_pushes(1);
    let summary = ran(h.engine.sync_now(h.library.id).await.unwrap());
    assert_eq!(summary.state, PassState::Failed);
    assert!(summary.error.as_deref().unwrap().contains("outage"));
    assert!(!h.engine.get_item(&key).unwrap().unwrap().synced);
    assert_eq!(h.engine.count_pending_changes(h.library.id).unwrap(), 1);

    // Service back: the same change goes out untouched
    let summary = ran(h.engine.sync_now(h.library.id).await.unwrap());
    assert_eq!(summary.state, PassState::Completed);
    assert_eq!(summary.pushed, 1);
    assert!(h.engine.get_item(&key).unwrap().unwrap().synced);
}

#[tokio::test]
async fn test_manual_conflict_resolved_then_pushed() {
    let h = harness(ResolutionStrategy::Manual);
    let key = ItemKey::new(h.library.id, "AAAA0001");
    let create = ProposedWrite::create(key.clone(), ItemKind::Record, payload("First"), "alice");
    h.engine.propose_local_edit(create, None).await.unwrap();
    let update = ProposedWrite::update(key.clone(), 1, payload("Alice's"), "alice");
    h.engine.propose_local_edit(update, None).await.unwrap();

    let stale = ProposedWrite::update(key.clone(), 1, payload("Bob's"), "bob");
    let outcome = h.engine.propose_local_edit(stale, None).await.unwrap();
    let conflict_id = match outcome {
        WriteOutcome::Pending { conflict_id } => conflict_id,
        other => panic!("expected Pending, got {other:?}"),
    };

    // Contested: the pending edit stays home
    let summary = ran(h.engine.sync_now(h.library.id).await.unwrap());
    assert_eq!(summary.pushed, 0);
    assert!(h.adapter.pushed().is_empty());

    let outcome = h
        .engine
        .resolve_conflict(
            &conflict_id,
            payload("Merged by hand"),
            false,
            "alice",
            Some("kept both halves".to_string()),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, WriteOutcome::Applied(_)));
    assert!(h
        .engine
        .list_pending_conflicts(Some(h.library.id), 10)
        .unwrap()
        .is_empty());

    let records = h.engine.history(&key, 1, None).unwrap();
    assert!(records[0].is_conflict);
    assert_eq!(records[0].conflict_resolution.as_deref(), Some("manual"));

    let summary = ran(h.engine.sync_now(h.library.id).await.unwrap());
    assert_eq!(summary.pushed, 1);
    let item = h.engine.get_item(&key).unwrap().unwrap();
    assert_eq!(item.payload["title"], serde_json::json!("Merged by hand"));
    assert!(item.synced);
}

#[tokio::test]
async fn test_remote_delete_vs_local_edit_resolves_to_deletion() {
    let h = harness(ResolutionStrategy::Manual);
    h.adapter
        .stage_update("lib-1", "AAAA0001", 1, payload("Remote paper"));
    ran(h.engine.sync_now(h.library.id).await.unwrap());

    let key = ItemKey::new(h.library.id, "AAAA0001");
    let write = ProposedWrite::update(key.clone(), 1, payload("Local notes"), "alice");
    h.engine.propose_local_edit(write, None).await.unwrap();

    h.adapter.stage_delete("lib-1", "AAAA0001", 2);
    let summary = ran(h.engine.sync_now(h.library.id).await.unwrap());
    assert_eq!(summary.conflicted, 1);
    assert_eq!(summary.deleted, 0);

    // The local edit survives until someone decides
    let item = h.engine.get_item(&key).unwrap().unwrap();
    assert!(!item.deleted);
    assert_eq!(item.payload["title"], serde_json::json!("Local notes"));

    let conflicts = h
        .engine
        .list_pending_conflicts(Some(h.library.id), 10)
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].incoming_deleted);

    let outcome = h
        .engine
        .resolve_conflict(
            &conflicts[0].id,
            conflicts[0].current_payload.clone(),
            true,
            "alice",
            Some("the deletion stands".to_string()),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, WriteOutcome::Applied(_)));

    let item = h.engine.get_item(&key).unwrap().unwrap();
    assert!(item.deleted);
    assert_eq!(item.version, 3);

    let records = h.engine.history(&key, 1, None).unwrap();
    assert_eq!(records[0].operation, WriteOperation::Delete);
    assert!(records[0].is_conflict);
}

#[tokio::test]
async fn test_libraries_sync_independently() {
    let h = harness(ResolutionStrategy::Manual);
    let connection_id = h.library.connection_id;
    let other = h
        .engine
        .register_library(
            connection_id,
            "lib-2",
            "Shared Group",
            LibraryKind::Group,
            ResolutionStrategy::AutoMerge,
        )
        .unwrap();

    h.adapter
        .stage_update("lib-1", "AAAA0001", 1, payload("Only in lib-1"));
    let first = ran(h.engine.sync_now(h.library.id).await.unwrap());
    let second = ran(h.engine.sync_now(other.id).await.unwrap());
    assert_eq!(first.added, 1);
    assert_eq!(second.processed, 0);
    assert_eq!(second.state, PassState::Completed);

    let write = ProposedWrite::create(
        ItemKey::new(other.id, "GGGG0009"),
        ItemKind::Record,
        payload("Group item"),
        "alice",
    );
    h.engine.propose_local_edit(write, None).await.unwrap();

    // A conflict in one library never shows up in the other
    let key = ItemKey::new(h.library.id, "AAAA0001");
    let update = ProposedWrite::update(key.clone(), 1, payload("Alice's"), "alice");
    h.engine.propose_local_edit(update, None).await.unwrap();
    let stale = ProposedWrite::update(key, 1, payload("Bob's"), "bob");
    let outcome = h.engine.propose_local_edit(stale, None).await.unwrap();
    assert!(matches!(outcome, WriteOutcome::Pending { .. }));

    assert_eq!(h.engine.count_open_conflicts(Some(h.library.id)).unwrap(), 1);
    assert_eq!(h.engine.count_open_conflicts(Some(other.id)).unwrap(), 0);
    assert_eq!(h.engine.count_open_conflicts(None).unwrap(), 1);

    let lib1_keys: Vec<String> = h
        .engine
        .list_items(h.library.id, false)
        .unwrap()
        .into_iter()
        .map(|i| i.external_key)
        .collect();
    assert_eq!(lib1_keys, vec!["AAAA0001".to_string()]);
    assert_eq!(h.engine.list_items(other.id, false).unwrap().len(), 1);
    assert_eq!(h.engine.count_pending_changes(other.id).unwrap(), 1);
}
