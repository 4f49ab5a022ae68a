//! Strategy dispatch for classified writes
//!
//! Clean writes commit, mergeable writes commit their field union, and
//! collisions are settled by the library's resolution strategy. Any CAS
//! race re-enters classification; the retry loop is bounded and exhaustion
//! parks the write as an escalated conflict rather than dropping it.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rusqlite::Connection;
use serde::Serialize;

use crate::error::{Result, SyncError};
use crate::events::{EngineEvent, EventBus};
use crate::storage::{conflict_queries, history, version_store, Storage, VersionStore};
use crate::sync::detector::{ConflictDetector, ConflictReason, Detection};
use crate::types::{
    CommittedWrite, Conflict, ConflictStatus, Item, ItemId, ItemKey, ItemPayload, ProposedWrite,
    ResolutionStrategy, WriteOperation, WriteSource,
};

/// What became of a submitted write
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Committed as given
    Applied(CommittedWrite),
    /// Stale but disjoint; the field union was committed
    Merged(CommittedWrite),
    /// Already reflected in the stored row; no version was spent
    Unchanged(Item),
    /// Parked as a conflict awaiting a human
    Pending { conflict_id: String },
    /// Parked after automatic resolution gave up
    Escalated { conflict_id: String },
    /// Lost to a newer write; retained in the conflict record only
    Superseded { conflict_id: String, current: Item },
}

impl WriteOutcome {
    /// The write reached the store in some form
    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            WriteOutcome::Applied(_) | WriteOutcome::Merged(_) | WriteOutcome::Unchanged(_)
        )
    }
}

/// Applies writes according to the owning library's resolution strategy
#[derive(Clone)]
pub struct ConflictResolver {
    storage: Storage,
    store: VersionStore,
    detector: ConflictDetector,
    events: EventBus,
    max_retries: u32,
}

impl ConflictResolver {
    pub fn new(
        storage: Storage,
        detector: ConflictDetector,
        events: EventBus,
        max_retries: u32,
    ) -> Self {
        Self {
            store: VersionStore::new(storage.clone()),
            storage,
            detector,
            events,
            max_retries,
        }
    }

    /// Submit a proposed write under the owning library's strategy
    pub async fn submit(&self, write: &ProposedWrite) -> Result<WriteOutcome> {
        let strategy = self.library_strategy(write.key.library_id)?;
        self.submit_with_strategy(write, strategy).await
    }

    pub(crate) async fn submit_with_strategy(
        &self,
        write: &ProposedWrite,
        strategy: ResolutionStrategy,
    ) -> Result<WriteOutcome> {
        match self.run_retrying(write, strategy).await {
            Err(SyncError::StaleVersion { .. }) => {
                tracing::warn!(op = %write.op_id, key = %write.key, "write retries exhausted");
                self.escalate_exhausted(write, strategy)
            }
            other => other,
        }
    }

    /// Classify-then-dispatch with bounded retries; exhaustion surfaces the
    /// final `StaleVersion` for the caller to settle
    async fn run_retrying(
        &self,
        write: &ProposedWrite,
        strategy: ResolutionStrategy,
    ) -> Result<WriteOutcome> {
        let mut attempt = 0u32;
        loop {
            let result = match self.detector.classify(write)? {
                Detection::Clean { current } => self.apply_clean(write, current),
                Detection::StaleMergeable {
                    current,
                    merged_payload,
                } => self.apply_stale(write, current, merged_payload, strategy),
                Detection::Conflicting { current, reason } => {
                    self.settle_conflict(write, current, reason, strategy)
                }
            };

            match result {
                Err(SyncError::StaleVersion { .. }) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = backoff_ms(attempt);
                    tracing::debug!(op = %write.op_id, attempt, delay, "write raced, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                other => return other,
            }
        }
    }

    /// Complete a pending or escalated conflict with a chosen payload
    ///
    /// The chosen state is applied as a fresh write against the current
    /// version; if it races into a new collision the original conflict
    /// stays open and the outcome says so. A resolution that keeps losing
    /// races past the retry bound returns `UnresolvableConflict` instead of
    /// parking a second conflict for the same item.
    pub async fn resolve_pending(
        &self,
        conflict_id: &str,
        chosen_payload: ItemPayload,
        chosen_deleted: bool,
        actor: &str,
        notes: Option<String>,
    ) -> Result<WriteOutcome> {
        let conflict = self
            .storage
            .with_connection(|conn| conflict_queries::get_conflict(conn, conflict_id))?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", conflict_id)))?;

        if conflict.status == ConflictStatus::Resolved {
            return Err(SyncError::InvalidInput(format!(
                "conflict {} is already resolved",
                conflict_id
            )));
        }

        let key = ItemKey::new(conflict.library_id, &conflict.external_key);
        let current = self.store.get(&key)?;

        let write = ProposedWrite {
            op_id: uuid::Uuid::new_v4().to_string(),
            key,
            kind: current.kind,
            base_version: current.version,
            payload: chosen_payload,
            deleted: chosen_deleted,
            operation: if chosen_deleted {
                WriteOperation::Delete
            } else {
                WriteOperation::Update
            },
            actor: actor.to_string(),
            source: WriteSource::Local,
            remote_version: None,
            resolution: Some(conflict.strategy),
            observed_at: Utc::now(),
        };

        let strategy = self.library_strategy(write.key.library_id)?;
        let outcome = match self.run_retrying(&write, strategy).await {
            Err(SyncError::StaleVersion { .. }) => {
                return Err(SyncError::UnresolvableConflict(format!(
                    "conflict {}: resolution kept losing races on {}; retry once writes settle",
                    conflict_id, conflict.external_key
                )));
            }
            other => other?,
        };
        if outcome.is_committed() {
            let resolved = self.storage.with_connection(|conn| {
                conflict_queries::mark_resolved(conn, conflict_id, actor, notes.as_deref())
            })?;
            if resolved {
                self.events.publish(EngineEvent::conflict_resolved(
                    conflict_id,
                    conflict.library_id,
                    actor,
                ));
            }
        }
        Ok(outcome)
    }

    fn library_strategy(&self, library_id: i64) -> Result<ResolutionStrategy> {
        self.storage.with_connection(|conn| {
            crate::storage::library_queries::get_library(conn, library_id)?
                .map(|library| library.strategy)
                .ok_or_else(|| SyncError::NotFound(format!("library {}", library_id)))
        })
    }

    fn apply_clean(&self, write: &ProposedWrite, current: Option<Item>) -> Result<WriteOutcome> {
        if let Some(current) = current {
            if current.payload == write.payload && current.deleted == write.deleted {
                return Ok(WriteOutcome::Unchanged(current));
            }
        }

        let committed = self.store.compare_and_swap(write)?;
        self.notify_commit(&committed);
        Ok(WriteOutcome::Applied(committed))
    }

    fn apply_stale(
        &self,
        write: &ProposedWrite,
        current: Item,
        merged_payload: ItemPayload,
        strategy: ResolutionStrategy,
    ) -> Result<WriteOutcome> {
        if merged_payload == current.payload && write.deleted == current.deleted {
            return Ok(WriteOutcome::Unchanged(current));
        }

        match strategy {
            ResolutionStrategy::AutoMerge => {
                // The merged state exists nowhere else yet, so it counts as
                // a local change and gets pushed on the next pass
                let merged_write = ProposedWrite {
                    op_id: write.op_id.clone(),
                    key: write.key.clone(),
                    kind: write.kind,
                    base_version: current.version,
                    payload: merged_payload,
                    deleted: write.deleted,
                    operation: write.operation,
                    actor: write.actor.clone(),
                    source: WriteSource::Local,
                    remote_version: write.remote_version,
                    resolution: Some(ResolutionStrategy::AutoMerge),
                    observed_at: write.observed_at,
                };

                let committed = self.store.compare_and_swap(&merged_write)?;
                tracing::info!(key = %write.key, version = committed.item.version, "stale write auto-merged");
                self.notify_commit(&committed);
                Ok(WriteOutcome::Merged(committed))
            }
            ResolutionStrategy::LatestWins => self.settle_latest_wins(write, current),
            ResolutionStrategy::Manual
            | ResolutionStrategy::AdminDecides
            | ResolutionStrategy::OwnerDecides => {
                self.park(write, &current, ConflictStatus::Pending, strategy, None)
            }
        }
    }

    fn settle_conflict(
        &self,
        write: &ProposedWrite,
        current: Option<Item>,
        reason: ConflictReason,
        strategy: ResolutionStrategy,
    ) -> Result<WriteOutcome> {
        if let ConflictReason::HardLockHeld { holder, expires_at } = reason {
            return Err(SyncError::LockDenied { holder, expires_at });
        }

        let current = current.ok_or_else(|| {
            SyncError::Internal(format!("conflict on {} without a stored row", write.key))
        })?;

        match strategy {
            ResolutionStrategy::LatestWins => self.settle_latest_wins(write, current),
            ResolutionStrategy::AutoMerge => self.park(
                write,
                &current,
                ConflictStatus::Escalated,
                strategy,
                Some(format!("not auto-mergeable: {}", reason.label())),
            ),
            ResolutionStrategy::Manual
            | ResolutionStrategy::AdminDecides
            | ResolutionStrategy::OwnerDecides => {
                self.park(write, &current, ConflictStatus::Pending, strategy, None)
            }
        }
    }

    /// Later wall-clock side wins wholesale; the loser survives in the
    /// conflict record. Audit row and winning CAS commit atomically.
    fn settle_latest_wins(&self, write: &ProposedWrite, current: Item) -> Result<WriteOutcome> {
        let incoming_wins = write.observed_at > current.updated_at;

        let (outcome, events) = self.storage.with_transaction(|conn| {
            if let Some(existing) = conflict_queries::find_by_op(conn, &write.op_id)? {
                return Ok((outcome_for_existing(existing, &current), Vec::new()));
            }

            let note = if incoming_wins {
                "incoming write is newer; applied over the stored row"
            } else {
                "stored row is newer; incoming payload retained for audit"
            };
            let conflict = build_conflict(
                conn,
                write,
                &current,
                ResolutionStrategy::LatestWins,
                ConflictStatus::Resolved,
                Some(note.to_string()),
            )?;
            conflict_queries::insert_conflict(conn, &conflict)?;

            let mut events = vec![
                EngineEvent::conflict_detected(&conflict),
                EngineEvent::conflict_resolved(&conflict.id, conflict.library_id, "latest-wins"),
            ];

            if incoming_wins {
                let winning = ProposedWrite {
                    op_id: write.op_id.clone(),
                    key: write.key.clone(),
                    kind: write.kind,
                    base_version: current.version,
                    payload: write.payload.clone(),
                    deleted: write.deleted,
                    operation: write.operation,
                    actor: write.actor.clone(),
                    source: write.source,
                    remote_version: write.remote_version,
                    resolution: Some(ResolutionStrategy::LatestWins),
                    observed_at: write.observed_at,
                };
                let committed = version_store::apply_write(conn, &winning)?;
                events.push(commit_event(&committed));
                Ok((WriteOutcome::Applied(committed), events))
            } else {
                Ok((
                    WriteOutcome::Superseded {
                        conflict_id: conflict.id,
                        current: current.clone(),
                    },
                    events,
                ))
            }
        })?;

        for event in events {
            self.events.publish(event);
        }
        Ok(outcome)
    }

    /// Persist the collision and leave the row untouched
    fn park(
        &self,
        write: &ProposedWrite,
        current: &Item,
        status: ConflictStatus,
        strategy: ResolutionStrategy,
        notes: Option<String>,
    ) -> Result<WriteOutcome> {
        let (outcome, events) = self.storage.with_transaction(|conn| {
            if let Some(existing) = conflict_queries::find_by_op(conn, &write.op_id)? {
                return Ok((outcome_for_existing(existing, current), Vec::new()));
            }

            let conflict = build_conflict(conn, write, current, strategy, status, notes.clone())?;
            conflict_queries::insert_conflict(conn, &conflict)?;
            tracing::warn!(
                key = %write.key,
                conflict = %conflict.id,
                status = status.as_str(),
                "write parked as conflict"
            );

            let events = vec![EngineEvent::conflict_detected(&conflict)];
            let outcome = match status {
                ConflictStatus::Escalated => WriteOutcome::Escalated {
                    conflict_id: conflict.id,
                },
                _ => WriteOutcome::Pending {
                    conflict_id: conflict.id,
                },
            };
            Ok((outcome, events))
        })?;

        for event in events {
            self.events.publish(event);
        }
        Ok(outcome)
    }

    fn escalate_exhausted(
        &self,
        write: &ProposedWrite,
        strategy: ResolutionStrategy,
    ) -> Result<WriteOutcome> {
        let current = self.store.try_get(&write.key)?.ok_or_else(|| {
            SyncError::Internal(format!("retries exhausted on absent item {}", write.key))
        })?;
        self.park(
            write,
            &current,
            ConflictStatus::Escalated,
            strategy,
            Some("resolution retries exhausted".to_string()),
        )
    }

    fn notify_commit(&self, committed: &CommittedWrite) {
        if committed.replayed {
            return;
        }
        self.events.publish(commit_event(committed));
    }
}

fn commit_event(committed: &CommittedWrite) -> EngineEvent {
    let changes: Vec<String> = committed
        .record
        .diff
        .as_ref()
        .map(|diff| history::diff_keys(diff).into_iter().collect())
        .unwrap_or_default();
    EngineEvent::item_committed(&committed.item, changes)
}

fn outcome_for_existing(conflict: Conflict, current: &Item) -> WriteOutcome {
    match conflict.status {
        ConflictStatus::Escalated => WriteOutcome::Escalated {
            conflict_id: conflict.id,
        },
        ConflictStatus::Resolved => WriteOutcome::Superseded {
            conflict_id: conflict.id,
            current: current.clone(),
        },
        ConflictStatus::Pending => WriteOutcome::Pending {
            conflict_id: conflict.id,
        },
    }
}

fn build_conflict(
    conn: &Connection,
    write: &ProposedWrite,
    current: &Item,
    strategy: ResolutionStrategy,
    status: ConflictStatus,
    notes: Option<String>,
) -> Result<Conflict> {
    let now = Utc::now();
    let resolved = status == ConflictStatus::Resolved;
    Ok(Conflict {
        id: uuid::Uuid::new_v4().to_string(),
        library_id: write.key.library_id,
        item_id: current.id,
        external_key: write.key.external_key.clone(),
        base_version: write.base_version,
        current_version: current.version,
        incoming_op_id: write.op_id.clone(),
        incoming_payload: write.payload.clone(),
        incoming_deleted: write.deleted,
        incoming_actor: write.actor.clone(),
        incoming_source: write.source,
        current_payload: current.payload.clone(),
        current_actor: last_actor(conn, current.id)?,
        strategy,
        status,
        resolved_by: resolved.then(|| "latest-wins".to_string()),
        resolution_notes: notes,
        detected_at: now,
        resolved_at: resolved.then_some(now),
    })
}

fn last_actor(conn: &Connection, item_id: ItemId) -> Result<Option<String>> {
    Ok(history::history_for_item(conn, item_id, 1, None)?
        .into_iter()
        .next()
        .map(|record| record.actor))
}

fn backoff_ms(attempt: u32) -> u64 {
    let base = 20u64 << attempt.min(5);
    base + rand::thread_rng().gen_range(0..base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::LockManager;
    use crate::storage::library_queries;
    use crate::types::{ItemKind, LibraryId, LibraryKind, LockTarget};
    use serde_json::json;

    struct Fixture {
        storage: Storage,
        store: VersionStore,
        resolver: ConflictResolver,
        library: LibraryId,
    }

    fn fixture(strategy: ResolutionStrategy) -> Fixture {
        let storage = Storage::open_in_memory().unwrap();
        let library = storage
            .with_connection(|conn| {
                let connection = library_queries::create_connection(conn, "user", "acct", None)?;
                library_queries::create_library(
                    conn,
                    connection.id,
                    "remote-1",
                    "Research",
                    LibraryKind::Personal,
                    strategy,
                )
            })
            .unwrap();
        let events = EventBus::new(16);
        let detector = ConflictDetector::new(storage.clone(), events.clone());
        Fixture {
            store: VersionStore::new(storage.clone()),
            resolver: ConflictResolver::new(storage.clone(), detector, events, 3),
            storage,
            library: library.id,
        }
    }

    fn payload(pairs: &[(&str, serde_json::Value)]) -> ItemPayload {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_clean_write_applies() {
        let fx = fixture(ResolutionStrategy::Manual);
        let key = ItemKey::new(fx.library, "ABCD1234");

        let outcome = fx
            .resolver
            .submit(&ProposedWrite::create(
                key.clone(),
                ItemKind::Record,
                payload(&[("title", json!("A"))]),
                "alice",
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(_)));

        // Same content at the current base spends no version
        let outcome = fx
            .resolver
            .submit(&ProposedWrite::update(
                key.clone(),
                1,
                payload(&[("title", json!("A"))]),
                "alice",
            ))
            .await
            .unwrap();
        match outcome {
            WriteOutcome::Unchanged(item) => assert_eq!(item.version, 1),
            other => panic!("expected Unchanged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_manual_strategy_parks_conflict() {
        let fx = fixture(ResolutionStrategy::Manual);
        let key = ItemKey::new(fx.library, "ABCD1234");
        fx.resolver
            .submit(&ProposedWrite::create(
                key.clone(),
                ItemKind::Record,
                payload(&[("title", json!("A"))]),
                "alice",
            ))
            .await
            .unwrap();
        fx.resolver
            .submit(&ProposedWrite::update(
                key.clone(),
                1,
                payload(&[("title", json!("Alice's"))]),
                "alice",
            ))
            .await
            .unwrap();

        let bob = ProposedWrite::update(key.clone(), 1, payload(&[("title", json!("Bob's"))]), "bob");
        let outcome = fx.resolver.submit(&bob).await.unwrap();
        let conflict_id = match outcome {
            WriteOutcome::Pending { conflict_id } => conflict_id,
            other => panic!("expected Pending, got {other:?}"),
        };

        // The row is untouched and both sides are on file
        assert_eq!(fx.store.get(&key).unwrap().payload["title"], "Alice's");
        let conflict = fx
            .storage
            .with_connection(|conn| conflict_queries::get_conflict(conn, &conflict_id))
            .unwrap()
            .unwrap();
        assert_eq!(conflict.incoming_payload["title"], "Bob's");
        assert_eq!(conflict.current_payload["title"], "Alice's");
        assert_eq!(conflict.current_actor.as_deref(), Some("alice"));
        assert_eq!(conflict.status, ConflictStatus::Pending);

        // Redelivering the same operation maps to the same conflict
        let retry = fx.resolver.submit(&bob).await.unwrap();
        match retry {
            WriteOutcome::Pending {
                conflict_id: retry_id,
            } => assert_eq!(retry_id, conflict_id),
            other => panic!("expected Pending, got {other:?}"),
        }
        let open = fx
            .storage
            .with_connection(|conn| conflict_queries::count_open(conn, Some(fx.library)))
            .unwrap();
        assert_eq!(open, 1);
    }

    #[tokio::test]
    async fn test_auto_merge_applies_disjoint() {
        let fx = fixture(ResolutionStrategy::AutoMerge);
        let key = ItemKey::new(fx.library, "ABCD1234");
        fx.resolver
            .submit(&ProposedWrite::create(
                key.clone(),
                ItemKind::Record,
                payload(&[("title", json!("A")), ("year", json!(1999))]),
                "alice",
            ))
            .await
            .unwrap();
        fx.resolver
            .submit(&ProposedWrite::update(
                key.clone(),
                1,
                payload(&[("title", json!("A")), ("year", json!(2001))]),
                "alice",
            ))
            .await
            .unwrap();

        let outcome = fx
            .resolver
            .submit(&ProposedWrite::update(
                key.clone(),
                1,
                payload(&[("title", json!("B")), ("year", json!(1999))]),
                "bob",
            ))
            .await
            .unwrap();

        let committed = match outcome {
            WriteOutcome::Merged(committed) => committed,
            other => panic!("expected Merged, got {other:?}"),
        };
        assert_eq!(committed.item.version, 3);
        assert_eq!(committed.item.payload["title"], json!("B"));
        assert_eq!(committed.item.payload["year"], json!(2001));
        assert_eq!(committed.record.conflict_resolution.as_deref(), Some("auto_merge"));
        assert!(committed.record.is_conflict);
        // The merged state is local until pushed
        assert!(!committed.item.synced);
    }

    #[tokio::test]
    async fn test_auto_merge_escalates_overlap() {
        let fx = fixture(ResolutionStrategy::AutoMerge);
        let key = ItemKey::new(fx.library, "ABCD1234");
        fx.resolver
            .submit(&ProposedWrite::create(
                key.clone(),
                ItemKind::Record,
                payload(&[("title", json!("A"))]),
                "alice",
            ))
            .await
            .unwrap();
        fx.resolver
            .submit(&ProposedWrite::update(
                key.clone(),
                1,
                payload(&[("title", json!("Alice's"))]),
                "alice",
            ))
            .await
            .unwrap();

        let outcome = fx
            .resolver
            .submit(&ProposedWrite::update(
                key.clone(),
                1,
                payload(&[("title", json!("Bob's"))]),
                "bob",
            ))
            .await
            .unwrap();

        let conflict_id = match outcome {
            WriteOutcome::Escalated { conflict_id } => conflict_id,
            other => panic!("expected Escalated, got {other:?}"),
        };
        let conflict = fx
            .storage
            .with_connection(|conn| conflict_queries::get_conflict(conn, &conflict_id))
            .unwrap()
            .unwrap();
        assert_eq!(conflict.status, ConflictStatus::Escalated);
        assert!(conflict
            .resolution_notes
            .as_deref()
            .unwrap()
            .contains("overlapping_fields"));
    }

    #[tokio::test]
    async fn test_latest_wins_incoming_newer() {
        let fx = fixture(ResolutionStrategy::LatestWins);
        let key = ItemKey::new(fx.library, "ABCD1234");
        fx.resolver
            .submit(&ProposedWrite::create(
                key.clone(),
                ItemKind::Record,
                payload(&[("title", json!("A"))]),
                "alice",
            ))
            .await
            .unwrap();
        fx.resolver
            .submit(&ProposedWrite::update(
                key.clone(),
                1,
                payload(&[("title", json!("Alice's"))]),
                "alice",
            ))
            .await
            .unwrap();

        let mut bob =
            ProposedWrite::update(key.clone(), 1, payload(&[("title", json!("Bob's"))]), "bob");
        bob.observed_at = Utc::now() + chrono::Duration::seconds(30);

        let outcome = fx.resolver.submit(&bob).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(_)));
        let item = fx.store.get(&key).unwrap();
        assert_eq!(item.payload["title"], json!("Bob's"));
        assert_eq!(item.version, 3);

        // Loser retained for audit, already resolved
        let conflicts = fx
            .storage
            .with_connection(|conn| {
                conflict_queries::list_conflicts(conn, Some(fx.library), None, 10)
            })
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].status, ConflictStatus::Resolved);
        assert_eq!(conflicts[0].current_payload["title"], json!("Alice's"));
    }

    #[tokio::test]
    async fn test_latest_wins_current_newer() {
        let fx = fixture(ResolutionStrategy::LatestWins);
        let key = ItemKey::new(fx.library, "ABCD1234");
        fx.resolver
            .submit(&ProposedWrite::create(
                key.clone(),
                ItemKind::Record,
                payload(&[("title", json!("A"))]),
                "alice",
            ))
            .await
            .unwrap();
        fx.resolver
            .submit(&ProposedWrite::update(
                key.clone(),
                1,
                payload(&[("title", json!("Alice's"))]),
                "alice",
            ))
            .await
            .unwrap();

        let mut bob =
            ProposedWrite::update(key.clone(), 1, payload(&[("title", json!("Bob's"))]), "bob");
        bob.observed_at = Utc::now() - chrono::Duration::minutes(5);

        let outcome = fx.resolver.submit(&bob).await.unwrap();
        match outcome {
            WriteOutcome::Superseded { current, .. } => {
                assert_eq!(current.payload["title"], json!("Alice's"));
            }
            other => panic!("expected Superseded, got {other:?}"),
        }
        assert_eq!(fx.store.get(&key).unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_lock_denied_surfaces_to_caller() {
        let fx = fixture(ResolutionStrategy::Manual);
        let key = ItemKey::new(fx.library, "ABCD1234");
        let item = fx
            .store
            .compare_and_swap(&ProposedWrite::create(
                key.clone(),
                ItemKind::Record,
                payload(&[("title", json!("A"))]),
                "bob",
            ))
            .unwrap()
            .item;

        let locks = LockManager::new(fx.storage.clone(), 300);
        locks
            .acquire_hard(LockTarget::item(item.id), "bob", None)
            .unwrap();

        let err = fx
            .resolver
            .submit(&ProposedWrite::update(
                key,
                1,
                payload(&[("title", json!("B"))]),
                "alice",
            ))
            .await
            .unwrap_err();
        match err {
            SyncError::LockDenied { holder, .. } => assert_eq!(holder, "bob"),
            other => panic!("expected LockDenied, got {other:?}"),
        }

        // No conflict row for a lock denial; the caller got an error instead
        let open = fx
            .storage
            .with_connection(|conn| conflict_queries::count_open(conn, Some(fx.library)))
            .unwrap();
        assert_eq!(open, 0);
    }

    #[tokio::test]
    async fn test_resolve_pending_applies_choice() {
        let fx = fixture(ResolutionStrategy::Manual);
        let key = ItemKey::new(fx.library, "ABCD1234");
        fx.resolver
            .submit(&ProposedWrite::create(
                key.clone(),
                ItemKind::Record,
                payload(&[("title", json!("A"))]),
                "alice",
            ))
            .await
            .unwrap();
        fx.resolver
            .submit(&ProposedWrite::update(
                key.clone(),
                1,
                payload(&[("title", json!("Alice's"))]),
                "alice",
            ))
            .await
            .unwrap();

        let outcome = fx
            .resolver
            .submit(&ProposedWrite::update(
                key.clone(),
                1,
                payload(&[("title", json!("Bob's"))]),
                "bob",
            ))
            .await
            .unwrap();
        let conflict_id = match outcome {
            WriteOutcome::Pending { conflict_id } => conflict_id,
            other => panic!("expected Pending, got {other:?}"),
        };

        let outcome = fx
            .resolver
            .resolve_pending(
                &conflict_id,
                payload(&[("title", json!("Merged by hand"))]),
                false,
                "carol",
                Some("took parts of both".to_string()),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(_)));

        let item = fx.store.get(&key).unwrap();
        assert_eq!(item.payload["title"], json!("Merged by hand"));
        assert_eq!(item.version, 3);

        let conflict = fx
            .storage
            .with_connection(|conn| conflict_queries::get_conflict(conn, &conflict_id))
            .unwrap()
            .unwrap();
        assert_eq!(conflict.status, ConflictStatus::Resolved);
        assert_eq!(conflict.resolved_by.as_deref(), Some("carol"));

        // A second resolution of the same conflict is rejected
        let err = fx
            .resolver
            .resolve_pending(&conflict_id, ItemPayload::new(), false, "dave", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }
}
