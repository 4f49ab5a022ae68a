//! Versioned item store with per-key compare-and-swap
//!
//! Every mutation runs in one transaction: idempotency probe, version
//! check, row write, modification append. Versions are strictly monotonic
//! per item with no gaps; the store is the only writer of `version`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::connection::Storage;
use super::history::{self, NewRecord};
use crate::error::{Result, SyncError};
use crate::types::{
    CommittedWrite, Item, ItemId, ItemKey, ItemKind, ItemPayload, LibraryId, ProposedWrite,
    WriteOperation, WriteSource,
};

/// Parse an item from a database row
pub fn item_from_row(row: &Row) -> rusqlite::Result<Item> {
    let kind_str: String = row.get("item_type")?;
    let payload_str: String = row.get("payload")?;
    let deleted: i64 = row.get("deleted")?;
    let synced: i64 = row.get("synced")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    let payload: ItemPayload = serde_json::from_str(&payload_str).unwrap_or_default();

    Ok(Item {
        id: row.get("id")?,
        library_id: row.get("library_id")?,
        external_key: row.get("external_key")?,
        kind: kind_str.parse().unwrap_or(ItemKind::Record),
        version: row.get("version")?,
        payload,
        deleted: deleted != 0,
        synced: synced != 0,
        last_synced_version: row.get("last_synced_version")?,
        remote_version: row.get("remote_version")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

pub(crate) fn get_by_key(conn: &Connection, key: &ItemKey) -> Result<Option<Item>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, library_id, external_key, item_type, version, payload,
                deleted, synced, last_synced_version, remote_version, created_at, updated_at
         FROM items WHERE library_id = ? AND external_key = ?",
    )?;

    Ok(stmt
        .query_row(params![key.library_id, key.external_key], item_from_row)
        .optional()?)
}

pub(crate) fn get_by_id(conn: &Connection, id: ItemId) -> Result<Option<Item>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, library_id, external_key, item_type, version, payload,
                deleted, synced, last_synced_version, remote_version, created_at, updated_at
         FROM items WHERE id = ?",
    )?;

    Ok(stmt.query_row(params![id], item_from_row).optional()?)
}

/// Apply a proposed write; must run inside a transaction
///
/// Version mismatch returns `StaleVersion` and the caller's transaction
/// rolls back. A retried op_id replays the original outcome without
/// touching the row again.
pub(crate) fn apply_write(conn: &Connection, write: &ProposedWrite) -> Result<CommittedWrite> {
    if let Some(record) = history::record_for_op(conn, &write.op_id)? {
        let item = get_by_id(conn, record.item_id)?.ok_or_else(|| {
            SyncError::Internal(format!(
                "modification log references missing item {}",
                record.item_id
            ))
        })?;
        tracing::debug!(op_id = %write.op_id, item = %item.external_key, "replayed committed op");
        return Ok(CommittedWrite {
            item,
            record,
            replayed: true,
        });
    }

    let existing = get_by_key(conn, &write.key)?;
    let now = Utc::now();
    let now_str = now.to_rfc3339();
    let payload_str = serde_json::to_string(&write.payload)?;
    let is_remote = write.source == WriteSource::Remote;
    let synced = is_remote;

    let (item, diff_val, operation, resulting_version) = match existing {
        None => {
            if write.base_version != 0 {
                return Err(SyncError::StaleVersion {
                    expected: write.base_version,
                    found: 0,
                });
            }

            // A delete with no prior row still creates the tombstone so the
            // key's history has somewhere to live
            let operation = if write.deleted {
                WriteOperation::Delete
            } else {
                WriteOperation::Create
            };

            let last_synced = if is_remote { 1 } else { 0 };
            conn.execute(
                "INSERT INTO items
                    (library_id, external_key, item_type, version, payload,
                     deleted, synced, last_synced_version, remote_version,
                     created_at, updated_at)
                 VALUES (?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    write.key.library_id,
                    write.key.external_key,
                    write.kind.as_str(),
                    payload_str,
                    write.deleted,
                    synced,
                    last_synced,
                    write.remote_version,
                    now_str,
                    now_str,
                ],
            )?;
            let item_id = conn.last_insert_rowid();

            let item = Item {
                id: item_id,
                library_id: write.key.library_id,
                external_key: write.key.external_key.clone(),
                kind: write.kind,
                version: 1,
                payload: write.payload.clone(),
                deleted: write.deleted,
                synced,
                last_synced_version: last_synced,
                remote_version: write.remote_version,
                created_at: now,
                updated_at: now,
            };
            let diff = history::field_diff(None, &write.payload);
            (item, diff, operation, 1)
        }
        Some(current) => {
            if write.base_version != current.version {
                return Err(SyncError::StaleVersion {
                    expected: write.base_version,
                    found: current.version,
                });
            }

            let operation = if write.deleted && !current.deleted {
                WriteOperation::Delete
            } else {
                write.operation
            };
            let new_version = current.version + 1;
            // A committed remote write means both sides now hold this exact
            // state; local writes leave the agreement point where it was
            let last_synced = if is_remote {
                new_version
            } else {
                current.last_synced_version
            };

            conn.execute(
                "UPDATE items
                 SET version = ?, payload = ?, deleted = ?, synced = ?,
                     last_synced_version = ?,
                     remote_version = COALESCE(?, remote_version), updated_at = ?
                 WHERE id = ?",
                params![
                    new_version,
                    payload_str,
                    write.deleted,
                    synced,
                    last_synced,
                    write.remote_version,
                    now_str,
                    current.id,
                ],
            )?;

            let diff = history::field_diff(Some(&current.payload), &write.payload);
            let item = Item {
                version: new_version,
                payload: write.payload.clone(),
                deleted: write.deleted,
                synced,
                last_synced_version: last_synced,
                remote_version: write.remote_version.or(current.remote_version),
                updated_at: now,
                ..current
            };
            (item, diff, operation, new_version)
        }
    };

    let record = history::append_record(
        conn,
        &NewRecord {
            op_id: &write.op_id,
            item_id: item.id,
            library_id: write.key.library_id,
            external_key: &write.key.external_key,
            actor: &write.actor,
            operation,
            source: write.source,
            diff: Some(&diff_val),
            resulting_version,
            is_conflict: write.resolution.is_some(),
            conflict_resolution: write.resolution.map(|r| r.as_str()),
        },
    )?;

    tracing::debug!(
        item = %write.key,
        version = resulting_version,
        operation = operation.as_str(),
        source = write.source.as_str(),
        "write committed"
    );

    Ok(CommittedWrite {
        item,
        record,
        replayed: false,
    })
}

/// Keyed optimistic store over the shared storage handle
#[derive(Clone)]
pub struct VersionStore {
    storage: Storage,
}

impl VersionStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Fetch an item, erroring when absent
    pub fn get(&self, key: &ItemKey) -> Result<Item> {
        self.try_get(key)?
            .ok_or_else(|| SyncError::NotFound(format!("item {}", key)))
    }

    /// Fetch an item if present
    pub fn try_get(&self, key: &ItemKey) -> Result<Option<Item>> {
        self.storage.with_connection(|conn| get_by_key(conn, key))
    }

    pub fn get_by_id(&self, id: ItemId) -> Result<Option<Item>> {
        self.storage.with_connection(|conn| get_by_id(conn, id))
    }

    /// Commit a write if and only if the item is still at `base_version`
    pub fn compare_and_swap(&self, write: &ProposedWrite) -> Result<CommittedWrite> {
        self.storage
            .with_transaction(|conn| apply_write(conn, write))
    }

    /// Record that the remote accepted a pushed change
    ///
    /// Sync metadata only; `version` does not move. Returns false when a
    /// newer local edit landed after the push was read, in which case the
    /// item stays pending.
    pub fn mark_pushed(&self, key: &ItemKey, pushed_version: i64, remote_version: i64) -> Result<bool> {
        self.storage.with_connection(|conn| {
            let changed = conn.execute(
                "UPDATE items SET synced = 1, last_synced_version = version, remote_version = ?
                 WHERE library_id = ? AND external_key = ? AND version = ?",
                params![
                    remote_version,
                    key.library_id,
                    key.external_key,
                    pushed_version
                ],
            )?;
            Ok(changed == 1)
        })
    }

    /// Local changes not yet accepted by the remote, oldest first
    pub fn pending_local_changes(&self, library_id: LibraryId) -> Result<Vec<Item>> {
        self.storage.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, library_id, external_key, item_type, version, payload,
                        deleted, synced, last_synced_version, remote_version,
                        created_at, updated_at
                 FROM items WHERE library_id = ? AND synced = 0
                 ORDER BY updated_at ASC, id ASC",
            )?;

            let items: Vec<Item> = stmt
                .query_map(params![library_id], item_from_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(items)
        })
    }

    pub fn count_pending(&self, library_id: LibraryId) -> Result<i64> {
        self.storage.with_connection(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM items WHERE library_id = ? AND synced = 0",
                params![library_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// All items in a library, tombstones excluded unless asked for
    pub fn list_items(&self, library_id: LibraryId, include_deleted: bool) -> Result<Vec<Item>> {
        self.storage.with_connection(|conn| {
            let sql = if include_deleted {
                "SELECT id, library_id, external_key, item_type, version, payload,
                        deleted, synced, last_synced_version, remote_version,
                        created_at, updated_at
                 FROM items WHERE library_id = ? ORDER BY external_key"
            } else {
                "SELECT id, library_id, external_key, item_type, version, payload,
                        deleted, synced, last_synced_version, remote_version,
                        created_at, updated_at
                 FROM items WHERE library_id = ? AND deleted = 0 ORDER BY external_key"
            };
            let mut stmt = conn.prepare_cached(sql)?;

            let items: Vec<Item> = stmt
                .query_map(params![library_id], item_from_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(items)
        })
    }
}
