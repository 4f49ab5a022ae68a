//! Append-only modification log
//!
//! One row per accepted mutation, written inside the same transaction as
//! the compare-and-swap that produced it. Rows are never updated or
//! deleted; `op_id` is the idempotency key for retried writes.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;

use crate::error::Result;
use crate::types::{
    ItemId, ItemPayload, LibraryId, ModificationRecord, WriteOperation, WriteSource,
};

/// Parse a modification record from a database row
pub fn record_from_row(row: &Row) -> rusqlite::Result<ModificationRecord> {
    let operation_str: String = row.get("operation")?;
    let source_str: String = row.get("source")?;
    let diff_str: Option<String> = row.get("diff")?;
    let created_at_str: String = row.get("created_at")?;
    let is_conflict: i64 = row.get("is_conflict")?;

    Ok(ModificationRecord {
        id: row.get("id")?,
        op_id: row.get("op_id")?,
        item_id: row.get("item_id")?,
        library_id: row.get("library_id")?,
        external_key: row.get("external_key")?,
        actor: row.get("actor")?,
        operation: operation_str.parse().unwrap_or(WriteOperation::Update),
        source: source_str.parse().unwrap_or(WriteSource::Local),
        diff: diff_str.and_then(|s| serde_json::from_str(&s).ok()),
        resulting_version: row.get("resulting_version")?,
        is_conflict: is_conflict != 0,
        conflict_resolution: row.get("conflict_resolution")?,
        created_at: DateTime::parse_from_rfc3339(&created_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Fields of a record about to be appended
pub struct NewRecord<'a> {
    pub op_id: &'a str,
    pub item_id: ItemId,
    pub library_id: LibraryId,
    pub external_key: &'a str,
    pub actor: &'a str,
    pub operation: WriteOperation,
    pub source: WriteSource,
    pub diff: Option<&'a serde_json::Value>,
    pub resulting_version: i64,
    pub is_conflict: bool,
    pub conflict_resolution: Option<&'a str>,
}

/// Append one record; called from inside the CAS transaction
pub fn append_record(conn: &Connection, rec: &NewRecord) -> Result<ModificationRecord> {
    let now = Utc::now();
    let diff_str = rec.diff.map(|d| d.to_string());

    conn.execute(
        "INSERT INTO modification_log
            (op_id, item_id, library_id, external_key, actor, operation, source,
             diff, resulting_version, is_conflict, conflict_resolution, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            rec.op_id,
            rec.item_id,
            rec.library_id,
            rec.external_key,
            rec.actor,
            rec.operation.as_str(),
            rec.source.as_str(),
            diff_str,
            rec.resulting_version,
            rec.is_conflict,
            rec.conflict_resolution,
            now.to_rfc3339(),
        ],
    )?;

    Ok(ModificationRecord {
        id: conn.last_insert_rowid(),
        op_id: rec.op_id.to_string(),
        item_id: rec.item_id,
        library_id: rec.library_id,
        external_key: rec.external_key.to_string(),
        actor: rec.actor.to_string(),
        operation: rec.operation,
        source: rec.source,
        diff: rec.diff.cloned(),
        resulting_version: rec.resulting_version,
        is_conflict: rec.is_conflict,
        conflict_resolution: rec.conflict_resolution.map(|s| s.to_string()),
        created_at: now,
    })
}

/// Look up the record a given op_id already committed, if any
pub fn record_for_op(conn: &Connection, op_id: &str) -> Result<Option<ModificationRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, op_id, item_id, library_id, external_key, actor, operation, source,
                diff, resulting_version, is_conflict, conflict_resolution, created_at
         FROM modification_log WHERE op_id = ?",
    )?;

    Ok(stmt.query_row(params![op_id], record_from_row).optional()?)
}

/// Calculate a field-level diff between two payload states
///
/// Shape: {"field": {"old": ..., "new": ...}} with null standing in for
/// absent fields.
pub fn field_diff(old: Option<&ItemPayload>, new: &ItemPayload) -> serde_json::Value {
    let mut diff = serde_json::Map::new();
    let empty = ItemPayload::new();
    let old = old.unwrap_or(&empty);

    // Changed or added fields
    for (key, new_val) in new {
        match old.get(key) {
            Some(old_val) if old_val != new_val => {
                diff.insert(
                    key.clone(),
                    serde_json::json!({
                        "old": old_val,
                        "new": new_val,
                    }),
                );
            }
            None => {
                diff.insert(
                    key.clone(),
                    serde_json::json!({
                        "old": null,
                        "new": new_val,
                    }),
                );
            }
            _ => {}
        }
    }

    // Removed fields
    for (key, old_val) in old {
        if !new.contains_key(key) {
            diff.insert(
                key.clone(),
                serde_json::json!({
                    "old": old_val,
                    "new": null,
                }),
            );
        }
    }

    serde_json::Value::Object(diff)
}

/// Field names touched by a diff
pub fn diff_keys(diff: &serde_json::Value) -> BTreeSet<String> {
    diff.as_object()
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default()
}

/// History for one item, newest first
///
/// `before_version` restarts pagination below a previously seen version.
pub fn history_for_item(
    conn: &Connection,
    item_id: ItemId,
    limit: i64,
    before_version: Option<i64>,
) -> Result<Vec<ModificationRecord>> {
    let before = before_version.unwrap_or(i64::MAX);

    let mut stmt = conn.prepare_cached(
        "SELECT id, op_id, item_id, library_id, external_key, actor, operation, source,
                diff, resulting_version, is_conflict, conflict_resolution, created_at
         FROM modification_log
         WHERE item_id = ? AND resulting_version < ?
         ORDER BY resulting_version DESC
         LIMIT ?",
    )?;

    let records: Vec<ModificationRecord> = stmt
        .query_map(params![item_id, before, limit], record_from_row)?
        .filter_map(|r| r.ok())
        .collect();

    Ok(records)
}

/// Records strictly after `base_version` up to and including `current_version`
pub fn records_between(
    conn: &Connection,
    item_id: ItemId,
    base_version: i64,
    current_version: i64,
) -> Result<Vec<ModificationRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, op_id, item_id, library_id, external_key, actor, operation, source,
                diff, resulting_version, is_conflict, conflict_resolution, created_at
         FROM modification_log
         WHERE item_id = ? AND resulting_version > ? AND resulting_version <= ?
         ORDER BY resulting_version ASC",
    )?;

    let records: Vec<ModificationRecord> = stmt
        .query_map(
            params![item_id, base_version, current_version],
            record_from_row,
        )?
        .filter_map(|r| r.ok())
        .collect();

    Ok(records)
}

/// Union of field names changed between two versions of an item
pub fn changed_fields_between(
    conn: &Connection,
    item_id: ItemId,
    base_version: i64,
    current_version: i64,
) -> Result<BTreeSet<String>> {
    let mut fields = BTreeSet::new();
    for record in records_between(conn, item_id, base_version, current_version)? {
        if let Some(ref diff) = record.diff {
            fields.extend(diff_keys(diff));
        }
    }
    Ok(fields)
}

/// Filter for querying the modification log across items
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub library_id: Option<LibraryId>,
    pub item_id: Option<ItemId>,
    pub actor: Option<String>,
    pub source: Option<WriteSource>,
    pub conflicts_only: bool,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Query modification records with a dynamic filter
pub fn query_modifications(
    conn: &Connection,
    filter: &HistoryFilter,
) -> Result<Vec<ModificationRecord>> {
    let mut sql = String::from(
        "SELECT id, op_id, item_id, library_id, external_key, actor, operation, source,
                diff, resulting_version, is_conflict, conflict_resolution, created_at
         FROM modification_log WHERE 1=1",
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(library_id) = filter.library_id {
        sql.push_str(" AND library_id = ?");
        params_vec.push(Box::new(library_id));
    }

    if let Some(item_id) = filter.item_id {
        sql.push_str(" AND item_id = ?");
        params_vec.push(Box::new(item_id));
    }

    if let Some(ref actor) = filter.actor {
        sql.push_str(" AND actor = ?");
        params_vec.push(Box::new(actor.clone()));
    }

    if let Some(source) = filter.source {
        sql.push_str(" AND source = ?");
        params_vec.push(Box::new(source.as_str().to_string()));
    }

    if filter.conflicts_only {
        sql.push_str(" AND is_conflict = 1");
    }

    if let Some(ref since) = filter.since {
        sql.push_str(" AND created_at >= ?");
        params_vec.push(Box::new(since.to_rfc3339()));
    }

    if let Some(ref until) = filter.until {
        sql.push_str(" AND created_at <= ?");
        params_vec.push(Box::new(until.to_rfc3339()));
    }

    sql.push_str(" ORDER BY created_at DESC, id DESC");

    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;

    let records: Vec<ModificationRecord> = stmt
        .query_map(params_ref.as_slice(), record_from_row)?
        .filter_map(|r| r.ok())
        .collect();

    Ok(records)
}
