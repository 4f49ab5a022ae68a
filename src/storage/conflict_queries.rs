//! Conflict record persistence
//!
//! A conflict row captures both sides of a detected write race. Rows are
//! never deleted; resolution flips the status.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::types::{
    Conflict, ConflictStatus, ItemId, ItemPayload, LibraryId, ResolutionStrategy, WriteSource,
};

/// Parse a conflict from a database row
pub fn conflict_from_row(row: &Row) -> rusqlite::Result<Conflict> {
    let incoming_payload_str: String = row.get("incoming_payload")?;
    let current_payload_str: String = row.get("current_payload")?;
    let incoming_deleted: i64 = row.get("incoming_deleted")?;
    let incoming_source_str: String = row.get("incoming_source")?;
    let strategy_str: String = row.get("strategy")?;
    let status_str: String = row.get("status")?;
    let detected_at: String = row.get("detected_at")?;
    let resolved_at: Option<String> = row.get("resolved_at")?;

    let incoming_payload: ItemPayload =
        serde_json::from_str(&incoming_payload_str).unwrap_or_default();
    let current_payload: ItemPayload =
        serde_json::from_str(&current_payload_str).unwrap_or_default();

    Ok(Conflict {
        id: row.get("id")?,
        library_id: row.get("library_id")?,
        item_id: row.get("item_id")?,
        external_key: row.get("external_key")?,
        base_version: row.get("base_version")?,
        current_version: row.get("current_version")?,
        incoming_op_id: row.get("incoming_op_id")?,
        incoming_payload,
        incoming_deleted: incoming_deleted != 0,
        incoming_actor: row.get("incoming_actor")?,
        incoming_source: incoming_source_str.parse().unwrap_or(WriteSource::Local),
        current_payload,
        current_actor: row.get("current_actor")?,
        strategy: strategy_str.parse().unwrap_or(ResolutionStrategy::Manual),
        status: status_str.parse().unwrap_or(ConflictStatus::Pending),
        resolved_by: row.get("resolved_by")?,
        resolution_notes: row.get("resolution_notes")?,
        detected_at: DateTime::parse_from_rfc3339(&detected_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        resolved_at: resolved_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }),
    })
}

pub fn insert_conflict(conn: &Connection, conflict: &Conflict) -> Result<()> {
    conn.execute(
        "INSERT INTO conflicts
            (id, library_id, item_id, external_key, base_version, current_version,
             incoming_op_id, incoming_payload, incoming_deleted, incoming_actor,
             incoming_source, current_payload, current_actor, strategy, status,
             resolved_by, resolution_notes, detected_at, resolved_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            conflict.id,
            conflict.library_id,
            conflict.item_id,
            conflict.external_key,
            conflict.base_version,
            conflict.current_version,
            conflict.incoming_op_id,
            serde_json::to_string(&conflict.incoming_payload)?,
            conflict.incoming_deleted,
            conflict.incoming_actor,
            conflict.incoming_source.as_str(),
            serde_json::to_string(&conflict.current_payload)?,
            conflict.current_actor,
            conflict.strategy.as_str(),
            conflict.status.as_str(),
            conflict.resolved_by,
            conflict.resolution_notes,
            conflict.detected_at.to_rfc3339(),
            conflict.resolved_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn get_conflict(conn: &Connection, id: &str) -> Result<Option<Conflict>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, library_id, item_id, external_key, base_version, current_version,
                incoming_op_id, incoming_payload, incoming_deleted, incoming_actor, incoming_source,
                current_payload, current_actor, strategy, status, resolved_by,
                resolution_notes, detected_at, resolved_at
         FROM conflicts WHERE id = ?",
    )?;

    Ok(stmt.query_row(params![id], conflict_from_row).optional()?)
}

/// Conflict already recorded for an operation, if any
pub fn find_by_op(conn: &Connection, op_id: &str) -> Result<Option<Conflict>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, library_id, item_id, external_key, base_version, current_version,
                incoming_op_id, incoming_payload, incoming_deleted, incoming_actor, incoming_source,
                current_payload, current_actor, strategy, status, resolved_by,
                resolution_notes, detected_at, resolved_at
         FROM conflicts WHERE incoming_op_id = ?",
    )?;

    Ok(stmt
        .query_row(params![op_id], conflict_from_row)
        .optional()?)
}

/// List conflicts, newest first, with optional library and status filters
pub fn list_conflicts(
    conn: &Connection,
    library_id: Option<LibraryId>,
    status: Option<ConflictStatus>,
    limit: i64,
) -> Result<Vec<Conflict>> {
    let mut sql = String::from(
        "SELECT id, library_id, item_id, external_key, base_version, current_version,
                incoming_op_id, incoming_payload, incoming_deleted, incoming_actor, incoming_source,
                current_payload, current_actor, strategy, status, resolved_by,
                resolution_notes, detected_at, resolved_at
         FROM conflicts WHERE 1=1",
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(library_id) = library_id {
        sql.push_str(" AND library_id = ?");
        params_vec.push(Box::new(library_id));
    }

    if let Some(status) = status {
        sql.push_str(" AND status = ?");
        params_vec.push(Box::new(status.as_str().to_string()));
    }

    sql.push_str(" ORDER BY detected_at DESC LIMIT ?");
    params_vec.push(Box::new(limit));

    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;

    let conflicts: Vec<Conflict> = stmt
        .query_map(params_ref.as_slice(), conflict_from_row)?
        .filter_map(|r| r.ok())
        .collect();

    Ok(conflicts)
}

/// Conflicts awaiting action (pending or escalated), newest first
pub fn open_conflicts(
    conn: &Connection,
    library_id: Option<LibraryId>,
    limit: i64,
) -> Result<Vec<Conflict>> {
    let mut sql = String::from(
        "SELECT id, library_id, item_id, external_key, base_version, current_version,
                incoming_op_id, incoming_payload, incoming_deleted, incoming_actor, incoming_source,
                current_payload, current_actor, strategy, status, resolved_by,
                resolution_notes, detected_at, resolved_at
         FROM conflicts WHERE status != 'resolved'",
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(library_id) = library_id {
        sql.push_str(" AND library_id = ?");
        params_vec.push(Box::new(library_id));
    }

    sql.push_str(" ORDER BY detected_at DESC LIMIT ?");
    params_vec.push(Box::new(limit));

    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;

    let conflicts: Vec<Conflict> = stmt
        .query_map(params_ref.as_slice(), conflict_from_row)?
        .filter_map(|r| r.ok())
        .collect();

    Ok(conflicts)
}

/// Conflicts still awaiting action for one item
pub fn open_conflicts_for_item(conn: &Connection, item_id: ItemId) -> Result<Vec<Conflict>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, library_id, item_id, external_key, base_version, current_version,
                incoming_op_id, incoming_payload, incoming_deleted, incoming_actor, incoming_source,
                current_payload, current_actor, strategy, status, resolved_by,
                resolution_notes, detected_at, resolved_at
         FROM conflicts WHERE item_id = ? AND status != 'resolved'
         ORDER BY detected_at DESC",
    )?;

    let conflicts: Vec<Conflict> = stmt
        .query_map(params![item_id], conflict_from_row)?
        .filter_map(|r| r.ok())
        .collect();

    Ok(conflicts)
}

/// Flip a conflict to resolved; false when it was already resolved or missing
pub fn mark_resolved(
    conn: &Connection,
    id: &str,
    resolved_by: &str,
    notes: Option<&str>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE conflicts
         SET status = 'resolved', resolved_by = ?, resolution_notes = ?, resolved_at = ?
         WHERE id = ? AND status != 'resolved'",
        params![resolved_by, notes, Utc::now().to_rfc3339(), id],
    )?;
    Ok(changed == 1)
}

/// Park a conflict for manual action after automatic resolution gave up
pub fn mark_escalated(conn: &Connection, id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE conflicts SET status = 'escalated' WHERE id = ? AND status = 'pending'",
        params![id],
    )?;
    Ok(changed == 1)
}

/// External keys with an unresolved conflict in a library
///
/// The push phase holds these items back until a resolution lands.
pub fn open_conflict_keys(
    conn: &Connection,
    library_id: LibraryId,
) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT external_key FROM conflicts
         WHERE library_id = ? AND status != 'resolved'",
    )?;

    let keys: HashSet<String> = stmt
        .query_map(params![library_id], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(keys)
}

pub fn count_open(conn: &Connection, library_id: Option<LibraryId>) -> Result<i64> {
    let count: i64 = match library_id {
        Some(library_id) => conn.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE library_id = ? AND status != 'resolved'",
            params![library_id],
            |row| row.get(0),
        )?,
        None => conn.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE status != 'resolved'",
            [],
            |row| row.get(0),
        )?,
    };
    Ok(count)
}
