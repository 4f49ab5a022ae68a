//! Registry queries: connections, libraries, sync cursors, pass audit

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, SyncError};
use crate::types::{
    ConnectionId, Library, LibraryId, LibraryKind, PassState, PassSummary, RemoteConnection,
    ResolutionStrategy,
};

/// Parse a connection from a database row
pub fn connection_from_row(row: &Row) -> rusqlite::Result<RemoteConnection> {
    let active: i64 = row.get("active")?;
    let created_at: String = row.get("created_at")?;

    Ok(RemoteConnection {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        account_id: row.get("account_id")?,
        label: row.get("label")?,
        active: active != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Parse a library from a database row
pub fn library_from_row(row: &Row) -> rusqlite::Result<Library> {
    let kind_str: String = row.get("kind")?;
    let strategy_str: String = row.get("strategy")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Library {
        id: row.get("id")?,
        connection_id: row.get("connection_id")?,
        remote_id: row.get("remote_id")?,
        name: row.get("name")?,
        kind: kind_str.parse().unwrap_or(LibraryKind::Personal),
        remote_version: row.get("remote_version")?,
        sync_cursor: row.get("sync_cursor")?,
        strategy: strategy_str.parse().unwrap_or(ResolutionStrategy::Manual),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Register a connection; idempotent on an already-active (user, account) pair
pub fn create_connection(
    conn: &Connection,
    user_id: &str,
    account_id: &str,
    label: Option<&str>,
) -> Result<RemoteConnection> {
    if let Some(existing) = find_active_connection(conn, user_id, account_id)? {
        return Ok(existing);
    }

    let now = Utc::now();
    conn.execute(
        "INSERT INTO connections (user_id, account_id, label, active, created_at)
         VALUES (?, ?, ?, 1, ?)",
        params![user_id, account_id, label, now.to_rfc3339()],
    )?;

    Ok(RemoteConnection {
        id: conn.last_insert_rowid(),
        user_id: user_id.to_string(),
        account_id: account_id.to_string(),
        label: label.map(|s| s.to_string()),
        active: true,
        created_at: now,
    })
}

pub fn find_active_connection(
    conn: &Connection,
    user_id: &str,
    account_id: &str,
) -> Result<Option<RemoteConnection>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, user_id, account_id, label, active, created_at
         FROM connections WHERE user_id = ? AND account_id = ? AND active = 1",
    )?;

    Ok(stmt
        .query_row(params![user_id, account_id], connection_from_row)
        .optional()?)
}

pub fn get_connection(conn: &Connection, id: ConnectionId) -> Result<Option<RemoteConnection>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, user_id, account_id, label, active, created_at
         FROM connections WHERE id = ?",
    )?;

    Ok(stmt.query_row(params![id], connection_from_row).optional()?)
}

pub fn list_connections(conn: &Connection, user_id: Option<&str>) -> Result<Vec<RemoteConnection>> {
    let mut sql = String::from(
        "SELECT id, user_id, account_id, label, active, created_at
         FROM connections WHERE active = 1",
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(user_id) = user_id {
        sql.push_str(" AND user_id = ?");
        params_vec.push(Box::new(user_id.to_string()));
    }
    sql.push_str(" ORDER BY created_at");

    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;

    let connections: Vec<RemoteConnection> = stmt
        .query_map(params_ref.as_slice(), connection_from_row)?
        .filter_map(|r| r.ok())
        .collect();

    Ok(connections)
}

/// Deactivate a connection; its libraries stop syncing but keep their data
pub fn deactivate_connection(conn: &Connection, id: ConnectionId) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE connections SET active = 0 WHERE id = ? AND active = 1",
        params![id],
    )?;
    Ok(changed == 1)
}

/// Register a library under a connection; idempotent on (connection, remote_id)
pub fn create_library(
    conn: &Connection,
    connection_id: ConnectionId,
    remote_id: &str,
    name: &str,
    kind: LibraryKind,
    strategy: ResolutionStrategy,
) -> Result<Library> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, connection_id, remote_id, name, kind, remote_version,
                sync_cursor, strategy, created_at, updated_at
         FROM libraries WHERE connection_id = ? AND remote_id = ?",
    )?;
    if let Some(existing) = stmt
        .query_row(params![connection_id, remote_id], library_from_row)
        .optional()?
    {
        return Ok(existing);
    }

    if get_connection(conn, connection_id)?.is_none() {
        return Err(SyncError::NotFound(format!("connection {}", connection_id)));
    }

    let now = Utc::now();
    conn.execute(
        "INSERT INTO libraries
            (connection_id, remote_id, name, kind, remote_version, sync_cursor,
             strategy, created_at, updated_at)
         VALUES (?, ?, ?, ?, 0, 0, ?, ?, ?)",
        params![
            connection_id,
            remote_id,
            name,
            kind.as_str(),
            strategy.as_str(),
            now.to_rfc3339(),
            now.to_rfc3339(),
        ],
    )?;

    Ok(Library {
        id: conn.last_insert_rowid(),
        connection_id,
        remote_id: remote_id.to_string(),
        name: name.to_string(),
        kind,
        remote_version: 0,
        sync_cursor: 0,
        strategy,
        created_at: now,
        updated_at: now,
    })
}

pub fn get_library(conn: &Connection, id: LibraryId) -> Result<Option<Library>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, connection_id, remote_id, name, kind, remote_version,
                sync_cursor, strategy, created_at, updated_at
         FROM libraries WHERE id = ?",
    )?;

    Ok(stmt.query_row(params![id], library_from_row).optional()?)
}

pub fn list_libraries(conn: &Connection) -> Result<Vec<Library>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, connection_id, remote_id, name, kind, remote_version,
                sync_cursor, strategy, created_at, updated_at
         FROM libraries ORDER BY id",
    )?;

    let libraries: Vec<Library> = stmt
        .query_map([], library_from_row)?
        .filter_map(|r| r.ok())
        .collect();

    Ok(libraries)
}

pub fn set_strategy(
    conn: &Connection,
    library_id: LibraryId,
    strategy: ResolutionStrategy,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE libraries SET strategy = ?, updated_at = ? WHERE id = ?",
        params![strategy.as_str(), Utc::now().to_rfc3339(), library_id],
    )?;
    if changed == 0 {
        return Err(SyncError::NotFound(format!("library {}", library_id)));
    }
    Ok(())
}

/// Advance the sync cursor after a fully committed page
///
/// Both values only move forward; a replayed page cannot drag the cursor
/// back.
pub fn advance_cursor(
    conn: &Connection,
    library_id: LibraryId,
    cursor: i64,
    remote_version: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE libraries
         SET sync_cursor = MAX(sync_cursor, ?),
             remote_version = MAX(remote_version, ?),
             updated_at = ?
         WHERE id = ?",
        params![cursor, remote_version, Utc::now().to_rfc3339(), library_id],
    )?;
    Ok(())
}

/// Parse a pass summary from a database row
pub fn pass_from_row(row: &Row) -> rusqlite::Result<PassSummary> {
    let state_str: String = row.get("state")?;
    let started_at: String = row.get("started_at")?;
    let finished_at: Option<String> = row.get("finished_at")?;

    Ok(PassSummary {
        id: row.get("id")?,
        library_id: row.get("library_id")?,
        state: state_str.parse().unwrap_or(PassState::Failed),
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        finished_at: finished_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }),
        processed: row.get("processed")?,
        added: row.get("added")?,
        updated: row.get("updated")?,
        deleted: row.get("deleted_count")?,
        conflicted: row.get("conflicted")?,
        pushed: row.get("pushed")?,
        push_rejected: row.get("push_rejected")?,
        cursor_before: row.get("cursor_before")?,
        cursor_after: row.get("cursor_after")?,
        error: row.get("error")?,
    })
}

/// Open a pass row; any stale running row from a crashed process is closed
/// out as failed first
pub fn begin_pass(conn: &Connection, library_id: LibraryId, cursor_before: i64) -> Result<i64> {
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "UPDATE sync_passes SET state = 'failed', finished_at = ?, error = 'interrupted'
         WHERE library_id = ? AND state = 'running'",
        params![now, library_id],
    )?;

    conn.execute(
        "INSERT INTO sync_passes (library_id, state, started_at, cursor_before, cursor_after)
         VALUES (?, 'running', ?, ?, ?)",
        params![library_id, now, cursor_before, cursor_before],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Close a pass row with its final state and counters
pub fn finish_pass(conn: &Connection, summary: &PassSummary) -> Result<()> {
    conn.execute(
        "UPDATE sync_passes
         SET state = ?, finished_at = ?, processed = ?, added = ?, updated = ?,
             deleted_count = ?, conflicted = ?, pushed = ?, push_rejected = ?,
             cursor_after = ?, error = ?
         WHERE id = ?",
        params![
            summary.state.as_str(),
            summary.finished_at.map(|t| t.to_rfc3339()),
            summary.processed,
            summary.added,
            summary.updated,
            summary.deleted,
            summary.conflicted,
            summary.pushed,
            summary.push_rejected,
            summary.cursor_after,
            summary.error,
            summary.id,
        ],
    )?;
    Ok(())
}

pub fn latest_pass(conn: &Connection, library_id: LibraryId) -> Result<Option<PassSummary>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, library_id, state, started_at, finished_at, processed, added,
                updated, deleted_count, conflicted, pushed, push_rejected,
                cursor_before, cursor_after, error
         FROM sync_passes WHERE library_id = ?
         ORDER BY id DESC LIMIT 1",
    )?;

    Ok(stmt.query_row(params![library_id], pass_from_row).optional()?)
}

pub fn list_passes(
    conn: &Connection,
    library_id: LibraryId,
    limit: i64,
) -> Result<Vec<PassSummary>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, library_id, state, started_at, finished_at, processed, added,
                updated, deleted_count, conflicted, pushed, push_rejected,
                cursor_before, cursor_after, error
         FROM sync_passes WHERE library_id = ?
         ORDER BY id DESC LIMIT ?",
    )?;

    let passes: Vec<PassSummary> = stmt
        .query_map(params![library_id, limit], pass_from_row)?
        .filter_map(|r| r.ok())
        .collect();

    Ok(passes)
}
