//! Database migrations for refsync

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    // Create migrations table if not exists
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    if current_version < SCHEMA_VERSION {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Initial schema (v1): connections, libraries, versioned items, modification log
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Credentialed sessions with external accounts
        CREATE TABLE IF NOT EXISTS connections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            label TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- One active connection per (user, external account)
        CREATE UNIQUE INDEX IF NOT EXISTS idx_connections_active
            ON connections(user_id, account_id) WHERE active = 1;

        -- Synchronized libraries
        CREATE TABLE IF NOT EXISTS libraries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id INTEGER NOT NULL,
            remote_id TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'personal',
            remote_version INTEGER NOT NULL DEFAULT 0,
            sync_cursor INTEGER NOT NULL DEFAULT 0,
            strategy TEXT NOT NULL DEFAULT 'manual',
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(connection_id, remote_id),
            FOREIGN KEY (connection_id) REFERENCES connections(id) ON DELETE CASCADE
        );

        -- Versioned items; deletes are tombstones, rows are never removed
        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            library_id INTEGER NOT NULL,
            external_key TEXT NOT NULL,
            item_type TEXT NOT NULL DEFAULT 'record',
            version INTEGER NOT NULL DEFAULT 1,
            payload TEXT NOT NULL DEFAULT '{}',
            deleted INTEGER NOT NULL DEFAULT 0,
            synced INTEGER NOT NULL DEFAULT 0,
            -- Local version at which this row last agreed with the remote;
            -- remote ingestion diffs against it, not against version
            last_synced_version INTEGER NOT NULL DEFAULT 0,
            remote_version INTEGER,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(library_id, external_key),
            FOREIGN KEY (library_id) REFERENCES libraries(id) ON DELETE CASCADE
        );

        -- Append-only audit of accepted mutations; op_id is the idempotency key
        CREATE TABLE IF NOT EXISTS modification_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            op_id TEXT NOT NULL UNIQUE,
            item_id INTEGER NOT NULL,
            library_id INTEGER NOT NULL,
            external_key TEXT NOT NULL,
            actor TEXT NOT NULL,
            operation TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT 'local',
            diff TEXT,
            resulting_version INTEGER NOT NULL,
            is_conflict INTEGER NOT NULL DEFAULT 0,
            conflict_resolution TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(item_id, resulting_version)
        );

        -- Indexes for performance
        CREATE INDEX IF NOT EXISTS idx_libraries_connection ON libraries(connection_id);
        CREATE INDEX IF NOT EXISTS idx_items_library ON items(library_id);
        CREATE INDEX IF NOT EXISTS idx_items_pending ON items(library_id) WHERE synced = 0;
        CREATE INDEX IF NOT EXISTS idx_modlog_item ON modification_log(item_id, resulting_version DESC);
        CREATE INDEX IF NOT EXISTS idx_modlog_library ON modification_log(library_id, created_at DESC);

        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// Lock sessions (v2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS lock_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            target_type TEXT NOT NULL,
            target_id INTEGER NOT NULL,
            mode TEXT NOT NULL,
            holder TEXT NOT NULL,
            acquired_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            expires_at TEXT NOT NULL,
            UNIQUE(target_type, target_id, holder, mode)
        );

        -- At most one live hard lock per target; acquisition is a single
        -- conditional insert under this index
        CREATE UNIQUE INDEX IF NOT EXISTS idx_locks_hard
            ON lock_sessions(target_type, target_id) WHERE mode = 'hard';

        CREATE INDEX IF NOT EXISTS idx_locks_expiry ON lock_sessions(expires_at);

        INSERT INTO schema_version (version) VALUES (2);
        "#,
    )?;

    Ok(())
}

/// Conflict records and sync pass audit (v3)
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Detected write races; rows are never deleted
        CREATE TABLE IF NOT EXISTS conflicts (
            id TEXT PRIMARY KEY,
            library_id INTEGER NOT NULL,
            item_id INTEGER NOT NULL,
            external_key TEXT NOT NULL,
            base_version INTEGER NOT NULL,
            current_version INTEGER NOT NULL,
            incoming_op_id TEXT NOT NULL,
            incoming_payload TEXT NOT NULL DEFAULT '{}',
            incoming_deleted INTEGER NOT NULL DEFAULT 0,
            incoming_actor TEXT NOT NULL,
            incoming_source TEXT NOT NULL DEFAULT 'local',
            current_payload TEXT NOT NULL DEFAULT '{}',
            current_actor TEXT,
            strategy TEXT NOT NULL DEFAULT 'manual',
            status TEXT NOT NULL DEFAULT 'pending',
            resolved_by TEXT,
            resolution_notes TEXT,
            detected_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            resolved_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_conflicts_pending ON conflicts(library_id, status);
        CREATE INDEX IF NOT EXISTS idx_conflicts_item ON conflicts(item_id, detected_at DESC);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_conflicts_op ON conflicts(incoming_op_id);

        -- One row per sync pass
        CREATE TABLE IF NOT EXISTS sync_passes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            library_id INTEGER NOT NULL,
            state TEXT NOT NULL DEFAULT 'running',
            started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            finished_at TEXT,
            processed INTEGER NOT NULL DEFAULT 0,
            added INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            deleted_count INTEGER NOT NULL DEFAULT 0,
            conflicted INTEGER NOT NULL DEFAULT 0,
            pushed INTEGER NOT NULL DEFAULT 0,
            push_rejected INTEGER NOT NULL DEFAULT 0,
            cursor_before INTEGER NOT NULL DEFAULT 0,
            cursor_after INTEGER NOT NULL DEFAULT 0,
            error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_passes_library ON sync_passes(library_id, started_at DESC);

        INSERT INTO schema_version (version) VALUES (3);
        "#,
    )?;

    Ok(())
}
