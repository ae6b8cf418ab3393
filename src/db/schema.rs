//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Pending synthesis tasks; a leased row is invisible until its lease lapses
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            room_id INTEGER NOT NULL,
            channel_id INTEGER NOT NULL,
            text TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 0,
            visible_at INTEGER NOT NULL,
            receipt TEXT,
            lease_expires_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_visible ON tasks(visible_at);

        -- Synthesis outcomes keyed by task id, with absolute expiry
        CREATE TABLE IF NOT EXISTS results (
            task_id TEXT PRIMARY KEY,
            room_id INTEGER NOT NULL,
            channel_id INTEGER NOT NULL,
            status TEXT NOT NULL,
            artifact_path TEXT,
            error TEXT,
            expires_at INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_results_expires ON results(expires_at);

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Per-destination notification list of finished task ids
        CREATE TABLE IF NOT EXISTS ready_list (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id INTEGER NOT NULL,
            channel_id INTEGER NOT NULL,
            task_id TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_ready_list_destination
            ON ready_list(room_id, channel_id, seq);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2");
    Ok(())
}

fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Consumed results stay as markers until they expire
        ALTER TABLE results ADD COLUMN consumed INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE results ADD COLUMN submitted_at INTEGER NOT NULL DEFAULT 0;

        -- Last teardown of each destination; older submissions are orphaned
        CREATE TABLE IF NOT EXISTS closed_destinations (
            room_id INTEGER NOT NULL,
            channel_id INTEGER NOT NULL,
            closed_at INTEGER NOT NULL,
            PRIMARY KEY (room_id, channel_id)
        );

        CREATE INDEX IF NOT EXISTS idx_ready_list_task ON ready_list(task_id);

        PRAGMA user_version = 3;
        ",
    )?;

    tracing::info!("migrated to schema v3");
    Ok(())
}
