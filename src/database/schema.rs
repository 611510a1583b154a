//! SQLite schema for the audit store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL mode for better concurrent reads while the coordinator writes
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
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
        apply_v1_schema(conn)?;
    }

    Ok(())
}

fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    // One record per data identity; the payload is the serialized item.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS data (
            identity TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            subtype TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    // One row per (identity, stage) that has finished that stage.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS stage_history (
            identity TEXT NOT NULL,
            stage INTEGER NOT NULL,
            PRIMARY KEY (identity, stage),
            FOREIGN KEY (identity) REFERENCES data(identity) ON DELETE CASCADE
        )",
        [],
    )?;

    // One row per (identity, plugin) the plugin has processed.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS plugin_history (
            identity TEXT NOT NULL,
            plugin TEXT NOT NULL,
            PRIMARY KEY (identity, plugin),
            FOREIGN KEY (identity) REFERENCES data(identity) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_data_kind ON data(kind, subtype)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_stage_history_stage ON stage_history(stage)",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='data'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}
