//! Graph store tables and their versioned migrations.

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::errors::{PtResult, StoreError};

/// Version written to `store_meta` once every migration step has applied.
pub const SCHEMA_VERSION: i32 = 2;

/// Core DDL statements, safe to replay on an initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY,
        language TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        entity_count INTEGER NOT NULL DEFAULT 0,
        last_indexed_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS entities (
        key TEXT PRIMARY KEY,
        language TEXT NOT NULL,
        file_path TEXT NOT NULL,
        kind TEXT NOT NULL,
        qualified_name TEXT NOT NULL,
        name TEXT NOT NULL,
        signature_text TEXT,
        visibility TEXT NOT NULL,
        is_test INTEGER NOT NULL DEFAULT 0,
        confidence TEXT NOT NULL,
        start_line INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        payload TEXT NOT NULL,
        checksum INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS edges (
        from_key TEXT NOT NULL,
        to_key TEXT NOT NULL,
        kind TEXT NOT NULL,
        from_file TEXT NOT NULL,
        resolution TEXT NOT NULL,
        target_name TEXT,
        provenance TEXT NOT NULL,
        checksum INTEGER NOT NULL,
        PRIMARY KEY(from_key, to_key, kind)
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE INDEX IF NOT EXISTS idx_entities_file ON entities(file_path);",
    "CREATE INDEX IF NOT EXISTS idx_entities_qualified ON entities(language, qualified_name);",
    "CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(kind);",
    "CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_key);",
    "CREATE INDEX IF NOT EXISTS idx_edges_from_file ON edges(from_file);",
    "CREATE INDEX IF NOT EXISTS idx_files_hash ON files(content_hash);",
];

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Version the tables in [`SCHEMA_STATEMENTS`] correspond to. A database
/// with no recorded version was just created from them.
const BASELINE_VERSION: i32 = 1;

/// One schema upgrade, applied when the stored version is below `version`.
struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    // Indexing diagnostics and the unresolved-edge lookup index.
    version: 2,
    sql: "CREATE TABLE IF NOT EXISTS indexing_diagnostics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            severity TEXT NOT NULL DEFAULT 'error',
            file_path TEXT,
            message TEXT NOT NULL,
            created_at TEXT DEFAULT CURRENT_TIMESTAMP
          );
          CREATE INDEX IF NOT EXISTS idx_index_diag_run
            ON indexing_diagnostics(run_id, id);
          CREATE INDEX IF NOT EXISTS idx_edges_resolution
            ON edges(resolution, target_name);",
}];

/// Bring the database up to [`SCHEMA_VERSION`].
pub fn migrate_schema(conn: &Connection) -> PtResult<()> {
    let mut current = get_schema_version(conn);
    if current == 0 {
        set_schema_version(conn, BASELINE_VERSION)?;
        current = BASELINE_VERSION;
    }
    let start = current;
    for migration in MIGRATIONS.iter().filter(|m| m.version > start) {
        apply_migration(conn, current, migration)?;
        current = migration.version;
    }
    Ok(())
}

/// Apply one step inside a SAVEPOINT; on failure only that step is undone
/// and the failure is written to `migration_history`.
fn apply_migration(conn: &Connection, from: i32, migration: &Migration) -> PtResult<()> {
    conn.execute_batch("SAVEPOINT pt_migration;")?;
    let applied = conn
        .execute_batch(migration.sql)
        .map_err(StoreError::from)
        .and_then(|()| set_schema_version(conn, migration.version))
        .and_then(|()| record_migration_step(conn, from, migration.version, "success", None));
    match applied {
        Ok(()) => {
            conn.execute_batch("RELEASE SAVEPOINT pt_migration;")?;
            debug!("schema migrated {from} -> {}", migration.version);
            Ok(())
        }
        Err(e) => {
            conn.execute_batch("ROLLBACK TO SAVEPOINT pt_migration; RELEASE SAVEPOINT pt_migration;")?;
            warn!("schema migration {from} -> {} failed: {e}", migration.version);
            record_migration_step(conn, from, migration.version, "failed", Some(&e.to_string()))?;
            Err(e)
        }
    }
}

/// Returns 0 when the key is absent or unparseable.
pub fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> PtResult<()> {
    conn.execute(
        "INSERT INTO store_meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> PtResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}
