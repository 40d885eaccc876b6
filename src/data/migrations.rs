use rusqlite::Connection;

use crate::error::AppError;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS operations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    operation_id TEXT UNIQUE NOT NULL,
    kind TEXT NOT NULL,
    source TEXT NOT NULL,
    destination TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    source_fingerprint TEXT,
    destination_fingerprint TEXT,
    reverts TEXT,
    classification TEXT
);

CREATE INDEX IF NOT EXISTS idx_operations_source ON operations(source);
CREATE INDEX IF NOT EXISTS idx_operations_status ON operations(status);
CREATE INDEX IF NOT EXISTS idx_operations_created ON operations(created_at DESC);

CREATE TRIGGER IF NOT EXISTS operations_append_only
BEFORE DELETE ON operations
BEGIN
    SELECT RAISE(ABORT, 'operations are append-only');
END;

CREATE TABLE IF NOT EXISTS operation_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation_id TEXT NOT NULL,
    from_status TEXT,
    to_status TEXT NOT NULL,
    at TEXT NOT NULL,
    note TEXT
);

CREATE INDEX IF NOT EXISTS idx_transitions_operation ON operation_transitions(operation_id);

CREATE TRIGGER IF NOT EXISTS transitions_no_update
BEFORE UPDATE ON operation_transitions
BEGIN
    SELECT RAISE(ABORT, 'operation transitions are append-only');
END;

CREATE TRIGGER IF NOT EXISTS transitions_no_delete
BEFORE DELETE ON operation_transitions
BEGIN
    SELECT RAISE(ABORT, 'operation transitions are append-only');
END;

CREATE TABLE IF NOT EXISTS learning_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL,
    category TEXT NOT NULL,
    modality TEXT NOT NULL,
    confidence REAL,
    action TEXT NOT NULL,
    overridden BOOLEAN NOT NULL DEFAULT 0,
    source TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS learning_events_no_update
BEFORE UPDATE ON learning_events
BEGIN
    SELECT RAISE(ABORT, 'learning events are append-only');
END;

CREATE TRIGGER IF NOT EXISTS learning_events_no_delete
BEFORE DELETE ON learning_events
BEGIN
    SELECT RAISE(ABORT, 'learning events are append-only');
END;

CREATE TABLE IF NOT EXISTS learning_stats_checkpoint (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_event_id INTEGER NOT NULL,
    stats TEXT NOT NULL,
    checkpointed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS staging_entries (
    id TEXT PRIMARY KEY,
    path TEXT UNIQUE NOT NULL,
    first_seen TEXT NOT NULL,
    scan_generation INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL,
    modified_at TEXT,
    state TEXT NOT NULL,
    result TEXT,
    reasoning TEXT,
    operation_id TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_staging_state ON staging_entries(state);
";

pub fn run_migrations(conn: &Connection) -> Result<(), AppError> {
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA synchronous=FULL;")?;
    conn.execute_batch(SCHEMA_V1)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in [
            "settings",
            "operations",
            "operation_transitions",
            "learning_events",
            "learning_stats_checkpoint",
            "staging_entries",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_migration_enables_wal() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("test.db")).unwrap();
        run_migrations(&conn).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn test_migration_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap(); // should not error
    }

    #[test]
    fn test_logs_reject_deletes() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO learning_events (file_path, category, modality, action, source, recorded_at)
             VALUES ('/a', 'images', 'image', 'skip', 'classifier', '2025-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        assert!(conn.execute("DELETE FROM learning_events", []).is_err());
        assert!(conn
            .execute("UPDATE learning_events SET overridden = 1", [])
            .is_err());
    }
}
