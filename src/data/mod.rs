pub mod migrations;
pub mod repository;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::AppError;

/// The single connection every journal and learning write goes through.
pub type Db = Arc<Mutex<Connection>>;

/// Opens (creating if needed) the database at `path` and brings its schema up to date.
pub fn open_database(path: &Path) -> Result<Connection, AppError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    migrations::run_migrations(&conn)?;
    Ok(conn)
}

pub fn lock(db: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
pub fn test_db() -> Db {
    let conn = Connection::open_in_memory().expect("in-memory database");
    migrations::run_migrations(&conn).expect("migrations");
    Arc::new(Mutex::new(conn))
}
