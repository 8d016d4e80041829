use crate::core::broker::DbBroker;
use crate::core::error;
use crate::core::schemas;
use rusqlite::{Connection, params};
use std::fs;
use std::path::{Path, PathBuf};

/// SQLite busy timeout; covers contention from other processes.
const BUSY_TIMEOUT_SECS: u64 = 5;

pub fn db_connect(db_path: &str) -> Result<Connection, error::MoltError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(BUSY_TIMEOUT_SECS))
        .map_err(error::MoltError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::MoltError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::MoltError::RusqliteError)?;
    Ok(conn)
}

pub fn context_db_path(root: &Path) -> PathBuf {
    root.join(schemas::CONTEXT_DB_NAME)
}

pub fn initialize_context_db(root: &Path) -> Result<(), error::MoltError> {
    let db_path = context_db_path(root);
    fs::create_dir_all(root).map_err(error::MoltError::IoError)?;

    let broker = DbBroker::new(root);
    broker.with_conn(&db_path, "molt", None, "store.init", |conn| {
        for ddl in schemas::CONTEXT_DB_SCHEMAS {
            conn.execute(ddl, [])?;
        }
        Ok(())
    })?;
    tracing::debug!(db = %db_path.display(), "context database ready");
    Ok(())
}

/// Increment and return a named counter. Must run inside the caller's transaction.
pub fn next_counter(conn: &Connection, name: &str) -> Result<i64, error::MoltError> {
    conn.execute(
        "INSERT INTO counters(name, value) VALUES(?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1",
        params![name],
    )?;
    let value = conn.query_row(
        "SELECT value FROM counters WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(value)
}

pub fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>, error::MoltError> {
    use rusqlite::OptionalExtension;
    let value = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
        .optional()?;
    Ok(value)
}

pub fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<(), error::MoltError> {
    conn.execute(
        "INSERT INTO meta(key, value) VALUES(?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}
