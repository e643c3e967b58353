//! SQLite plumbing shared by every durable subsystem
//!
//! Each subsystem (event store, scheduler, mesh queue, sync engine) opens its
//! own connection to the node database and guards it with an async mutex, so
//! exactly one statement is in flight per subsystem. WAL journaling lets the
//! other subsystems keep reading while one of them writes.

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

/// Open (or create) the database at `path` with WAL journaling enabled.
///
/// The parent directory is created if it does not exist yet.
pub fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    // journal_mode returns the resulting mode as a row
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/// Current wall-clock time as fractional Unix seconds.
pub fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_and_enables_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("node.db");

        let conn = open_connection(&path).unwrap();
        assert!(path.exists());

        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_epoch_now_is_monotonic_enough() {
        let a = epoch_now();
        let b = epoch_now();
        assert!(b >= a);
        assert!(a > 1_600_000_000.0);
    }
}
