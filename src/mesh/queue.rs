//! Persistent store-and-forward queue for outbound mesh deltas
//!
//! One row per logical send to one peer. Rows are deleted once the peer
//! acknowledges them; failures only bump `attempts`. Nothing here enforces a
//! retry ceiling: `MeshSyncManager` applies its `RetryPolicy` on top, and
//! `prune_old_events` drops whatever has been waiting too long.

use std::path::Path;

use rusqlite::{params, Connection, Row};
use tokio::sync::Mutex;

use crate::db::{epoch_now, open_connection, StoreError};

#[derive(Clone, Debug, PartialEq)]
pub struct MeshQueueItem {
    pub id: i64,
    pub target_node_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub last_attempt: Option<f64>,
    pub priority: i64,
    pub created_at: f64,
}

const ITEM_COLUMNS: &str =
    "id, target_node_id, event_type, payload, attempts, last_attempt, priority, created_at";

fn read_item(row: &Row<'_>) -> rusqlite::Result<(MeshQueueItem, String)> {
    Ok((
        MeshQueueItem {
            id: row.get(0)?,
            target_node_id: row.get(1)?,
            event_type: row.get(2)?,
            payload: serde_json::Value::Null,
            attempts: row.get(4)?,
            last_attempt: row.get(5)?,
            priority: row.get(6)?,
            created_at: row.get(7)?,
        },
        row.get(3)?,
    ))
}

/// Select items matching `filter`, ordered for delivery. `?2` is the row limit.
fn select_items(
    conn: &Connection,
    filter: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<MeshQueueItem>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM mesh_queue {filter}
         ORDER BY priority DESC, created_at ASC, id ASC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params, read_item)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(mut item, payload)| -> Result<MeshQueueItem, StoreError> {
            item.payload = serde_json::from_str(&payload)?;
            Ok(item)
        })
        .collect()
}

pub struct MeshQueue {
    conn: Mutex<Connection>,
}

impl MeshQueue {
    pub const DEFAULT_PRIORITY: i64 = 1;

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS mesh_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_node_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt REAL,
                priority INTEGER NOT NULL DEFAULT 1,
                created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mesh_target ON mesh_queue(target_node_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Queue a delta for one peer. Returns the row id.
    pub async fn enqueue(
        &self,
        target_node_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        priority: i64,
    ) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(payload)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO mesh_queue (target_node_id, event_type, payload, priority, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![target_node_id, event_type, payload, priority, epoch_now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Waiting items, highest priority first, then oldest first.
    pub async fn get_pending(
        &self,
        target_node_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MeshQueueItem>, StoreError> {
        let conn = self.conn.lock().await;
        select_items(
            &conn,
            "WHERE (?1 IS NULL OR target_node_id = ?1)",
            params![target_node_id, limit as i64],
        )
    }

    /// Like `get_pending`, but only items tried fewer than `max_attempts` times.
    pub async fn get_deliverable(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<MeshQueueItem>, StoreError> {
        let conn = self.conn.lock().await;
        select_items(&conn, "WHERE attempts < ?1", params![max_attempts, limit as i64])
    }

    /// Up to `limit` deliverable items accepted by `is_due`, in delivery order.
    ///
    /// Rows rejected by `is_due` do not count against `limit`; the scan goes
    /// on until `limit` items are found or the queue runs out. Also returns
    /// how many rejected rows were passed over.
    pub async fn get_due<F>(
        &self,
        max_attempts: u32,
        limit: usize,
        is_due: F,
    ) -> Result<(Vec<MeshQueueItem>, usize), StoreError>
    where
        F: Fn(&MeshQueueItem) -> bool,
    {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM mesh_queue WHERE attempts < ?1
             ORDER BY priority DESC, created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![max_attempts], read_item)?;

        let mut due = Vec::new();
        let mut skipped = 0;
        for row in rows {
            if due.len() >= limit {
                break;
            }
            let (mut item, payload) = row?;
            if !is_due(&item) {
                skipped += 1;
                continue;
            }
            item.payload = serde_json::from_str(&payload)?;
            due.push(item);
        }
        Ok((due, skipped))
    }

    /// Drop an acknowledged item.
    pub async fn mark_success(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM mesh_queue WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Count a failed delivery attempt.
    pub async fn mark_failed(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE mesh_queue SET attempts = attempts + 1, last_attempt = ?1 WHERE id = ?2",
            params![epoch_now(), id],
        )?;
        Ok(updated > 0)
    }

    /// Delete items older than `max_age_days`, delivered or not.
    pub async fn prune_old_events(&self, max_age_days: u32) -> Result<usize, StoreError> {
        let cutoff = epoch_now() - f64::from(max_age_days) * 86_400.0;
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM mesh_queue WHERE created_at < ?1", params![cutoff])?;
        Ok(deleted)
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM mesh_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}
