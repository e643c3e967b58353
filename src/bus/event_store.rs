//! SQLite-backed persistent event queue
//!
//! Rows move `pending -> processing -> {completed, failed}` and never back.
//! `get_pending_events` returns both pending and processing rows: a row left in
//! processing means the node went down while handlers were running, so on boot
//! the whole set is replayed once through the dispatcher.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::db::{epoch_now, open_connection, StoreError};

use super::event::Event;

/// Lifecycle state of a stored event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EventStatus::Pending),
            "processing" => Some(EventStatus::Processing),
            "completed" => Some(EventStatus::Completed),
            "failed" => Some(EventStatus::Failed),
            _ => None,
        }
    }
}

/// An event row together with its queue bookkeeping.
#[derive(Clone, Debug)]
pub struct StoredEvent {
    pub event: Event,
    pub status: EventStatus,
    pub retry_count: u32,
    pub created_at: f64,
    pub error_message: Option<String>,
}

const EVENT_COLUMNS: &str = "id, event_name, payload, correlation_id, timestamp, source_node";

/// Raw column values for an event, decoded outside of rusqlite's row callback.
struct EventRow {
    id: String,
    name: String,
    payload: String,
    correlation_id: Option<String>,
    timestamp: String,
    source_node: Option<String>,
}

impl EventRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            payload: row.get(2)?,
            correlation_id: row.get(3)?,
            timestamp: row.get(4)?,
            source_node: row.get(5)?,
        })
    }

    fn into_event(self) -> Result<Event, StoreError> {
        let payload = serde_json::from_str(&self.payload)?;
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| StoreError::CorruptRow(format!("event {}: {}", self.id, e)))?
            .with_timezone(&Utc);

        Ok(Event::restore(
            self.id,
            self.name,
            payload,
            self.correlation_id,
            timestamp,
            self.source_node,
        ))
    }
}

/// Durable, crash-safe event queue over a single-writer SQLite connection.
pub struct EventStore {
    conn: Mutex<Connection>,
    ttl: Duration,
}

impl EventStore {
    /// Completed events are kept for a day before `cleanup_old_events` removes them.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

    /// Open the store at `path`, creating the schema if needed.
    pub fn open(path: &Path, ttl: Duration) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                event_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                correlation_id TEXT,
                timestamp TEXT NOT NULL,
                source_node TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at REAL NOT NULL,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_status_created
                ON events(status, created_at);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Persist an event with status `pending`.
    pub async fn enqueue(&self, event: &Event) -> Result<(), StoreError> {
        let payload = serde_json::to_string(event.payload())?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events (
                id, event_name, payload, correlation_id,
                timestamp, source_node, created_at, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending')",
            params![
                event.id(),
                event.name(),
                payload,
                event.correlation_id(),
                event.timestamp().to_rfc3339(),
                event.source_node(),
                epoch_now(),
            ],
        )?;
        Ok(())
    }

    /// Claim the oldest pending event, flipping it to `processing`.
    ///
    /// Select and update happen in one transaction under the store lock, so
    /// two concurrent callers can never be handed the same row.
    pub async fn dequeue(&self) -> Result<Option<Event>, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let row = tx
            .query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     WHERE status = 'pending'
                     ORDER BY created_at ASC, rowid ASC
                     LIMIT 1"
                ),
                [],
                EventRow::read,
            )
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE events SET status = 'processing' WHERE id = ?1",
            params![row.id],
        )?;
        tx.commit()?;

        row.into_event().map(Some)
    }

    /// Claim a specific pending event. Returns false if it was not pending.
    pub async fn mark_processing(&self, event_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE events SET status = 'processing'
             WHERE id = ?1 AND status = 'pending'",
            params![event_id],
        )?;
        Ok(changed > 0)
    }

    /// Mark an event as successfully handled. Terminal rows are left untouched.
    pub async fn mark_completed(&self, event_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE events SET status = 'completed'
             WHERE id = ?1 AND status IN ('pending', 'processing')",
            params![event_id],
        )?;
        Ok(changed > 0)
    }

    /// Mark an event as failed and bump its retry count. Failed rows are not requeued.
    pub async fn mark_failed(&self, event_id: &str, error_message: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE events
             SET status = 'failed', error_message = ?1, retry_count = retry_count + 1
             WHERE id = ?2 AND status IN ('pending', 'processing')",
            params![error_message, event_id],
        )?;
        Ok(changed > 0)
    }

    /// All events that still need handling, oldest first.
    pub async fn get_pending_events(&self) -> Result<Vec<Event>, StoreError> {
        let rows = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE status IN ('pending', 'processing')
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt
                .query_map([], EventRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Look up a single event with its queue state.
    pub async fn get(&self, event_id: &str) -> Result<Option<StoredEvent>, StoreError> {
        let found = {
            let conn = self.conn.lock().await;
            conn.query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS}, status, retry_count, created_at, error_message
                     FROM events WHERE id = ?1"
                ),
                params![event_id],
                |row| {
                    Ok((
                        EventRow::read(row)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, u32>(7)?,
                        row.get::<_, f64>(8)?,
                        row.get::<_, Option<String>>(9)?,
                    ))
                },
            )
            .optional()?
        };

        let Some((row, status, retry_count, created_at, error_message)) = found else {
            return Ok(None);
        };

        let status = EventStatus::parse(&status)
            .ok_or_else(|| StoreError::CorruptRow(format!("unknown status '{}'", status)))?;

        Ok(Some(StoredEvent {
            event: row.into_event()?,
            status,
            retry_count,
            created_at,
            error_message,
        }))
    }

    pub async fn get_status(&self, event_id: &str) -> Result<Option<EventStatus>, StoreError> {
        Ok(self.get(event_id).await?.map(|stored| stored.status))
    }

    /// Delete completed events older than the TTL. Returns the number removed.
    pub async fn cleanup_old_events(&self) -> Result<usize, StoreError> {
        let cutoff = epoch_now() - self.ttl.as_secs_f64();
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM events WHERE status = 'completed' AND created_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    /// Number of events waiting to be claimed.
    pub async fn get_queue_depth(&self) -> Result<usize, StoreError> {
        self.count_with_status(EventStatus::Pending).await
    }

    pub async fn get_failed_count(&self) -> Result<usize, StoreError> {
        self.count_with_status(EventStatus::Failed).await
    }

    async fn count_with_status(&self, status: EventStatus) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
