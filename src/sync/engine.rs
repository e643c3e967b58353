//! Delta computation, conflict detection and change application
//!
//! The engine works over the node's relational tables. Every synced table
//! must have an `id` column and an `updated_at` column holding Unix seconds;
//! rows are shipped as full snapshots keyed by column name.
//!
//! An incoming change conflicts with local data when a local row exists and
//! was updated strictly after the change. Conflicts go to the configured
//! strategy; a `None` decision persists the conflict and leaves the local row
//! alone.

use std::collections::HashSet;
use std::path::Path;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::{epoch_now, open_connection};

use super::protocol::{
    Conflict, SyncAck, SyncChange, SyncOperation, SyncRequest, SyncResponse, SyncState,
};
use super::resolver::{ConflictResolutionStrategy, VersionedValue};
use super::vector_clock::VectorClock;
use super::SyncError;

/// A table taking part in sync and the entity type its rows travel as.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTable {
    pub table: String,
    pub entity_type: String,
}

impl SyncTable {
    pub fn new(table: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            entity_type: entity_type.into(),
        }
    }
}

enum ApplyOutcome {
    Applied,
    Conflict,
}

struct EngineState {
    conn: Connection,
    clock: VectorClock,
}

pub struct SyncEngine {
    node_id: String,
    tables: Vec<SyncTable>,
    strategy: Box<dyn ConflictResolutionStrategy>,
    state: Mutex<EngineState>,
}

impl SyncEngine {
    /// Open the engine over the database at `path`.
    ///
    /// The local clock is rebuilt from the clocks stored for every peer, so
    /// counters never move backwards across restarts.
    pub fn open(
        path: &Path,
        node_id: impl Into<String>,
        tables: Vec<SyncTable>,
        strategy: Box<dyn ConflictResolutionStrategy>,
    ) -> Result<Self, SyncError> {
        for table in &tables {
            if !is_identifier(&table.table) {
                return Err(SyncError::InvalidTable(table.table.clone()));
            }
        }

        let conn = open_connection(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_state (
                peer_id TEXT PRIMARY KEY,
                last_sync_timestamp REAL NOT NULL,
                vector_clock TEXT NOT NULL,
                sync_status TEXT NOT NULL,
                last_error TEXT,
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sync_conflicts (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                local_value TEXT NOT NULL,
                remote_value TEXT NOT NULL,
                local_clock TEXT NOT NULL,
                remote_clock TEXT NOT NULL,
                created_at REAL NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolution TEXT
            );",
        )?;

        let clock = restore_clock(&conn)?;

        Ok(Self {
            node_id: node_id.into(),
            tables,
            strategy,
            state: Mutex::new(EngineState { conn, clock }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn tables(&self) -> &[SyncTable] {
        &self.tables
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Snapshot of the engine's current clock.
    pub async fn clock(&self) -> VectorClock {
        self.state.lock().await.clock.clone()
    }

    /// Run `f` against the engine's connection (domain writes, inspection).
    pub async fn with_connection<R>(&self, f: impl FnOnce(&Connection) -> R) -> R {
        let state = self.state.lock().await;
        f(&state.conn)
    }

    /// Every row in the synced tables updated after `since`, one change per row.
    pub async fn compute_delta(&self, peer_id: &str, since: f64) -> Result<Vec<SyncChange>, SyncError> {
        let mut state = self.state.lock().await;
        let EngineState { conn, clock } = &mut *state;

        let mut changes = Vec::new();
        for table in &self.tables {
            for data in select_updated_since(conn, &table.table, since)? {
                clock.increment(&self.node_id);
                changes.push(SyncChange {
                    entity_type: table.entity_type.clone(),
                    entity_id: entity_id_of(&data),
                    operation: SyncOperation::Update,
                    timestamp: updated_at_of(&data),
                    data,
                    vector_clock: clock.clone(),
                    node_id: self.node_id.clone(),
                });
            }
        }

        log::info!("Computed {} changes for peer {}", changes.len(), peer_id);
        Ok(changes)
    }

    /// Apply changes received from `peer_id`. Returns `(applied, conflicts)`.
    ///
    /// A change that cannot be applied (unknown entity type, unknown column)
    /// is logged and skipped; it counts toward neither total.
    pub async fn apply_changes(
        &self,
        changes: &[SyncChange],
        peer_id: &str,
    ) -> Result<(usize, usize), SyncError> {
        let mut state = self.state.lock().await;
        let EngineState { conn, clock } = &mut *state;

        let mut applied = 0;
        let mut conflicts = 0;
        for change in changes {
            clock.update(&change.vector_clock);
            match self.apply_one(conn, clock, change) {
                Ok(ApplyOutcome::Applied) => applied += 1,
                Ok(ApplyOutcome::Conflict) => conflicts += 1,
                Err(e) => log::error!(
                    "Error applying change {}/{}: {}",
                    change.entity_type,
                    change.entity_id,
                    e
                ),
            }
        }

        record_synced(conn, peer_id, clock)?;

        log::info!(
            "Applied {} changes, {} conflicts from peer {}",
            applied,
            conflicts,
            peer_id
        );
        Ok((applied, conflicts))
    }

    fn apply_one(
        &self,
        conn: &Connection,
        clock: &VectorClock,
        change: &SyncChange,
    ) -> Result<ApplyOutcome, SyncError> {
        let table = self.table_for(&change.entity_type)?;

        let local = match load_row(conn, table, &change.entity_id)? {
            Some(local) if updated_at_of(&local) > change.timestamp => local,
            _ => {
                write_change(conn, table, change)?;
                return Ok(ApplyOutcome::Applied);
            }
        };

        let local_side = VersionedValue {
            data: &local,
            timestamp: updated_at_of(&local),
            node_id: &self.node_id,
        };
        let remote_side = VersionedValue {
            data: &change.data,
            timestamp: change.timestamp,
            node_id: &change.node_id,
        };

        match self
            .strategy
            .resolve(&local_side, &remote_side, clock, &change.vector_clock)
        {
            Some(resolution) if resolution == local => {
                log::debug!(
                    "Conflict on {}/{} resolved in favour of local row",
                    change.entity_type,
                    change.entity_id
                );
            }
            Some(resolution) if resolution == change.data => {
                write_change(conn, table, change)?;
            }
            Some(resolution) => {
                upsert_row(conn, table, &resolution)?;
            }
            None => {
                store_conflict(conn, change, &local, clock)?;
            }
        }

        Ok(ApplyOutcome::Conflict)
    }

    fn table_for(&self, entity_type: &str) -> Result<&str, SyncError> {
        self.tables
            .iter()
            .find(|t| t.entity_type == entity_type)
            .map(|t| t.table.as_str())
            .ok_or_else(|| SyncError::UnknownEntityType(entity_type.to_string()))
    }

    /// Unresolved conflicts, oldest first.
    pub async fn get_conflicts(&self) -> Result<Vec<Conflict>, SyncError> {
        let state = self.state.lock().await;
        let mut stmt = state.conn.prepare(
            "SELECT id, entity_type, entity_id, local_value, remote_value,
                    local_clock, remote_clock, created_at, resolved, resolution
             FROM sync_conflicts WHERE resolved = 0
             ORDER BY created_at ASC",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, bool>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(id, entity_type, entity_id, local, remote, local_clock, remote_clock, created_at, resolved, resolution)|
                 -> Result<Conflict, SyncError> {
                    Ok(Conflict {
                        id,
                        entity_type,
                        entity_id,
                        local_value: serde_json::from_str(&local)?,
                        remote_value: serde_json::from_str(&remote)?,
                        local_clock: VectorClock::from_json(&local_clock)?,
                        remote_clock: VectorClock::from_json(&remote_clock)?,
                        created_at,
                        resolved,
                        resolution: resolution.as_deref().map(serde_json::from_str).transpose()?,
                    })
                },
            )
            .collect()
    }

    /// Close a conflict with an operator's decision.
    ///
    /// An object resolution is written to the entity's table as the row's new
    /// value. Returns false if the conflict does not exist or is already resolved.
    pub async fn resolve_conflict(&self, conflict_id: &str, resolution: Value) -> Result<bool, SyncError> {
        let mut state = self.state.lock().await;
        let tx = state.conn.transaction()?;

        let entity_type: Option<String> = tx
            .query_row(
                "SELECT entity_type FROM sync_conflicts WHERE id = ?1 AND resolved = 0",
                params![conflict_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(entity_type) = entity_type else {
            return Ok(false);
        };

        if let Value::Object(row) = &resolution {
            upsert_row(&tx, self.table_for(&entity_type)?, row)?;
        }

        tx.execute(
            "UPDATE sync_conflicts SET resolved = 1, resolution = ?1 WHERE id = ?2",
            params![serde_json::to_string(&resolution)?, conflict_id],
        )?;
        tx.commit()?;

        log::info!("Conflict {} resolved", conflict_id);
        Ok(true)
    }

    pub async fn get_sync_state(&self, peer_id: &str) -> Result<Option<SyncState>, SyncError> {
        let state = self.state.lock().await;
        let row = state
            .conn
            .query_row(
                "SELECT peer_id, last_sync_timestamp, vector_clock, sync_status,
                        last_error, created_at, updated_at
                 FROM sync_state WHERE peer_id = ?1",
                params![peer_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, f64>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((peer_id, last_sync_timestamp, clock, sync_status, last_error, created_at, updated_at)) = row
        else {
            return Ok(None);
        };

        Ok(Some(SyncState {
            peer_id,
            last_sync_timestamp,
            vector_clock: VectorClock::from_json(&clock)?,
            sync_status,
            last_error,
            created_at,
            updated_at,
        }))
    }

    /// Note a failed exchange with `peer_id` without moving its sync watermark.
    pub async fn record_sync_failure(&self, peer_id: &str, error: &str) -> Result<(), SyncError> {
        let state = self.state.lock().await;
        let now = epoch_now();
        state.conn.execute(
            "INSERT INTO sync_state (
                peer_id, last_sync_timestamp, vector_clock, sync_status,
                last_error, created_at, updated_at
            ) VALUES (?1, 0, ?2, 'error', ?3, ?4, ?4)
            ON CONFLICT(peer_id) DO UPDATE SET
                sync_status = 'error',
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
            params![peer_id, state.clock.to_json()?, error, now],
        )?;
        Ok(())
    }

    /// Build a request for everything `peer_id` changed since our last sync with it.
    pub async fn build_sync_request(&self, peer_id: &str) -> Result<SyncRequest, SyncError> {
        let since = self
            .get_sync_state(peer_id)
            .await?
            .map(|s| s.last_sync_timestamp)
            .unwrap_or(0.0);
        Ok(SyncRequest::new(&self.node_id, peer_id, since, self.clock().await))
    }

    /// Answer a peer's request with our delta since its watermark.
    pub async fn handle_sync_request(&self, request: &SyncRequest) -> Result<SyncResponse, SyncError> {
        let changes = self
            .compute_delta(&request.from_node, request.last_sync_timestamp)
            .await?;

        Ok(SyncResponse {
            from_node: self.node_id.clone(),
            to_node: request.from_node.clone(),
            request_id: request.request_id.clone(),
            changes,
            vector_clock: self.clock().await,
            success: true,
            error: None,
        })
    }

    /// Apply a peer's response and produce the acknowledgement.
    pub async fn apply_sync_response(&self, response: &SyncResponse) -> Result<SyncAck, SyncError> {
        if !response.success {
            let error = response.error.clone().unwrap_or_else(|| "unknown error".to_string());
            self.record_sync_failure(&response.from_node, &error).await?;
            return Err(SyncError::PeerFailure(error));
        }

        let (applied_changes, conflicts) = self
            .apply_changes(&response.changes, &response.from_node)
            .await?;

        Ok(SyncAck {
            from_node: self.node_id.clone(),
            to_node: response.from_node.clone(),
            request_id: response.request_id.clone(),
            applied_changes,
            conflicts,
            vector_clock: self.clock().await,
        })
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn restore_clock(conn: &Connection) -> Result<VectorClock, SyncError> {
    let mut stmt = conn.prepare("SELECT peer_id, vector_clock FROM sync_state")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut clock = VectorClock::new();
    for (peer_id, json) in rows {
        match VectorClock::from_json(&json) {
            Ok(stored) => clock.update(&stored),
            Err(e) => log::warn!("Ignoring unreadable clock for peer {}: {}", peer_id, e),
        }
    }
    Ok(clock)
}

fn record_synced(conn: &Connection, peer_id: &str, clock: &VectorClock) -> Result<(), SyncError> {
    let now = epoch_now();
    conn.execute(
        "INSERT INTO sync_state (
            peer_id, last_sync_timestamp, vector_clock, sync_status,
            last_error, created_at, updated_at
        ) VALUES (?1, ?2, ?3, 'synced', NULL, ?2, ?2)
        ON CONFLICT(peer_id) DO UPDATE SET
            last_sync_timestamp = excluded.last_sync_timestamp,
            vector_clock = excluded.vector_clock,
            sync_status = 'synced',
            last_error = NULL,
            updated_at = excluded.updated_at",
        params![peer_id, now, clock.to_json()?],
    )?;
    Ok(())
}

fn select_updated_since(
    conn: &Connection,
    table: &str,
    since: f64,
) -> Result<Vec<Map<String, Value>>, SyncError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM \"{table}\" WHERE updated_at > ?1 ORDER BY updated_at ASC"
    ))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let rows = stmt
        .query_map(params![since], |row| {
            let mut data = Map::new();
            for (i, column) in columns.iter().enumerate() {
                data.insert(column.clone(), sql_to_json(row.get_ref(i)?));
            }
            Ok(data)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn load_row(
    conn: &Connection,
    table: &str,
    entity_id: &str,
) -> Result<Option<Map<String, Value>>, SyncError> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM \"{table}\" WHERE id = ?1"))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let row = stmt
        .query_row(params![entity_id], |row| {
            let mut data = Map::new();
            for (i, column) in columns.iter().enumerate() {
                data.insert(column.clone(), sql_to_json(row.get_ref(i)?));
            }
            Ok(data)
        })
        .optional()?;
    Ok(row)
}

fn write_change(conn: &Connection, table: &str, change: &SyncChange) -> Result<(), SyncError> {
    match change.operation {
        SyncOperation::Delete => {
            conn.execute(
                &format!("DELETE FROM \"{table}\" WHERE id = ?1"),
                params![change.entity_id],
            )?;
            Ok(())
        }
        SyncOperation::Create | SyncOperation::Update => upsert_row(conn, table, &change.data),
    }
}

/// `INSERT OR REPLACE` a full row after checking every column exists.
fn upsert_row(conn: &Connection, table: &str, data: &Map<String, Value>) -> Result<(), SyncError> {
    if data.is_empty() {
        return Err(SyncError::InvalidChange(format!("empty row for {}", table)));
    }

    let known = table_columns(conn, table)?;
    if let Some(column) = data.keys().find(|c| !known.contains(c.as_str())) {
        return Err(SyncError::UnknownColumn {
            table: table.to_string(),
            column: column.clone(),
        });
    }

    let columns = data
        .keys()
        .map(|c| format!("\"{}\"", c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=data.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");

    conn.execute(
        &format!("INSERT OR REPLACE INTO \"{table}\" ({columns}) VALUES ({placeholders})"),
        params_from_iter(data.values().map(json_to_sql)),
    )?;
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>, SyncError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    if columns.is_empty() {
        return Err(SyncError::InvalidTable(table.to_string()));
    }
    Ok(columns)
}

fn store_conflict(
    conn: &Connection,
    change: &SyncChange,
    local: &Map<String, Value>,
    local_clock: &VectorClock,
) -> Result<(), SyncError> {
    let conflict_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sync_conflicts (
            id, entity_type, entity_id, local_value, remote_value,
            local_clock, remote_clock, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            conflict_id,
            change.entity_type,
            change.entity_id,
            serde_json::to_string(local)?,
            serde_json::to_string(&change.data)?,
            local_clock.to_json()?,
            change.vector_clock.to_json()?,
            epoch_now(),
        ],
    )?;

    log::warn!(
        "Stored conflict {} on {}/{} for manual resolution",
        conflict_id,
        change.entity_type,
        change.entity_id
    );
    Ok(())
}

fn entity_id_of(data: &Map<String, Value>) -> String {
    match data.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn updated_at_of(data: &Map<String, Value>) -> f64 {
    data.get("updated_at").and_then(Value::as_f64).unwrap_or(0.0)
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::String(hex::encode(blob)),
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::resolver::{LastWriteWins, ManualResolution};
    use serde_json::json;

    const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS harvests (
        id TEXT PRIMARY KEY,
        crop TEXT NOT NULL,
        quantity INTEGER NOT NULL,
        updated_at REAL NOT NULL
    );";

    fn open_engine(
        dir: &tempfile::TempDir,
        node_id: &str,
        strategy: Box<dyn ConflictResolutionStrategy>,
    ) -> SyncEngine {
        SyncEngine::open(
            &dir.path().join(format!("{}.db", node_id)),
            node_id,
            vec![SyncTable::new("harvests", "harvest")],
            strategy,
        )
        .unwrap()
    }

    async fn write_harvest(engine: &SyncEngine, id: &str, quantity: i64, updated_at: f64) {
        engine
            .with_connection(|conn| -> rusqlite::Result<usize> {
                conn.execute_batch(SCHEMA)?;
                conn.execute(
                    "INSERT OR REPLACE INTO harvests (id, crop, quantity, updated_at)
                     VALUES (?1, 'maize', ?2, ?3)",
                    params![id, quantity, updated_at],
                )
            })
            .await
            .unwrap();
    }

    async fn quantity_of(engine: &SyncEngine, id: &str) -> Option<i64> {
        engine
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT quantity FROM harvests WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await
            .unwrap()
    }

    fn change(quantity: i64, timestamp: f64, node_id: &str) -> SyncChange {
        let data = match json!({"id": "h1", "crop": "maize", "quantity": quantity, "updated_at": timestamp}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let mut clock = VectorClock::new();
        clock.increment(node_id);
        SyncChange {
            entity_type: "harvest".into(),
            entity_id: "h1".into(),
            operation: SyncOperation::Update,
            data,
            vector_clock: clock,
            timestamp,
            node_id: node_id.into(),
        }
    }

    #[test]
    fn test_rejects_unsafe_table_names() {
        let dir = tempfile::tempdir().unwrap();
        let result = SyncEngine::open(
            &dir.path().join("x.db"),
            "node-a",
            vec![SyncTable::new("harvests; DROP TABLE x", "harvest")],
            Box::new(LastWriteWins),
        );
        assert!(matches!(result, Err(SyncError::InvalidTable(_))));
    }

    #[tokio::test]
    async fn test_compute_delta_filters_and_bumps_clock() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir, "node-a", Box::new(LastWriteWins));
        write_harvest(&engine, "old", 1, 10.0).await;
        write_harvest(&engine, "new", 2, 20.0).await;

        let delta = engine.compute_delta("node-b", 15.0).await.unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].entity_id, "new");
        assert_eq!(delta[0].entity_type, "harvest");
        assert_eq!(delta[0].timestamp, 20.0);
        assert_eq!(delta[0].vector_clock.get("node-a"), 1);
        assert_eq!(delta[0].data["quantity"], 2);

        let all = engine.compute_delta("node-b", 0.0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].vector_clock.get("node-a"), 3);
    }

    #[tokio::test]
    async fn test_change_without_local_row_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir, "node-a", Box::new(ManualResolution));
        write_harvest(&engine, "other", 1, 1.0).await;

        let (applied, conflicts) = engine
            .apply_changes(&[change(7, 50.0, "node-b")], "node-b")
            .await
            .unwrap();
        assert_eq!((applied, conflicts), (1, 0));
        assert_eq!(quantity_of(&engine, "h1").await, Some(7));
        assert_eq!(engine.clock().await.get("node-b"), 1);
    }

    #[tokio::test]
    async fn test_newer_local_row_becomes_conflict_under_manual() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir, "node-a", Box::new(ManualResolution));
        write_harvest(&engine, "h1", 15, 105.0).await;

        let (applied, conflicts) = engine
            .apply_changes(&[change(10, 100.0, "node-b")], "node-b")
            .await
            .unwrap();
        assert_eq!((applied, conflicts), (0, 1));
        assert_eq!(quantity_of(&engine, "h1").await, Some(15));

        let stored = engine.get_conflicts().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].local_value["quantity"], 15);
        assert_eq!(stored[0].remote_value["quantity"], 10);
        assert_eq!(stored[0].remote_clock.get("node-b"), 1);
        assert!(!stored[0].resolved);

        assert!(engine
            .resolve_conflict(&stored[0].id, Value::Object(stored[0].remote_value.clone()))
            .await
            .unwrap());
        assert!(engine.get_conflicts().await.unwrap().is_empty());
        assert_eq!(quantity_of(&engine, "h1").await, Some(10));
        assert!(!engine.resolve_conflict(&stored[0].id, json!(null)).await.unwrap());
    }

    #[tokio::test]
    async fn test_newer_local_row_wins_under_lww() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir, "node-b", Box::new(LastWriteWins));
        write_harvest(&engine, "h1", 15, 105.0).await;

        let (applied, conflicts) = engine
            .apply_changes(&[change(10, 100.0, "node-a")], "node-a")
            .await
            .unwrap();
        assert_eq!((applied, conflicts), (0, 1));
        assert_eq!(quantity_of(&engine, "h1").await, Some(15));
        assert!(engine.get_conflicts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_column_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir, "node-a", Box::new(LastWriteWins));
        write_harvest(&engine, "other", 1, 1.0).await;

        let mut bad = change(3, 10.0, "node-b");
        bad.data.insert("injected\"; DROP TABLE harvests; --".into(), json!(1));

        let (applied, conflicts) = engine.apply_changes(&[bad], "node-b").await.unwrap();
        assert_eq!((applied, conflicts), (0, 0));
        assert_eq!(quantity_of(&engine, "h1").await, None);
        assert_eq!(quantity_of(&engine, "other").await, Some(1));
    }

    #[tokio::test]
    async fn test_sync_state_and_clock_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = open_engine(&dir, "node-a", Box::new(LastWriteWins));
            write_harvest(&engine, "other", 1, 1.0).await;
            engine
                .apply_changes(&[change(4, 10.0, "node-b")], "node-b")
                .await
                .unwrap();

            let state = engine.get_sync_state("node-b").await.unwrap().unwrap();
            assert_eq!(state.sync_status, "synced");
            assert!(state.last_sync_timestamp > 0.0);
        }

        let reopened = open_engine(&dir, "node-a", Box::new(LastWriteWins));
        assert_eq!(reopened.clock().await.get("node-b"), 1);
        assert!(reopened.get_sync_state("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_request_response_ack_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let a = open_engine(&dir, "node-a", Box::new(LastWriteWins));
        let b = open_engine(&dir, "node-b", Box::new(LastWriteWins));
        write_harvest(&a, "seed", 1, 1.0).await;
        write_harvest(&b, "h1", 9, 42.0).await;

        let request = a.build_sync_request("node-b").await.unwrap();
        assert_eq!(request.last_sync_timestamp, 0.0);

        let response = b.handle_sync_request(&request).await.unwrap();
        assert_eq!(response.changes.len(), 1);

        let ack = a.apply_sync_response(&response).await.unwrap();
        assert_eq!(ack.applied_changes, 1);
        assert_eq!(ack.request_id, request.request_id);
        assert_eq!(quantity_of(&a, "h1").await, Some(9));
    }

    #[tokio::test]
    async fn test_failed_response_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir, "node-a", Box::new(LastWriteWins));
        let response = SyncResponse {
            from_node: "node-b".into(),
            to_node: "node-a".into(),
            request_id: "r1".into(),
            changes: vec![],
            vector_clock: VectorClock::new(),
            success: false,
            error: Some("disk full".into()),
        };

        assert!(matches!(
            engine.apply_sync_response(&response).await,
            Err(SyncError::PeerFailure(_))
        ));
        let state = engine.get_sync_state("node-b").await.unwrap().unwrap();
        assert_eq!(state.sync_status, "error");
        assert_eq!(state.last_error.as_deref(), Some("disk full"));
    }
}
