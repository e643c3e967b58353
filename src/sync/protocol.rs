//! Message formats for row-level peer synchronization

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::vector_clock::VectorClock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

/// A single row-level change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncChange {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: SyncOperation,
    /// Full row snapshot, column name to value.
    pub data: Map<String, Value>,
    pub vector_clock: VectorClock,
    /// `updated_at` of the row when the change was computed.
    pub timestamp: f64,
    /// Node the change originated on.
    pub node_id: String,
}

/// Ask a peer for everything it changed since `last_sync_timestamp`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub from_node: String,
    pub to_node: String,
    pub last_sync_timestamp: f64,
    pub vector_clock: VectorClock,
    pub request_id: String,
}

impl SyncRequest {
    pub fn new(from_node: &str, to_node: &str, last_sync_timestamp: f64, vector_clock: VectorClock) -> Self {
        Self {
            from_node: from_node.to_string(),
            to_node: to_node.to_string(),
            last_sync_timestamp,
            vector_clock,
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub from_node: String,
    pub to_node: String,
    pub request_id: String,
    pub changes: Vec<SyncChange>,
    pub vector_clock: VectorClock,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sent back once a response has been applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncAck {
    pub from_node: String,
    pub to_node: String,
    pub request_id: String,
    pub applied_changes: usize,
    pub conflicts: usize,
    pub vector_clock: VectorClock,
}

/// A conflicting change that no strategy resolved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub local_value: Map<String, Value>,
    pub remote_value: Map<String, Value>,
    pub local_clock: VectorClock,
    pub remote_clock: VectorClock,
    pub created_at: f64,
    pub resolved: bool,
    pub resolution: Option<Value>,
}

/// Per-peer bookkeeping written after every `apply_changes`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub peer_id: String,
    pub last_sync_timestamp: f64,
    pub vector_clock: VectorClock,
    pub sync_status: String,
    pub last_error: Option<String>,
    pub created_at: f64,
    pub updated_at: f64,
}
