//! Row-level peer synchronization with vector clocks
//!
//! This module provides the causal-ordering side of offline reconciliation:
//! - `VectorClock`: per-node write counters and their partial order
//! - `ConflictResolutionStrategy`: pluggable policy for concurrent row edits
//! - `SyncEngine`: computes and applies row deltas over the node database

pub mod engine;
pub mod protocol;
pub mod resolver;
pub mod vector_clock;

pub use engine::{SyncEngine, SyncTable};
pub use protocol::{Conflict, SyncAck, SyncChange, SyncOperation, SyncRequest, SyncResponse, SyncState};
pub use resolver::{ConflictResolutionStrategy, LastWriteWins, ManualResolution, VersionedValue};
pub use vector_clock::{ClockOrder, NodeId, VectorClock};

use thiserror::Error;

use crate::db::StoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid table name: {0}")]
    InvalidTable(String),

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Unknown column '{column}' in table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("Invalid change: {0}")]
    InvalidChange(String),

    #[error("Peer reported failure: {0}")]
    PeerFailure(String),
}
