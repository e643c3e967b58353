//! Signed node-to-node mesh communication
//!
//! - `PeerRegistry`: durable table of known peers, cached in memory
//! - `MeshQueue`: durable store-and-forward queue of outbound deltas
//! - `RemoteNodeAdapter`: signed HTTP heartbeat and delta client
//! - `MeshSyncManager`: background loop that heartbeats peers and drains the queue
//! - `MeshServer`: inbound heartbeat and delta endpoints

pub mod adapter;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod server;

pub use adapter::RemoteNodeAdapter;
pub use manager::{MeshSyncManager, RetryPolicy, SyncCycleReport};
pub use protocol::{
    DeltaRequest, DeltaResponse, HeartbeatRequest, HeartbeatResponse, SignatureScheme,
    SyncEnvelope,
};
pub use queue::{MeshQueue, MeshQueueItem};
pub use registry::PeerRegistry;
pub use server::{MeshServer, MeshServerState};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::StoreError;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Server error: {0}")]
    Server(String),
}

/// Reachability of a peer as seen by our most recent heartbeat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeerStatus {
    Online,
    /// Reachable only through another node.
    Mesh,
    Offline,
}

impl PeerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Online => "ONLINE",
            PeerStatus::Mesh => "MESH",
            PeerStatus::Offline => "OFFLINE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ONLINE" => Some(PeerStatus::Online),
            "MESH" => Some(PeerStatus::Mesh),
            "OFFLINE" => Some(PeerStatus::Offline),
            _ => None,
        }
    }
}

/// A peer node in the mesh.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteNode {
    pub node_id: String,
    pub base_url: String,
    /// Hex-encoded Ed25519 public key; empty until pinned.
    pub public_key: String,
    /// Unix seconds of the last successful contact, 0 if never.
    pub last_seen: f64,
    pub status: PeerStatus,
}
