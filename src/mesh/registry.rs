//! Durable registry of known peers
//!
//! Peers live in the `mesh_peers` table next to the mesh queue and are
//! loaded into an in-memory map at open. Every write goes to the table first
//! and then to the map, under the same lock.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::db::{epoch_now, open_connection};

use super::{MeshError, PeerStatus, RemoteNode};

struct RegistryInner {
    conn: Connection,
    peers: HashMap<String, RemoteNode>,
}

pub struct PeerRegistry {
    inner: Mutex<RegistryInner>,
}

impl PeerRegistry {
    /// Open the registry at `path` and load every stored peer.
    pub fn open(path: &Path) -> Result<Self, MeshError> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS mesh_peers (
                node_id TEXT PRIMARY KEY,
                base_url TEXT NOT NULL,
                public_key TEXT NOT NULL DEFAULT '',
                last_seen REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'OFFLINE'
            );",
        )?;

        let rows = {
            let mut stmt = conn.prepare(
                "SELECT node_id, base_url, public_key, last_seen, status FROM mesh_peers",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut peers = HashMap::new();
        for (node_id, base_url, public_key, last_seen, status) in rows {
            let status = PeerStatus::parse(&status).unwrap_or(PeerStatus::Offline);
            peers.insert(
                node_id.clone(),
                RemoteNode {
                    node_id,
                    base_url,
                    public_key,
                    last_seen,
                    status,
                },
            );
        }

        log::debug!("Loaded {} mesh peers", peers.len());
        Ok(Self {
            inner: Mutex::new(RegistryInner { conn, peers }),
        })
    }

    /// Add a peer. Returns false (and changes nothing) if it is already known.
    pub async fn register(
        &self,
        node_id: &str,
        base_url: &str,
        public_key: &str,
    ) -> Result<bool, MeshError> {
        let mut inner = self.inner.lock().await;
        if inner.peers.contains_key(node_id) {
            return Ok(false);
        }

        let base_url = base_url.trim_end_matches('/');
        inner.conn.execute(
            "INSERT OR IGNORE INTO mesh_peers (node_id, base_url, public_key, last_seen, status)
             VALUES (?1, ?2, ?3, 0, 'OFFLINE')",
            params![node_id, base_url, public_key],
        )?;
        inner.peers.insert(
            node_id.to_string(),
            RemoteNode {
                node_id: node_id.to_string(),
                base_url: base_url.to_string(),
                public_key: public_key.to_string(),
                last_seen: 0.0,
                status: PeerStatus::Offline,
            },
        );

        log::info!("Registered mesh peer {} at {}", node_id, base_url);
        Ok(true)
    }

    pub async fn get(&self, node_id: &str) -> Option<RemoteNode> {
        self.inner.lock().await.peers.get(node_id).cloned()
    }

    /// All peers, ordered by node id.
    pub async fn list(&self) -> Vec<RemoteNode> {
        let inner = self.inner.lock().await;
        let mut peers: Vec<RemoteNode> = inner.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.list().await.into_iter().map(|p| p.node_id).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Record a heartbeat outcome. `last_seen` is only moved when given.
    pub async fn update_status(
        &self,
        node_id: &str,
        status: PeerStatus,
        last_seen: Option<f64>,
    ) -> Result<(), MeshError> {
        let mut inner = self.inner.lock().await;
        let RegistryInner { conn, peers } = &mut *inner;
        let peer = peers
            .get_mut(node_id)
            .ok_or_else(|| MeshError::UnknownPeer(node_id.to_string()))?;

        let last_seen = last_seen.unwrap_or(peer.last_seen);
        conn.execute(
            "UPDATE mesh_peers SET status = ?1, last_seen = ?2 WHERE node_id = ?3",
            params![status.as_str(), last_seen, node_id],
        )?;
        peer.status = status;
        peer.last_seen = last_seen;
        Ok(())
    }

    /// Mark inbound contact from a peer. Unknown peers are ignored.
    pub async fn touch(&self, node_id: &str) -> Result<bool, MeshError> {
        let mut inner = self.inner.lock().await;
        let RegistryInner { conn, peers } = &mut *inner;
        let Some(peer) = peers.get_mut(node_id) else {
            return Ok(false);
        };

        let now = epoch_now();
        conn.execute(
            "UPDATE mesh_peers SET last_seen = ?1 WHERE node_id = ?2",
            params![now, node_id],
        )?;
        peer.last_seen = now;
        Ok(true)
    }

    /// Set a peer's public key (first-use pinning).
    pub async fn pin_public_key(&self, node_id: &str, public_key: &str) -> Result<(), MeshError> {
        let mut inner = self.inner.lock().await;
        let RegistryInner { conn, peers } = &mut *inner;
        let peer = peers
            .get_mut(node_id)
            .ok_or_else(|| MeshError::UnknownPeer(node_id.to_string()))?;

        conn.execute(
            "UPDATE mesh_peers SET public_key = ?1 WHERE node_id = ?2",
            params![public_key, node_id],
        )?;
        peer.public_key = public_key.to_string();

        log::info!("Pinned public key for mesh peer {}", node_id);
        Ok(())
    }
}
