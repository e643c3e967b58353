//! Signed HTTP client for talking to peer nodes
//!
//! Every outbound request carries an Ed25519 signature from this node's
//! identity. Delivery failures never surface as errors: a heartbeat that
//! does not get a 200 simply marks the peer OFFLINE, and a delta that is not
//! accepted returns false so the caller can retry later.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

use crate::db::epoch_now;
use crate::identity::NodeIdentity;

use super::protocol::{
    format_timestamp, DeltaRequest, HeartbeatRequest, SignatureScheme, SyncEnvelope,
};
use super::registry::PeerRegistry;
use super::{MeshError, PeerStatus};

pub struct RemoteNodeAdapter {
    node_id: String,
    identity: Arc<NodeIdentity>,
    registry: Arc<PeerRegistry>,
    scheme: SignatureScheme,
    client: reqwest::Client,
    connected: AtomicBool,
}

impl RemoteNodeAdapter {
    /// Fixed per-request timeout so one unreachable peer cannot stall a sync cycle.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(
        node_id: impl Into<String>,
        identity: Arc<NodeIdentity>,
        registry: Arc<PeerRegistry>,
        scheme: SignatureScheme,
    ) -> Result<Self, MeshError> {
        let client = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MeshError::Http(e.to_string()))?;

        Ok(Self {
            node_id: node_id.into(),
            identity,
            registry,
            scheme,
            client,
            connected: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub async fn connect(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            log::info!("Mesh adapter connected as {}", self.node_id);
        }
    }

    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            log::info!("Mesh adapter disconnected");
        }
    }

    pub async fn health_check(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Add a peer to the registry. Known peers are left as they are.
    pub async fn register_peer(
        &self,
        node_id: &str,
        base_url: &str,
        public_key: &str,
    ) -> Result<bool, MeshError> {
        self.registry.register(node_id, base_url, public_key).await
    }

    /// Send a signed heartbeat and record the outcome on the peer.
    ///
    /// Returns true only on a 200 response. Unknown peers return false.
    pub async fn send_heartbeat(&self, peer_id: &str) -> bool {
        let Some(peer) = self.registry.get(peer_id).await else {
            return false;
        };

        let timestamp = format_timestamp(epoch_now());
        let request = HeartbeatRequest {
            node_id: self.node_id.clone(),
            signature: self.identity.sign_hex(timestamp.as_bytes()),
            public_key: self.identity.public_key_hex(),
            timestamp,
        };

        let result = self
            .client
            .post(format!("{}/mesh/heartbeat", peer.base_url))
            .json(&request)
            .send()
            .await;

        let online = match result {
            Ok(response) if response.status() == StatusCode::OK => true,
            Ok(response) => {
                log::warn!("Heartbeat to {} rejected: {}", peer_id, response.status());
                false
            }
            Err(e) => {
                log::warn!("Heartbeat to {} failed: {}", peer_id, e);
                false
            }
        };

        let update = if online {
            self.registry
                .update_status(peer_id, PeerStatus::Online, Some(epoch_now()))
                .await
        } else {
            self.registry
                .update_status(peer_id, PeerStatus::Offline, None)
                .await
        };
        if let Err(e) = update {
            log::error!("Failed to record heartbeat result for {}: {}", peer_id, e);
        }

        online
    }

    /// Send one signed delta to a peer. True iff the peer accepted it.
    pub async fn send_delta(&self, peer_id: &str, event_type: &str, payload: &serde_json::Value) -> bool {
        let Some(peer) = self.registry.get(peer_id).await else {
            log::warn!("Dropping delta for unknown peer {}", peer_id);
            return false;
        };

        let envelope = SyncEnvelope {
            origin_id: self.node_id.clone(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
            timestamp: epoch_now(),
        };
        let request = DeltaRequest {
            signature: self.identity.sign_hex(&self.scheme.signing_bytes(&envelope)),
            envelope,
        };

        match self
            .client
            .post(format!("{}/mesh/sync", peer.base_url))
            .json(&request)
            .send()
            .await
        {
            Ok(response) if response.status() == StatusCode::OK => true,
            Ok(response) => {
                log::warn!("Delta {} to {} rejected: {}", event_type, peer_id, response.status());
                false
            }
            Err(e) => {
                log::warn!("Delta {} to {} failed: {}", event_type, peer_id, e);
                false
            }
        }
    }

    /// Send a delta to every known peer. Returns the ids that accepted it.
    pub async fn broadcast_event(&self, event_type: &str, payload: &serde_json::Value) -> Vec<String> {
        let mut accepted = Vec::new();
        for peer_id in self.registry.peer_ids().await {
            if self.send_delta(&peer_id, event_type, payload).await {
                accepted.push(peer_id);
            }
        }
        accepted
    }
}
