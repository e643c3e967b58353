//! Inbound mesh endpoints
//!
//! - `POST /mesh/heartbeat`: proves the sender holds the key it presents.
//!   For a registered peer that key must match the pinned one; a peer
//!   registered without a key gets the first key it presents pinned.
//! - `POST /mesh/sync`: verifies the envelope against the origin's pinned key
//!   and dispatches the payload locally as an event from that origin.
//!
//! Any signature failure, or a signed timestamp further than `max_clock_skew`
//! from local time, answers 401 and leaves all state untouched.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::bus::{Event, EventDispatcher};
use crate::db::epoch_now;
use crate::identity::NodeIdentity;

use super::protocol::{
    DeltaRequest, DeltaResponse, ErrorResponse, HeartbeatRequest, HeartbeatResponse,
    SignatureScheme,
};
use super::registry::PeerRegistry;
use super::MeshError;

/// Largest accepted request body.
const MAX_BODY_BYTES: u64 = 1024 * 1024;

pub struct MeshServerState {
    pub registry: Arc<PeerRegistry>,
    pub dispatcher: Arc<EventDispatcher>,
    pub scheme: SignatureScheme,
    pub max_clock_skew: Duration,
}

impl MeshServerState {
    fn is_fresh(&self, timestamp: f64) -> bool {
        timestamp.is_finite()
            && (epoch_now() - timestamp).abs() <= self.max_clock_skew.as_secs_f64()
    }
}

/// Build the mesh routes over shared state.
pub fn routes(
    state: Arc<MeshServerState>,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let heartbeat = warp::path!("mesh" / "heartbeat")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_state(Arc::clone(&state)))
        .and_then(handle_heartbeat);

    let sync = warp::path!("mesh" / "sync")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(handle_sync);

    heartbeat.or(sync)
}

fn with_state(
    state: Arc<MeshServerState>,
) -> impl Filter<Extract = (Arc<MeshServerState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || Arc::clone(&state))
}

fn reply_json<T: Serialize>(body: &T, status: StatusCode) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

fn unauthorized(detail: &str) -> warp::reply::Response {
    reply_json(
        &ErrorResponse {
            detail: detail.to_string(),
        },
        StatusCode::UNAUTHORIZED,
    )
}

fn internal_error(error: impl std::fmt::Display) -> warp::reply::Response {
    log::error!("Mesh endpoint failed: {}", error);
    reply_json(
        &ErrorResponse {
            detail: "Internal error".to_string(),
        },
        StatusCode::INTERNAL_SERVER_ERROR,
    )
}

async fn handle_heartbeat(
    request: HeartbeatRequest,
    state: Arc<MeshServerState>,
) -> Result<warp::reply::Response, warp::Rejection> {
    if !NodeIdentity::verify_hex(
        request.timestamp.as_bytes(),
        &request.signature,
        &request.public_key,
    ) {
        log::warn!("Rejected heartbeat from {}: invalid signature", request.node_id);
        return Ok(unauthorized("Invalid node signature"));
    }

    let fresh = request
        .timestamp
        .parse::<f64>()
        .map(|ts| state.is_fresh(ts))
        .unwrap_or(false);
    if !fresh {
        log::warn!("Rejected heartbeat from {}: stale timestamp", request.node_id);
        return Ok(unauthorized("Stale or malformed timestamp"));
    }

    if let Some(peer) = state.registry.get(&request.node_id).await {
        if peer.public_key.is_empty() {
            let key = request.public_key.to_ascii_lowercase();
            if let Err(e) = state.registry.pin_public_key(&request.node_id, &key).await {
                return Ok(internal_error(e));
            }
        } else if !peer.public_key.eq_ignore_ascii_case(&request.public_key) {
            log::warn!(
                "Rejected heartbeat from {}: key differs from pinned key",
                request.node_id
            );
            return Ok(unauthorized("Public key does not match registered peer"));
        }

        if let Err(e) = state.registry.touch(&request.node_id).await {
            return Ok(internal_error(e));
        }
    }

    Ok(reply_json(
        &HeartbeatResponse {
            status: "ok".to_string(),
            message: format!("Heartbeat verified from {}", request.node_id),
        },
        StatusCode::OK,
    ))
}

async fn handle_sync(
    request: DeltaRequest,
    state: Arc<MeshServerState>,
) -> Result<warp::reply::Response, warp::Rejection> {
    let envelope = &request.envelope;

    let Some(peer) = state.registry.get(&envelope.origin_id).await else {
        log::warn!("Rejected delta from unknown node {}", envelope.origin_id);
        return Ok(unauthorized("Unknown origin node"));
    };
    if peer.public_key.is_empty() {
        return Ok(unauthorized("No public key pinned for origin node"));
    }

    let signed = state.scheme.signing_bytes(envelope);
    if !NodeIdentity::verify_hex(&signed, &request.signature, &peer.public_key) {
        log::warn!("Rejected delta from {}: invalid signature", envelope.origin_id);
        return Ok(unauthorized("Invalid envelope signature"));
    }

    if !state.is_fresh(envelope.timestamp) {
        log::warn!("Rejected delta from {}: stale timestamp", envelope.origin_id);
        return Ok(unauthorized("Stale envelope timestamp"));
    }

    let event = Event::new(envelope.event_type.clone(), envelope.payload.clone())
        .with_source_node(envelope.origin_id.clone());
    if let Err(e) = state.dispatcher.dispatch(event).await {
        return Ok(internal_error(e));
    }
    if let Err(e) = state.registry.touch(&envelope.origin_id).await {
        log::warn!("Failed to update last_seen for {}: {}", envelope.origin_id, e);
    }

    log::debug!(
        "Accepted delta {} from {}",
        envelope.event_type,
        envelope.origin_id
    );
    Ok(reply_json(
        &DeltaResponse {
            status: "accepted".to_string(),
            origin: envelope.origin_id.clone(),
        },
        StatusCode::OK,
    ))
}

/// Owns the running HTTP listener for the mesh routes.
pub struct MeshServer {
    state: Arc<MeshServerState>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MeshServer {
    pub fn new(state: MeshServerState) -> Self {
        Self {
            state: Arc::new(state),
            shutdown_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<MeshServerState> {
        &self.state
    }

    /// Bind `addr` and serve in the background. Returns the bound address
    /// (useful with port 0).
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr, MeshError> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Err(MeshError::Server("mesh server already running".to_string()));
        }

        let (tx, rx) = oneshot::channel::<()>();
        let (bound, server) = warp::serve(routes(Arc::clone(&self.state)))
            .try_bind_with_graceful_shutdown(addr, async move {
                let _ = rx.await;
            })
            .map_err(|e| MeshError::Server(e.to_string()))?;

        *handle = Some(tokio::spawn(server));
        *self.shutdown_tx.lock().await = Some(tx);

        log::info!("Mesh server listening on {}", bound);
        Ok(bound)
    }

    /// Stop accepting connections and wait for in-flight requests. Safe if never started.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("Mesh server ended abnormally: {}", e);
            }
            log::info!("Mesh server stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler_fn;
    use crate::mesh::protocol::{format_timestamp, SyncEnvelope};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        _dir: tempfile::TempDir,
        state: Arc<MeshServerState>,
        received: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(PeerRegistry::open(&dir.path().join("mesh.db")).unwrap());
        let dispatcher = Arc::new(EventDispatcher::new());
        let received = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&received);
        dispatcher.subscribe(
            "stock.updated",
            handler_fn(move |event| {
                let seen = Arc::clone(&seen);
                async move {
                    assert_eq!(event.source_node(), Some("node-a"));
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        Fixture {
            _dir: dir,
            state: Arc::new(MeshServerState {
                registry,
                dispatcher,
                scheme: SignatureScheme::EnvelopeDigest,
                max_clock_skew: Duration::from_secs(300),
            }),
            received,
        }
    }

    fn heartbeat(identity: &NodeIdentity) -> HeartbeatRequest {
        heartbeat_at(identity, epoch_now())
    }

    fn heartbeat_at(identity: &NodeIdentity, at: f64) -> HeartbeatRequest {
        let timestamp = format_timestamp(at);
        HeartbeatRequest {
            node_id: "node-a".into(),
            signature: identity.sign_hex(timestamp.as_bytes()),
            public_key: identity.public_key_hex(),
            timestamp,
        }
    }

    fn delta(identity: &NodeIdentity, payload: serde_json::Value) -> DeltaRequest {
        delta_at(identity, payload, epoch_now())
    }

    fn delta_at(identity: &NodeIdentity, payload: serde_json::Value, at: f64) -> DeltaRequest {
        let envelope = SyncEnvelope {
            origin_id: "node-a".into(),
            event_type: "stock.updated".into(),
            payload,
            timestamp: at,
        };
        DeltaRequest {
            signature: identity.sign_hex(&SignatureScheme::EnvelopeDigest.signing_bytes(&envelope)),
            envelope,
        }
    }

    #[tokio::test]
    async fn test_heartbeat_pins_key_on_first_use() {
        let fx = fixture();
        let identity = NodeIdentity::generate();
        fx.state.registry.register("node-a", "http://a", "").await.unwrap();

        let resp = warp::test::request()
            .method("POST")
            .path("/mesh/heartbeat")
            .json(&heartbeat(&identity))
            .reply(&routes(Arc::clone(&fx.state)))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let peer = fx.state.registry.get("node-a").await.unwrap();
        assert_eq!(peer.public_key, identity.public_key_hex());
        assert!(peer.last_seen > 0.0);

        // A different key for the same node id is now refused
        let impostor = NodeIdentity::generate();
        let resp = warp::test::request()
            .method("POST")
            .path("/mesh/heartbeat")
            .json(&heartbeat(&impostor))
            .reply(&routes(Arc::clone(&fx.state)))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_heartbeat_with_bad_signature_is_rejected() {
        let fx = fixture();
        let identity = NodeIdentity::generate();
        let mut request = heartbeat(&identity);
        request.timestamp = "0".into();

        let resp = warp::test::request()
            .method("POST")
            .path("/mesh/heartbeat")
            .json(&request)
            .reply(&routes(Arc::clone(&fx.state)))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_signed_delta_is_dispatched() {
        let fx = fixture();
        let identity = NodeIdentity::generate();
        fx.state
            .registry
            .register("node-a", "http://a", &identity.public_key_hex())
            .await
            .unwrap();

        let resp = warp::test::request()
            .method("POST")
            .path("/mesh/sync")
            .json(&delta(&identity, json!({"sku": "A1", "qty": 4})))
            .reply(&routes(Arc::clone(&fx.state)))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: DeltaResponse = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body.status, "accepted");
        assert_eq!(body.origin, "node-a");

        for _ in 0..50 {
            if fx.received.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(fx.received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tampered_or_unknown_delta_is_rejected() {
        let fx = fixture();
        let identity = NodeIdentity::generate();

        // Unknown origin
        let resp = warp::test::request()
            .method("POST")
            .path("/mesh/sync")
            .json(&delta(&identity, json!({"qty": 1})))
            .reply(&routes(Arc::clone(&fx.state)))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        fx.state
            .registry
            .register("node-a", "http://a", &identity.public_key_hex())
            .await
            .unwrap();

        let mut tampered = delta(&identity, json!({"qty": 1}));
        tampered.envelope.payload = json!({"qty": 1000});
        let resp = warp::test::request()
            .method("POST")
            .path("/mesh/sync")
            .json(&tampered)
            .reply(&routes(Arc::clone(&fx.state)))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(fx.received.load(Ordering::SeqCst), 0);
        assert_eq!(fx.state.registry.get("node-a").await.unwrap().last_seen, 0.0);
    }

    #[tokio::test]
    async fn test_replayed_or_future_timestamps_are_rejected() {
        let fx = fixture();
        let identity = NodeIdentity::generate();
        fx.state
            .registry
            .register("node-a", "http://a", &identity.public_key_hex())
            .await
            .unwrap();

        let an_hour_ago = epoch_now() - 3600.0;
        let resp = warp::test::request()
            .method("POST")
            .path("/mesh/heartbeat")
            .json(&heartbeat_at(&identity, an_hour_ago))
            .reply(&routes(Arc::clone(&fx.state)))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        for at in [an_hour_ago, epoch_now() + 3600.0] {
            let resp = warp::test::request()
                .method("POST")
                .path("/mesh/sync")
                .json(&delta_at(&identity, json!({"qty": 1}), at))
                .reply(&routes(Arc::clone(&fx.state)))
                .await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        }

        // Within the window
        let resp = warp::test::request()
            .method("POST")
            .path("/mesh/sync")
            .json(&delta_at(&identity, json!({"qty": 1}), epoch_now() - 60.0))
            .reply(&routes(Arc::clone(&fx.state)))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        for _ in 0..50 {
            if fx.received.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(fx.received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_binds_and_stops() {
        let fx = fixture();
        let server = MeshServer::new(MeshServerState {
            registry: Arc::clone(&fx.state.registry),
            dispatcher: Arc::clone(&fx.state.dispatcher),
            scheme: SignatureScheme::EnvelopeDigest,
            max_clock_skew: Duration::from_secs(300),
        });

        let addr = server.start(([127, 0, 0, 1], 0).into()).await.unwrap();
        assert_ne!(addr.port(), 0);
        server.stop().await;
        server.stop().await;
    }
}
