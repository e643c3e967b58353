//! NodeRuntime: one node's kernel, built once from a `NodeConfig`
//!
//! Owns every subsystem and their background loops. Nothing is global: two
//! runtimes in one process are two independent nodes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::bus::{handler_fn, Event, EventDispatcher, EventScheduler, EventStore};
use crate::config::{ConfigError, NodeConfig};
use crate::db::StoreError;
use crate::identity::{IdentityError, NodeIdentity};
use crate::mesh::{
    MeshError, MeshQueue, MeshServer, MeshServerState, MeshSyncManager, PeerRegistry,
    RemoteNodeAdapter,
};
use crate::sync::{SyncEngine, SyncError};

/// Periodic housekeeping: event TTL cleanup and mesh queue pruning.
pub const MAINTENANCE_EVENT: &str = "kernel.maintenance";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

pub struct NodeRuntime {
    config: NodeConfig,
    identity: Arc<NodeIdentity>,
    store: Arc<EventStore>,
    dispatcher: Arc<EventDispatcher>,
    scheduler: Arc<EventScheduler>,
    mesh: Arc<MeshSyncManager>,
    server: MeshServer,
    sync: Arc<SyncEngine>,
    booted: AtomicBool,
    mesh_addr: Mutex<Option<SocketAddr>>,
}

impl NodeRuntime {
    /// Build every subsystem. Nothing runs until `boot`.
    pub fn open(config: NodeConfig) -> Result<Self, RuntimeError> {
        let db_path = config.database_path();
        let identity = Arc::new(NodeIdentity::ensure_identity(&config.keys_path())?);

        let store = Arc::new(EventStore::open(&db_path, config.event_ttl())?);
        let dispatcher = Arc::new(EventDispatcher::with_store(Arc::clone(&store)));
        let scheduler = Arc::new(EventScheduler::open(
            &db_path,
            Arc::clone(&dispatcher),
            config.poll_interval(),
        )?);

        let registry = Arc::new(PeerRegistry::open(&db_path)?);
        let queue = Arc::new(MeshQueue::open(&db_path)?);
        let adapter = Arc::new(RemoteNodeAdapter::new(
            config.node_id.clone(),
            Arc::clone(&identity),
            Arc::clone(&registry),
            config.mesh.signature_scheme,
        )?);
        let mesh = Arc::new(MeshSyncManager::new(
            adapter,
            queue,
            config.sync_interval(),
            config.mesh.retry_policy(),
        ));
        let server = MeshServer::new(MeshServerState {
            registry,
            dispatcher: Arc::clone(&dispatcher),
            scheme: config.mesh.signature_scheme,
            max_clock_skew: config.mesh.max_clock_skew(),
        });

        let sync = Arc::new(SyncEngine::open(
            &db_path,
            config.node_id.clone(),
            config.sync.tables.clone(),
            config.sync.strategy.build(),
        )?);

        log::info!(
            "Node {} opened (db {}, key {})",
            config.node_id,
            db_path.display(),
            identity.public_key_hex()
        );

        let runtime = Self {
            config,
            identity,
            store,
            dispatcher,
            scheduler,
            mesh,
            server,
            sync,
            booted: AtomicBool::new(false),
            mesh_addr: Mutex::new(None),
        };
        runtime.register_maintenance();
        Ok(runtime)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn identity(&self) -> &Arc<NodeIdentity> {
        &self.identity
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<EventScheduler> {
        &self.scheduler
    }

    pub fn mesh(&self) -> &Arc<MeshSyncManager> {
        &self.mesh
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    /// Address the mesh server is bound to, once booted.
    pub async fn mesh_addr(&self) -> Option<SocketAddr> {
        *self.mesh_addr.lock().await
    }

    /// Bring the node up.
    ///
    /// Application handlers should be subscribed before calling this so that
    /// replayed events reach them. A second call is a no-op.
    pub async fn boot(&self) -> Result<SocketAddr, RuntimeError> {
        if self.booted.swap(true, Ordering::SeqCst) {
            if let Some(addr) = self.mesh_addr().await {
                return Ok(addr);
            }
        }

        let replayed = self.dispatcher.recover_pending_events().await?;
        if replayed > 0 {
            log::info!("Replayed {} interrupted events", replayed);
        }

        if !self.scheduler.has_task_for(MAINTENANCE_EVENT).await? {
            self.scheduler
                .schedule_recurring(
                    self.config.maintenance_interval(),
                    &Event::new(MAINTENANCE_EVENT, serde_json::json!({})),
                )
                .await?;
        }

        for peer in &self.config.mesh.peers {
            self.mesh
                .adapter()
                .register_peer(&peer.node_id, &peer.base_url, &peer.public_key)
                .await?;
        }

        self.scheduler.start().await;
        self.mesh.start().await;
        let addr = self.server.start(self.config.mesh.listen).await?;
        *self.mesh_addr.lock().await = Some(addr);

        log::info!("Node {} booted", self.config.node_id);
        Ok(addr)
    }

    /// Stop every background loop, newest first, waiting for each.
    pub async fn shutdown(&self) {
        self.server.stop().await;
        self.mesh.stop().await;
        self.scheduler.stop().await;
        *self.mesh_addr.lock().await = None;
        self.booted.store(false, Ordering::SeqCst);
        log::info!("Node {} shut down", self.config.node_id);
    }

    /// Queue `payload` for delivery to every known peer.
    pub async fn broadcast(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<Vec<i64>, RuntimeError> {
        Ok(self
            .mesh
            .enqueue_broadcast(event_type, payload, MeshQueue::DEFAULT_PRIORITY)
            .await?)
    }

    fn register_maintenance(&self) {
        let store = Arc::clone(&self.store);
        let queue = Arc::clone(self.mesh.queue());
        let max_age_days = self.config.mesh.prune_max_age_days;

        self.dispatcher.subscribe(
            MAINTENANCE_EVENT,
            handler_fn(move |_event| {
                let store = Arc::clone(&store);
                let queue = Arc::clone(&queue);
                async move {
                    let expired = store.cleanup_old_events().await?;
                    let pruned = queue.prune_old_events(max_age_days).await?;
                    log::info!(
                        "Maintenance: removed {} expired events, pruned {} queued deltas",
                        expired,
                        pruned
                    );
                    Ok::<(), anyhow::Error>(())
                }
            }),
        );
    }
}
