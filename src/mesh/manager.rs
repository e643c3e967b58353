//! MeshSyncManager: heartbeat and queue-drain loop
//!
//! Every `sync_interval` the manager heartbeats each known peer, then drains
//! the outbound queue through the adapter. Nothing inside a cycle can stop
//! the loop: per-peer and per-item failures are logged and retried later.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use crate::db::epoch_now;

use super::adapter::RemoteNodeAdapter;
use super::queue::{MeshQueue, MeshQueueItem};
use super::MeshError;

/// When a failed queue item may be retried.
///
/// The n-th retry waits `base_backoff * 2^(n-1)`, capped at `max_backoff`.
/// Items that reached `max_attempts` are left in the queue untouched until
/// age-based pruning removes them.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempts - 1);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Whether `item` should be sent in a cycle running at `now`.
    pub fn is_due(&self, item: &MeshQueueItem, now: f64) -> bool {
        if item.attempts >= self.max_attempts {
            return false;
        }
        match item.last_attempt {
            Some(last) if item.attempts > 0 => {
                last + self.backoff_for(item.attempts).as_secs_f64() <= now
            }
            _ => true,
        }
    }
}

/// What one sync cycle did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncCycleReport {
    pub peers_online: usize,
    pub peers_offline: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Items still inside their backoff window.
    pub deferred: usize,
}

pub struct MeshSyncManager {
    adapter: Arc<RemoteNodeAdapter>,
    queue: Arc<MeshQueue>,
    sync_interval: Duration,
    retry: RetryPolicy,
    batch_size: usize,
    shutdown_tx: broadcast::Sender<()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MeshSyncManager {
    pub const DEFAULT_BATCH_SIZE: usize = 50;
    pub const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(10);

    /// `sync_interval` is raised to `MIN_SYNC_INTERVAL` if shorter.

    pub fn new(
        adapter: Arc<RemoteNodeAdapter>,
        queue: Arc<MeshQueue>,
        sync_interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            adapter,
            queue,
            sync_interval: sync_interval.max(Self::MIN_SYNC_INTERVAL),
            retry,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            shutdown_tx,
            loop_handle: Mutex::new(None),
        }
    }

    pub fn adapter(&self) -> &Arc<RemoteNodeAdapter> {
        &self.adapter
    }

    pub fn queue(&self) -> &Arc<MeshQueue> {
        &self.queue
    }

    pub fn sync_interval(&self) -> Duration {
        self.sync_interval
    }

    pub async fn is_running(&self) -> bool {
        self.loop_handle.lock().await.is_some()
    }

    /// Connect the adapter and spawn the background loop. No-op if running.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            return;
        }

        self.adapter.connect().await;

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut interval = time::interval(self.sync_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        *handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = manager.run_sync_cycle(epoch_now()).await {
                            log::error!("Error in background sync: {}", e);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }));

        log::info!(
            "MeshSyncManager started (interval {:?})",
            self.sync_interval
        );
    }

    /// Stop the loop, wait for it to finish and disconnect. Safe if never started.
    pub async fn stop(&self) {
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = self.shutdown_tx.send(());
            if let Err(e) = handle.await {
                log::warn!("Mesh sync loop ended abnormally: {}", e);
            }
        }
        self.adapter.disconnect().await;
        log::info!("MeshSyncManager stopped");
    }

    /// Heartbeat every peer, then try up to `batch_size` due queue items once.
    pub async fn run_sync_cycle(&self, now: f64) -> Result<SyncCycleReport, MeshError> {
        let mut report = SyncCycleReport::default();

        for peer_id in self.adapter.registry().peer_ids().await {
            if self.adapter.send_heartbeat(&peer_id).await {
                report.peers_online += 1;
            } else {
                report.peers_offline += 1;
            }
        }

        let (items, deferred) = self
            .queue
            .get_due(self.retry.max_attempts, self.batch_size, |item| {
                self.retry.is_due(item, now)
            })
            .await?;
        report.deferred = deferred;

        for item in items {
            let delivered = self
                .adapter
                .send_delta(&item.target_node_id, &item.event_type, &item.payload)
                .await;

            let recorded = if delivered {
                report.delivered += 1;
                self.queue.mark_success(item.id).await
            } else {
                report.failed += 1;
                self.queue.mark_failed(item.id).await
            };
            if let Err(e) = recorded {
                log::error!("Failed to update mesh queue item {}: {}", item.id, e);
            }
        }

        log::debug!("Mesh sync cycle: {:?}", report);
        Ok(report)
    }

    /// Queue a delta for every known peer. Returns the queued row ids.
    pub async fn enqueue_broadcast(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
        priority: i64,
    ) -> Result<Vec<i64>, MeshError> {
        let mut ids = Vec::new();
        for peer_id in self.adapter.registry().peer_ids().await {
            ids.push(self.queue.enqueue(&peer_id, event_type, payload, priority).await?);
        }
        Ok(ids)
    }

    /// Register a peer and heartbeat it in the background.
    pub async fn register_peer(
        &self,
        node_id: &str,
        base_url: &str,
        public_key: &str,
    ) -> Result<(), MeshError> {
        self.adapter.register_peer(node_id, base_url, public_key).await?;

        let adapter = Arc::clone(&self.adapter);
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            adapter.send_heartbeat(&node_id).await;
        });
        Ok(())
    }
}
