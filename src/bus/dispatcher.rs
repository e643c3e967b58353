//! In-process pub/sub fan-out
//!
//! Handlers implement one async trait and are registered per event name (or
//! for every event). Each handler runs in its own tokio task, so a slow,
//! failing or panicking handler never blocks or breaks its siblings, and
//! nothing a handler does is propagated back to the caller of `dispatch`.
//!
//! When an `EventStore` is attached the event is journaled before fan-out and
//! a supervisor task records the outcome: `completed` if every handler
//! succeeded, otherwise `failed` with the joined error messages.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::task::JoinHandle;

use crate::db::StoreError;

use super::event::Event;
use super::event_store::EventStore;

/// A subscriber to kernel events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

pub type SharedHandler = Arc<dyn EventHandler>;

/// Adapter turning an async closure into an `EventHandler`.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Outcome of delivering one event to its handlers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

fn same_handler(a: &SharedHandler, b: &SharedHandler) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

pub struct EventDispatcher {
    subscribers: RwLock<HashMap<String, Vec<SharedHandler>>>,
    global: RwLock<Vec<SharedHandler>>,
    store: Option<Arc<EventStore>>,
}

impl EventDispatcher {
    /// A dispatcher without journaling: delivery is at-most-once.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            global: RwLock::new(Vec::new()),
            store: None,
        }
    }

    /// A dispatcher that persists every event before fan-out.
    pub fn with_store(store: Arc<EventStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    pub fn store(&self) -> Option<&Arc<EventStore>> {
        self.store.as_ref()
    }

    /// Register a handler for `event_name`. Registering the same handler twice is a no-op.
    pub fn subscribe(&self, event_name: &str, handler: SharedHandler) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let handlers = subscribers.entry(event_name.to_string()).or_default();

        if !handlers.iter().any(|h| same_handler(h, &handler)) {
            handlers.push(handler);
            log::debug!("Subscribed handler to {}", event_name);
        }
    }

    /// Register a handler that receives every event (logging, streaming).
    pub fn subscribe_all(&self, handler: SharedHandler) {
        let mut global = self
            .global
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !global.iter().any(|h| same_handler(h, &handler)) {
            global.push(handler);
            log::debug!("Subscribed global handler");
        }
    }

    /// Number of handlers that would receive an event named `event_name`.
    pub fn handler_count(&self, event_name: &str) -> usize {
        self.handlers_for(event_name).len()
    }

    /// Persist (if journaling) and fan out an event.
    ///
    /// Returns once the event is durable and the handlers are scheduled; it
    /// does not wait for them. Only persistence failures are returned.
    pub async fn dispatch(&self, event: Event) -> Result<(), StoreError> {
        self.journal_and_deliver(event).await.map(|_| ())
    }

    /// Like `dispatch`, but waits until every handler has finished.
    pub async fn dispatch_and_wait(&self, event: Event) -> Result<DeliveryReport, StoreError> {
        match self.journal_and_deliver(event).await? {
            Some(handle) => Ok(handle.await.unwrap_or_default()),
            None => Ok(DeliveryReport::default()),
        }
    }

    /// Replay journaled events that never reached a terminal state.
    ///
    /// Events are re-delivered without being enqueued again. Returns the
    /// number of events replayed.
    pub async fn recover_pending_events(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let pending = store.get_pending_events().await?;
        let count = pending.len();
        for event in pending {
            log::info!("Replaying interrupted event {} ({})", event.id(), event.name());
            self.deliver(event).await?;
        }

        Ok(count)
    }

    async fn journal_and_deliver(
        &self,
        event: Event,
    ) -> Result<Option<JoinHandle<DeliveryReport>>, StoreError> {
        if let Some(store) = &self.store {
            store.enqueue(&event).await?;
        }
        self.deliver(event).await
    }

    async fn deliver(&self, event: Event) -> Result<Option<JoinHandle<DeliveryReport>>, StoreError> {
        let handlers = self.handlers_for(event.name());

        if handlers.is_empty() {
            if let Some(store) = &self.store {
                store.mark_completed(event.id()).await?;
            }
            return Ok(None);
        }

        let store = self.store.clone();
        Ok(Some(tokio::spawn(supervise(store, handlers, event))))
    }

    fn handlers_for(&self, event_name: &str) -> Vec<SharedHandler> {
        let mut handlers = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(event_name)
            .cloned()
            .unwrap_or_default();

        handlers.extend(
            self.global
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .iter()
                .cloned(),
        );
        handlers
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Run every handler in its own task and record the combined outcome.
async fn supervise(
    store: Option<Arc<EventStore>>,
    handlers: Vec<SharedHandler>,
    event: Event,
) -> DeliveryReport {
    if let Some(store) = &store {
        if let Err(e) = store.mark_processing(event.id()).await {
            log::error!("Failed to claim event {}: {}", event.id(), e);
        }
    }

    let tasks = handlers.into_iter().map(|handler| {
        let event = event.clone();
        tokio::spawn(async move { handler.handle(&event).await })
    });

    let mut errors = Vec::new();
    let mut report = DeliveryReport::default();
    for result in join_all(tasks).await {
        match result {
            Ok(Ok(())) => report.delivered += 1,
            Ok(Err(e)) => {
                log::error!("Error in handler for {}: {:#}", event.name(), e);
                errors.push(e.to_string());
            }
            Err(join_error) => {
                log::error!("Handler for {} panicked: {}", event.name(), join_error);
                errors.push(format!("handler panicked: {}", join_error));
            }
        }
    }
    report.failed = errors.len();

    if let Some(store) = &store {
        let outcome = if errors.is_empty() {
            store.mark_completed(event.id()).await
        } else {
            store.mark_failed(event.id(), &errors.join("; ")).await
        };
        if let Err(e) = outcome {
            log::error!("Failed to record outcome of event {}: {}", event.id(), e);
        }
    }

    report
}
