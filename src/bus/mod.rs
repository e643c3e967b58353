//! Durable event kernel: events, the persistent queue, fan-out and timers

pub mod dispatcher;
pub mod event;
pub mod event_store;
pub mod scheduler;

pub use dispatcher::{handler_fn, DeliveryReport, EventDispatcher, EventHandler, SharedHandler};
pub use event::Event;
pub use event_store::{EventStatus, EventStore, StoredEvent};
pub use scheduler::{EventScheduler, ScheduledTask, SchedulerStats};
