// AOS kernel - offline-first node runtime

pub mod bus;
pub mod config;
pub mod db;
pub mod identity;
pub mod mesh;
pub mod runtime;
pub mod sync;

pub use bus::{Event, EventDispatcher, EventHandler, EventScheduler, EventStore};
pub use config::NodeConfig;
pub use identity::NodeIdentity;
pub use runtime::{NodeRuntime, RuntimeError};
pub use sync::{SyncEngine, VectorClock};
