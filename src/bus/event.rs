//! Immutable kernel events
//!
//! An `Event` is created once by a producer and then only read. Fields are
//! private so nothing downstream can rewrite a payload in flight; the store
//! rebuilds events from rows through `Event::restore`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    name: String,
    payload: serde_json::Value,
    id: String,
    correlation_id: Option<String>,
    timestamp: DateTime<Utc>,
    source_node: Option<String>,
}

impl Event {
    /// Create a new event with a fresh id and the current timestamp.
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            id: Uuid::new_v4().to_string(),
            correlation_id: None,
            timestamp: Utc::now(),
            source_node: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_source_node(mut self, source_node: impl Into<String>) -> Self {
        self.source_node = Some(source_node.into());
        self
    }

    /// Rebuild an event exactly as it was persisted.
    pub(crate) fn restore(
        id: String,
        name: String,
        payload: serde_json::Value,
        correlation_id: Option<String>,
        timestamp: DateTime<Utc>,
        source_node: Option<String>,
    ) -> Self {
        Self {
            name,
            payload,
            id,
            correlation_id,
            timestamp,
            source_node,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source_node(&self) -> Option<&str> {
        self.source_node.as_deref()
    }
}
