//! Causal ordering via vector clocks
//!
//! A VectorClock maps each node to the number of local writes it has made
//! that this replica knows about. Comparing two clocks tells whether one
//! write causally preceded another or whether they were made concurrently
//! (neither node knew about the other's write).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier for a node/replica.
pub type NodeId = String;

/// Relation between two clocks. Exactly one holds for any pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockOrder {
    Before,
    After,
    Equal,
    Concurrent,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    clocks: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    /// Create an empty clock (knows nothing).
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a node (0 if never seen).
    pub fn get(&self, node_id: &str) -> u64 {
        self.clocks.get(node_id).copied().unwrap_or(0)
    }

    /// Record one more local write by `node_id`.
    pub fn increment(&mut self, node_id: &str) {
        *self.clocks.entry(node_id.to_string()).or_insert(0) += 1;
    }

    /// Merge another clock into this one (pointwise max).
    pub fn update(&mut self, other: &VectorClock) {
        for (node, count) in &other.clocks {
            let current = self.clocks.entry(node.clone()).or_insert(0);
            if *count > *current {
                *current = *count;
            }
        }
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrder {
        let mut less = false;
        let mut greater = false;

        for node in self.clocks.keys().chain(other.clocks.keys()) {
            let (mine, theirs) = (self.get(node), other.get(node));
            if mine < theirs {
                less = true;
            } else if mine > theirs {
                greater = true;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrder::Equal,
            (true, false) => ClockOrder::Before,
            (false, true) => ClockOrder::After,
            (true, true) => ClockOrder::Concurrent,
        }
    }

    /// True iff every counter is <= the other's and at least one is strictly less.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrder::Before
    }

    /// True iff neither clock happens before the other and they differ.
    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrder::Concurrent
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.clocks.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
