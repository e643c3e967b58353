//! Pluggable conflict resolution
//!
//! A strategy sees both full row snapshots with the write time and origin of
//! each, plus both clocks, and either picks the value to keep or returns
//! `None` to leave the conflict for an operator.

use serde_json::{Map, Value};

use super::vector_clock::VectorClock;

/// One side of a conflicting write.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedValue<'a> {
    pub data: &'a Map<String, Value>,
    /// `updated_at` of the row, fractional Unix seconds.
    pub timestamp: f64,
    /// Node that made the write.
    pub node_id: &'a str,
}

pub trait ConflictResolutionStrategy: Send + Sync {
    fn resolve(
        &self,
        local: &VersionedValue<'_>,
        remote: &VersionedValue<'_>,
        local_clock: &VectorClock,
        remote_clock: &VectorClock,
    ) -> Option<Map<String, Value>>;

    fn name(&self) -> &'static str;
}

/// Keep the value written last; equal timestamps go to the greater node id.
///
/// The winner depends only on the two candidates, not on which side is
/// local, so two nodes resolving the same pair converge.
#[derive(Clone, Copy, Debug, Default)]
pub struct LastWriteWins;

impl ConflictResolutionStrategy for LastWriteWins {
    fn resolve(
        &self,
        local: &VersionedValue<'_>,
        remote: &VersionedValue<'_>,
        _local_clock: &VectorClock,
        _remote_clock: &VectorClock,
    ) -> Option<Map<String, Value>> {
        let winner = if local.timestamp > remote.timestamp {
            local
        } else if remote.timestamp > local.timestamp {
            remote
        } else if local.node_id > remote.node_id {
            local
        } else {
            remote
        };
        Some(winner.data.clone())
    }

    fn name(&self) -> &'static str {
        "last_write_wins"
    }
}

/// Never decide; every conflict is persisted for operator review.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManualResolution;

impl ConflictResolutionStrategy for ManualResolution {
    fn resolve(
        &self,
        _local: &VersionedValue<'_>,
        _remote: &VersionedValue<'_>,
        _local_clock: &VectorClock,
        _remote_clock: &VectorClock,
    ) -> Option<Map<String, Value>> {
        None
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}
