//! Shared data types for the backup coordinator.
//!
//! These are the values that flow between the round controller, per-node
//! workers and the fan-in collector: node descriptors from membership,
//! backup requests, streamed node results and retry signals.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use kvbackup_rtree::rtree::{BackupFile, KeyRange};
use serde::{Deserialize, Serialize};

/// Storage node identifier as reported by the membership service.
pub type NodeId = u64;

/// Liveness state of a storage node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeState {
    Up,
    /// Disconnected but not yet declared down.
    Offline,
    Down,
    /// Removed from the cluster for good.
    Tombstone,
}

/// Storage node descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    pub labels: BTreeMap<String, String>,
    pub state: NodeState,
    /// Process start time; changes whenever the node restarts.
    pub start_timestamp: i64,
}

impl NodeInfo {
    /// Only nodes in the `Up` state receive work.
    pub fn is_live(&self) -> bool {
        self.state == NodeState::Up
    }

    /// True when every `key=value` pair in `want` is present on this node.
    pub fn matches_labels(&self, want: &BTreeMap<String, String>) -> bool {
        want.iter()
            .all(|(key, value)| self.labels.get(key) == Some(value))
    }
}

/// Key encoding the cluster reports for exported data.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiVersion {
    #[default]
    V1,
    V1Ttl,
    V2,
}

/// An uncommitted write lock that blocked a snapshot read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockInfo {
    pub key: Vec<u8>,
    pub primary_lock: Vec<u8>,
    /// Start version of the owning transaction.
    pub lock_version: u64,
    pub lock_ttl: u64,
    pub txn_size: u64,
}

/// Error reported by a node inside an otherwise healthy result stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("key is locked by txn {}", .0.lock_version)]
    Locked(LockInfo),
    /// Routing error such as a leader change or an epoch mismatch.
    #[error("region error: {0}")]
    Region(String),
    #[error("cluster id mismatch: expected {expected}, node has {actual}")]
    ClusterIdMismatch { expected: u64, actual: u64 },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Unknown(String),
}

/// Request sent to every target node of a round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupRequest {
    pub cluster_id: u64,
    /// Rewritten every round with the ranges still incomplete.
    pub sub_ranges: Vec<KeyRange>,
    pub start_version: u64,
    /// Snapshot timestamp.
    pub end_version: u64,
    /// Versions of locks to read past (rolled back or still pending).
    pub resolved_locks: Vec<u64>,
    /// Versions of locks whose transactions committed before the snapshot.
    pub committed_locks: Vec<u64>,
    /// Per-node export rate limit in bytes per second (0 = unlimited).
    pub rate_limit: u64,
    /// Export from followers matching the replica-read label.
    pub replica_read: bool,
}

/// One streamed item from a node's backup stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeResponse {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub files: Vec<BackupFile>,
    pub error: Option<NodeError>,
    pub api_version: ApiVersion,
}

/// A node response tagged with the node that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub response: NodeResponse,
}

/// Request to the round controller to redo work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySignal {
    /// Tear down the round and start over against fresh membership.
    RetryAll,
    /// Relaunch the worker for one node within `round`.
    RetryNode { node_id: NodeId, round: u64 },
}

impl fmt::Display for RetrySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrySignal::RetryAll => f.write_str("retry-all"),
            RetrySignal::RetryNode { node_id, round } => {
                write!(f, "retry-node(node={node_id}, round={round})")
            }
        }
    }
}

/// Unit of progress reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUnit {
    /// A requested range became fully covered.
    Range,
    /// A node result was applied.
    Region,
}

/// Progress sink invoked from the controller task.
pub type ProgressCallback = Arc<dyn Fn(ProgressUnit) + Send + Sync>;

/// Progress sink that drops every update.
pub fn noop_progress() -> ProgressCallback {
    Arc::new(|_| {})
}
