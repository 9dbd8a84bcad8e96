//! Error taxonomy for backup jobs.
//!
//! `BackupError` is what a job ends with. `ErrorContext` decides, per node
//! error reported inside a result stream, whether the node should be retried
//! or the job should give up.

use std::collections::HashMap;

use crate::types::{NodeError, NodeId};

/// Terminal failure of a backup job.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup cancelled")]
    Cancelled,
    #[error("no storage node matches replica read label {label}")]
    NoMatchingNodes { label: String },
    #[error("node {node_id} failed permanently: {reason}")]
    NodeGaveUp { node_id: NodeId, reason: String },
    #[error("malformed result from node {node_id}: {message}")]
    MalformedResult { node_id: NodeId, message: String },
    #[error("checkpoint append failed: {0:#}")]
    Checkpoint(anyhow::Error),
    #[error("backup loop exited with {remaining} ranges incomplete")]
    Incomplete { remaining: usize },
    #[error("gave up after {0} rounds")]
    RoundLimit(u64),
    #[error("{0:#}")]
    Internal(anyhow::Error),
}

impl BackupError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::Cancelled)
    }
}

/// Decision for a node-reported error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorStrategy {
    /// Relaunch the node's worker; the failed ranges stay incomplete.
    Retry,
    /// Leave the failed ranges for the next round without relaunching.
    Defer,
    /// Abort the job.
    GiveUp { reason: String },
}

/// Classifies node-reported errors.
pub trait ErrorClassifier: Send {
    /// Reset per-round state.
    fn begin_round(&mut self);

    fn classify(&mut self, node_id: NodeId, err: &NodeError) -> ErrorStrategy;
}

/// Default number of unknown errors tolerated per node per round.
pub const DEFAULT_ERROR_RETRY_LIMIT: u32 = 10;
/// In-round relaunches per node for routing errors; later ones wait for the
/// next round.
pub const REGION_RETRY_LIMIT: u32 = 3;

/// Counting classifier: routing errors relaunch the node a few times per
/// round and are deferred after that, unknown errors retry until a per-node
/// budget is spent, permission and identity errors give up immediately.
#[derive(Debug)]
pub struct ErrorContext {
    scope: &'static str,
    limit: u32,
    counts: HashMap<NodeId, u32>,
    region_counts: HashMap<NodeId, u32>,
}

impl ErrorContext {
    pub fn new(scope: &'static str, limit: u32) -> Self {
        Self {
            scope,
            limit,
            counts: HashMap::new(),
            region_counts: HashMap::new(),
        }
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new("backup-round", DEFAULT_ERROR_RETRY_LIMIT)
    }
}

impl ErrorClassifier for ErrorContext {
    fn begin_round(&mut self) {
        self.counts.clear();
        self.region_counts.clear();
    }

    fn classify(&mut self, node_id: NodeId, err: &NodeError) -> ErrorStrategy {
        match err {
            NodeError::Locked(_) => ErrorStrategy::Retry,
            NodeError::Region(msg) => {
                let count = self.region_counts.entry(node_id).or_insert(0);
                *count += 1;
                if *count > REGION_RETRY_LIMIT {
                    tracing::debug!(
                        scope = self.scope,
                        node_id,
                        error = %msg,
                        "region error budget spent, deferring to next round"
                    );
                    return ErrorStrategy::Defer;
                }
                ErrorStrategy::Retry
            }
            NodeError::ClusterIdMismatch { .. } | NodeError::PermissionDenied(_) => {
                ErrorStrategy::GiveUp {
                    reason: err.to_string(),
                }
            }
            NodeError::Unknown(msg) => {
                if msg.to_ascii_lowercase().contains("permission denied") {
                    return ErrorStrategy::GiveUp {
                        reason: err.to_string(),
                    };
                }
                let count = self.counts.entry(node_id).or_insert(0);
                *count += 1;
                if *count > self.limit {
                    return ErrorStrategy::GiveUp {
                        reason: format!(
                            "{}: node {node_id} exceeded {} retries, last error: {msg}",
                            self.scope, self.limit
                        ),
                    };
                }
                tracing::warn!(
                    scope = self.scope,
                    node_id,
                    attempt = *count,
                    error = %msg,
                    "unknown node error, retrying"
                );
                ErrorStrategy::Retry
            }
        }
    }
}
