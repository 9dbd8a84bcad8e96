//! Collaborator contracts for the cluster the backup runs against.
//!
//! Membership, connections, node streams and lock resolution are supplied by
//! the embedding application. The coordinator only talks to them through the
//! traits below, and holds no process-wide state of its own.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::errors::BackupError;
use crate::types::{BackupRequest, LockInfo, NodeId, NodeInfo, NodeResponse};

/// Read access to cluster membership and the timestamp oracle.
#[async_trait]
pub trait ClusterMembership: Send + Sync + 'static {
    /// All storage nodes currently known, in any state.
    async fn nodes(&self) -> anyhow::Result<Vec<NodeInfo>>;

    /// A single node, `None` when it is no longer a member.
    async fn node(&self, node_id: NodeId) -> anyhow::Result<Option<NodeInfo>>;

    /// Current timestamp from the cluster oracle.
    async fn current_ts(&self) -> anyhow::Result<u64>;

    /// Current GC safe point; snapshots older than this are unreadable.
    async fn gc_safe_point(&self) -> anyhow::Result<u64>;
}

/// Streaming backup client for one node.
#[async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Start a backup stream for `request`.
    ///
    /// Errors returned here or yielded by the stream are transport failures;
    /// node-side failures arrive as `NodeResponse::error`.
    async fn backup(
        &self,
        request: BackupRequest,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<NodeResponse>>>;
}

/// Builds node clients.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Connect to `node`. With `reset` set, cached connections must not be reused.
    async fn connect(&self, node: &NodeInfo, reset: bool) -> anyhow::Result<Arc<dyn NodeClient>>;
}

/// Outcome of one lock resolution call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedLocks {
    /// Lock versions the snapshot read may skip.
    pub ignored: Vec<u64>,
    /// Lock versions whose transactions committed before the snapshot.
    pub committed: Vec<u64>,
}

/// Resolves locks left by in-flight transactions for a snapshot read.
#[async_trait]
pub trait LockResolver: Send + Sync + 'static {
    async fn resolve_locks_for_read(
        &self,
        snapshot_ts: u64,
        locks: &[LockInfo],
    ) -> anyhow::Result<ResolvedLocks>;
}

/// Everything a backup job needs from the cluster.
#[derive(Clone)]
pub struct BackupCluster {
    pub membership: Arc<dyn ClusterMembership>,
    pub connector: Arc<dyn ConnectionFactory>,
    pub lock_resolver: Arc<dyn LockResolver>,
}

/// Parse a replica-read label of the form `key=value[,key=value...]`.
pub fn parse_label_filter(raw: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part
            .split_once('=')
            .with_context(|| format!("invalid replica read label {part:?}, expected key=value"))?;
        let key = key.trim();
        anyhow::ensure!(!key.is_empty(), "empty key in replica read label {part:?}");
        out.insert(key.to_string(), value.trim().to_string());
    }
    Ok(out)
}

/// Render a label filter back into `key=value,...` form for logs and errors.
pub fn format_label_filter(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Nodes eligible for this round, before the liveness check.
///
/// An empty filter selects every node. A non-empty filter that matches no
/// node is a configuration error rather than something a retry could fix.
pub fn select_backup_nodes(
    nodes: Vec<NodeInfo>,
    label_filter: &BTreeMap<String, String>,
) -> Result<Vec<NodeInfo>, BackupError> {
    if label_filter.is_empty() {
        return Ok(nodes);
    }
    let selected: Vec<NodeInfo> = nodes
        .into_iter()
        .filter(|node| node.matches_labels(label_filter))
        .collect();
    if selected.is_empty() {
        return Err(BackupError::NoMatchingNodes {
            label: format_label_filter(label_filter),
        });
    }
    tracing::debug!(
        label = %format_label_filter(label_filter),
        nodes = ?selected.iter().map(|n| n.id).collect::<Vec<_>>(),
        "selected replica read nodes"
    );
    Ok(selected)
}
