//! In-process simulated cluster.
//!
//! Implements every collaborator trait the coordinator needs over a fixed
//! set of rows split into regions, each led by one node. Faults can be
//! injected at any time: node state changes and restarts, transport
//! failures, connect failures, node-reported errors, lock conflicts and
//! lock-resolution failures. Used by the `kvbackup-sim` binary and the
//! integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use kvbackup_rtree::rtree::{cmp_end, key_before_end, BackupFile, ChecksumStats, KeyRange};

use crate::cluster::{
    BackupCluster, ClusterMembership, ConnectionFactory, LockResolver, NodeClient, ResolvedLocks,
};
use crate::job::compose_ts;
use crate::types::{
    ApiVersion, BackupRequest, LockInfo, NodeError, NodeId, NodeInfo, NodeResponse, NodeState,
};

const DEFAULT_CLUSTER_ID: u64 = 7_001;
const SIM_START_PHYSICAL_MS: u64 = 1_700_000_000_000;

/// One region: a key range and the node leading it.
#[derive(Clone, Debug)]
pub struct SimRegion {
    pub id: u64,
    pub range: KeyRange,
    pub leader: NodeId,
}

#[derive(Default)]
struct SimState {
    cluster_id: u64,
    nodes: BTreeMap<NodeId, NodeInfo>,
    regions: Vec<SimRegion>,
    rows: BTreeSet<Vec<u8>>,
    physical_ms: u64,
    gc_safe_point: u64,
    api_version: ApiVersion,
    response_delay: Option<Duration>,

    transport_failures: BTreeMap<NodeId, u32>,
    connect_failures: BTreeMap<NodeId, u32>,
    node_errors: BTreeMap<NodeId, VecDeque<NodeError>>,
    permission_denied: BTreeSet<NodeId>,
    locks: Vec<LockInfo>,
    resolve_failures: u32,

    backup_calls: BTreeMap<NodeId, u64>,
    connects: Vec<(NodeId, bool)>,
    resolve_calls: Vec<Vec<u64>>,
}

/// Builder for [`SimCluster`].
#[derive(Debug, Default)]
pub struct SimClusterBuilder {
    nodes: u64,
    splits: Vec<Vec<u8>>,
    rows: usize,
    cluster_id: Option<u64>,
    labels: BTreeMap<NodeId, BTreeMap<String, String>>,
}

impl SimClusterBuilder {
    pub fn nodes(mut self, count: u64) -> Self {
        self.nodes = count;
        self
    }

    /// Region boundaries; regions are assigned to nodes round-robin.
    pub fn splits(mut self, keys: &[&str]) -> Self {
        self.splits = keys.iter().map(|k| k.as_bytes().to_vec()).collect();
        self
    }

    /// Number of rows, keyed `k000`, `k001`, ...
    pub fn rows(mut self, count: usize) -> Self {
        self.rows = count;
        self
    }

    pub fn cluster_id(mut self, id: u64) -> Self {
        self.cluster_id = Some(id);
        self
    }

    pub fn label(mut self, node_id: NodeId, key: &str, value: &str) -> Self {
        self.labels
            .entry(node_id)
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> SimCluster {
        let node_count = self.nodes.max(1);
        let mut state = SimState {
            cluster_id: self.cluster_id.unwrap_or(DEFAULT_CLUSTER_ID),
            physical_ms: SIM_START_PHYSICAL_MS,
            ..SimState::default()
        };
        for id in 1..=node_count {
            state.nodes.insert(
                id,
                NodeInfo {
                    id,
                    address: format!("sim-node-{id}:20160"),
                    labels: self.labels.get(&id).cloned().unwrap_or_default(),
                    state: NodeState::Up,
                    start_timestamp: 1,
                },
            );
        }

        let mut splits = self.splits;
        splits.sort();
        splits.dedup();
        let mut bounds = vec![Vec::new()];
        bounds.extend(splits.into_iter().filter(|k| !k.is_empty()));
        bounds.push(Vec::new());
        for (idx, pair) in bounds.windows(2).enumerate() {
            state.regions.push(SimRegion {
                id: idx as u64 + 1,
                range: KeyRange::new(pair[0].clone(), pair[1].clone()),
                leader: idx as u64 % node_count + 1,
            });
        }
        state.rows = (0..self.rows)
            .map(|i| format!("k{i:03}").into_bytes())
            .collect();

        SimCluster {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

/// Shared handle to a simulated cluster.
#[derive(Clone)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    pub fn builder() -> SimClusterBuilder {
        SimClusterBuilder::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Collaborators for a backup job against this cluster.
    pub fn cluster(&self) -> BackupCluster {
        BackupCluster {
            membership: Arc::new(self.clone()),
            connector: Arc::new(self.clone()),
            lock_resolver: Arc::new(self.clone()),
        }
    }

    pub fn cluster_id(&self) -> u64 {
        self.state().cluster_id
    }

    pub fn regions(&self) -> Vec<SimRegion> {
        self.state().regions.clone()
    }

    pub fn set_node_state(&self, node_id: NodeId, node_state: NodeState) {
        if let Some(node) = self.state().nodes.get_mut(&node_id) {
            node.state = node_state;
        }
    }

    /// Bump the node's start timestamp as a restart would.
    pub fn restart_node(&self, node_id: NodeId) {
        if let Some(node) = self.state().nodes.get_mut(&node_id) {
            node.start_timestamp += 1;
        }
    }

    pub fn add_node(&self, node_id: NodeId) {
        self.state().nodes.insert(
            node_id,
            NodeInfo {
                id: node_id,
                address: format!("sim-node-{node_id}:20160"),
                labels: BTreeMap::new(),
                state: NodeState::Up,
                start_timestamp: 1,
            },
        );
    }

    pub fn remove_node(&self, node_id: NodeId) {
        self.state().nodes.remove(&node_id);
    }

    /// Hand the leadership of region `region_id` to `node_id`.
    pub fn move_leader(&self, region_id: u64, node_id: NodeId) {
        if let Some(region) = self.state().regions.iter_mut().find(|r| r.id == region_id) {
            region.leader = node_id;
        }
    }

    /// The next `times` backup streams from `node_id` break after their first
    /// response.
    pub fn fail_transport(&self, node_id: NodeId, times: u32) {
        *self.state().transport_failures.entry(node_id).or_default() += times;
    }

    pub fn fail_connect(&self, node_id: NodeId, times: u32) {
        *self.state().connect_failures.entry(node_id).or_default() += times;
    }

    /// Report `err` instead of the next successful response from `node_id`.
    pub fn inject_node_error(&self, node_id: NodeId, err: NodeError) {
        self.state()
            .node_errors
            .entry(node_id)
            .or_default()
            .push_back(err);
    }

    /// Every response from `node_id` fails with a permission error.
    pub fn deny_permission(&self, node_id: NodeId) {
        self.state().permission_denied.insert(node_id);
    }

    /// Leave an unresolved lock on `key` written by transaction `version`.
    pub fn inject_lock(&self, key: &str, version: u64) {
        self.state().locks.push(LockInfo {
            key: key.as_bytes().to_vec(),
            primary_lock: key.as_bytes().to_vec(),
            lock_version: version,
            lock_ttl: 3_000,
            txn_size: 1,
        });
    }

    pub fn fail_lock_resolution(&self, times: u32) {
        self.state().resolve_failures += times;
    }

    /// Delay before each streamed response.
    pub fn set_response_delay(&self, delay: Duration) {
        self.state().response_delay = Some(delay);
    }

    pub fn set_api_version(&self, version: ApiVersion) {
        self.state().api_version = version;
    }

    pub fn set_gc_safe_point(&self, ts: u64) {
        self.state().gc_safe_point = ts;
    }

    pub fn physical_ms(&self) -> u64 {
        self.state().physical_ms
    }

    pub fn backup_calls(&self, node_id: NodeId) -> u64 {
        self.state().backup_calls.get(&node_id).copied().unwrap_or(0)
    }

    /// Every `connect` call as `(node, reset)`.
    pub fn connects(&self) -> Vec<(NodeId, bool)> {
        self.state().connects.clone()
    }

    /// Lock versions passed to each resolver call.
    pub fn resolve_calls(&self) -> Vec<Vec<u64>> {
        self.state().resolve_calls.clone()
    }

    /// Checksum of every row inside `range`.
    pub fn expected_checksum(&self, range: &KeyRange) -> ChecksumStats {
        rows_checksum(&self.state().rows, &range.start, &range.end)
    }
}

#[async_trait]
impl ClusterMembership for SimCluster {
    async fn nodes(&self) -> anyhow::Result<Vec<NodeInfo>> {
        Ok(self.state().nodes.values().cloned().collect())
    }

    async fn node(&self, node_id: NodeId) -> anyhow::Result<Option<NodeInfo>> {
        Ok(self.state().nodes.get(&node_id).cloned())
    }

    async fn current_ts(&self) -> anyhow::Result<u64> {
        let mut state = self.state();
        state.physical_ms += 1;
        compose_ts(state.physical_ms, 0)
    }

    async fn gc_safe_point(&self) -> anyhow::Result<u64> {
        Ok(self.state().gc_safe_point)
    }
}

#[async_trait]
impl ConnectionFactory for SimCluster {
    async fn connect(&self, node: &NodeInfo, reset: bool) -> anyhow::Result<Arc<dyn NodeClient>> {
        let mut state = self.state();
        state.connects.push((node.id, reset));
        if let Some(left) = state.connect_failures.get_mut(&node.id) {
            if *left > 0 {
                *left -= 1;
                anyhow::bail!("connect to {} refused", node.address);
            }
        }
        Ok(Arc::new(SimNodeClient {
            node_id: node.id,
            sim: self.clone(),
        }))
    }
}

#[async_trait]
impl LockResolver for SimCluster {
    async fn resolve_locks_for_read(
        &self,
        _snapshot_ts: u64,
        locks: &[LockInfo],
    ) -> anyhow::Result<ResolvedLocks> {
        let mut state = self.state();
        state
            .resolve_calls
            .push(locks.iter().map(|l| l.lock_version).collect());
        if state.resolve_failures > 0 {
            state.resolve_failures -= 1;
            anyhow::bail!("region unavailable while resolving locks");
        }
        // Odd versions rolled back, even versions committed.
        let mut resolved = ResolvedLocks::default();
        for lock in locks {
            if lock.lock_version % 2 == 0 {
                resolved.committed.push(lock.lock_version);
            } else {
                resolved.ignored.push(lock.lock_version);
            }
        }
        Ok(resolved)
    }
}

/// Client bound to one simulated node.
struct SimNodeClient {
    node_id: NodeId,
    sim: SimCluster,
}

#[async_trait]
impl NodeClient for SimNodeClient {
    async fn backup(
        &self,
        request: BackupRequest,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<NodeResponse>>> {
        let node_id = self.node_id;
        let mut state = self.sim.state();
        *state.backup_calls.entry(node_id).or_default() += 1;
        match state.nodes.get(&node_id) {
            Some(node) if node.is_live() => {}
            _ => anyhow::bail!("node {node_id} unreachable"),
        }

        let mut items: Vec<anyhow::Result<NodeResponse>> = Vec::new();
        if request.cluster_id != 0 && request.cluster_id != state.cluster_id {
            items.push(Ok(NodeResponse {
                error: Some(NodeError::ClusterIdMismatch {
                    expected: request.cluster_id,
                    actual: state.cluster_id,
                }),
                ..NodeResponse::default()
            }));
        } else {
            // Replica reads are served by every node holding the region.
            let served: Vec<SimRegion> = state
                .regions
                .iter()
                .filter(|r| request.replica_read || r.leader == node_id)
                .cloned()
                .collect();
            for range in &request.sub_ranges {
                for region in &served {
                    if let Some((start, end)) = intersect(&region.range, range) {
                        items.push(Ok(state.respond(node_id, region, start, end, &request)));
                    }
                }
            }
        }

        if let Some(left) = state.transport_failures.get_mut(&node_id) {
            if *left > 0 {
                *left -= 1;
                items.truncate(1);
                items.push(Err(anyhow::anyhow!("transport is closing")));
            }
        }
        let delay = state.response_delay;
        drop(state);

        Ok(match delay {
            Some(delay) => stream::iter(items)
                .then(move |item| async move {
                    tokio::time::sleep(delay).await;
                    item
                })
                .boxed(),
            None => stream::iter(items).boxed(),
        })
    }
}

impl SimState {
    fn respond(
        &mut self,
        node_id: NodeId,
        region: &SimRegion,
        start: Vec<u8>,
        end: Vec<u8>,
        request: &BackupRequest,
    ) -> NodeResponse {
        let mut response = NodeResponse {
            start_key: start,
            end_key: end,
            api_version: self.api_version,
            ..NodeResponse::default()
        };
        if self.permission_denied.contains(&node_id) {
            response.error = Some(NodeError::PermissionDenied(
                "write to external storage".to_string(),
            ));
            return response;
        }
        if let Some(err) = self.node_errors.get_mut(&node_id).and_then(VecDeque::pop_front) {
            response.error = Some(err);
            return response;
        }
        let blocking = self.locks.iter().find(|lock| {
            key_in(&lock.key, &response.start_key, &response.end_key)
                && !request.resolved_locks.contains(&lock.lock_version)
                && !request.committed_locks.contains(&lock.lock_version)
        });
        if let Some(lock) = blocking {
            response.error = Some(NodeError::Locked(lock.clone()));
            return response;
        }

        let stats = rows_checksum(&self.rows, &response.start_key, &response.end_key);
        if stats.total_kvs > 0 {
            response.files.push(BackupFile {
                name: format!(
                    "{node_id}_{}_{}.sst",
                    region.id,
                    hex(&response.start_key)
                ),
                cf: "default".to_string(),
                start_key: response.start_key.clone(),
                end_key: response.end_key.clone(),
                crc64_xor: stats.crc64_xor,
                total_kvs: stats.total_kvs,
                total_bytes: stats.total_bytes,
                size: stats.total_bytes,
            });
        }
        response
    }
}

fn key_in(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    key >= start && key_before_end(key, end)
}

fn intersect(a: &KeyRange, b: &KeyRange) -> Option<(Vec<u8>, Vec<u8>)> {
    let start = a.start.as_slice().max(b.start.as_slice());
    let end = match cmp_end(&a.end, &b.end) {
        std::cmp::Ordering::Greater => b.end.as_slice(),
        _ => a.end.as_slice(),
    };
    key_before_end(start, end).then(|| (start.to_vec(), end.to_vec()))
}

fn rows_checksum(rows: &BTreeSet<Vec<u8>>, start: &[u8], end: &[u8]) -> ChecksumStats {
    let mut stats = ChecksumStats::default();
    for key in rows
        .range(start.to_vec()..)
        .take_while(|key| key_before_end(key, end))
    {
        stats.merge(ChecksumStats {
            crc64_xor: u64::from(crc32fast::hash(key)),
            total_kvs: 1,
            total_bytes: key.len() as u64,
        });
    }
    stats
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn everything() -> BackupRequest {
        BackupRequest {
            sub_ranges: vec![KeyRange::default()],
            ..BackupRequest::default()
        }
    }

    async fn collect(sim: &SimCluster, node_id: NodeId, request: BackupRequest) -> Vec<anyhow::Result<NodeResponse>> {
        let node = sim.node(node_id).await.unwrap().unwrap();
        let client = sim.connect(&node, true).await.unwrap();
        client.backup(request).await.unwrap().collect().await
    }

    #[test]
    fn regions_are_assigned_round_robin() {
        let sim = SimCluster::builder().nodes(2).splits(&["k010", "k020"]).build();
        let leaders: Vec<_> = sim.regions().iter().map(|r| r.leader).collect();
        assert_eq!(leaders, vec![1, 2, 1]);
        assert!(sim.regions()[0].range.start.is_empty());
        assert!(sim.regions()[2].range.is_unbounded());
    }

    #[tokio::test]
    async fn node_answers_only_for_regions_it_leads() {
        let sim = SimCluster::builder().nodes(2).splits(&["k010"]).rows(20).build();
        let from_one = collect(&sim, 1, everything()).await;
        assert_eq!(from_one.len(), 1);
        let response = from_one[0].as_ref().unwrap();
        assert_eq!(response.end_key, b"k010");
        assert_eq!(response.files[0].total_kvs, 10);

        let from_two = collect(&sim, 2, everything()).await;
        let response = from_two[0].as_ref().unwrap();
        assert_eq!(response.start_key, b"k010");
        assert!(response.end_key.is_empty());
    }

    #[tokio::test]
    async fn locks_block_until_resolved_versions_are_sent() {
        let sim = SimCluster::builder().nodes(1).rows(5).build();
        sim.inject_lock("k002", 41);
        let blocked = collect(&sim, 1, everything()).await;
        assert!(matches!(
            blocked[0].as_ref().unwrap().error,
            Some(NodeError::Locked(LockInfo { lock_version: 41, .. }))
        ));

        let request = BackupRequest {
            resolved_locks: vec![41],
            ..everything()
        };
        let clean = collect(&sim, 1, request).await;
        assert!(clean[0].as_ref().unwrap().error.is_none());
    }

    #[tokio::test]
    async fn transport_failure_breaks_stream_once() {
        let sim = SimCluster::builder().nodes(1).splits(&["k003", "k006"]).rows(9).build();
        sim.fail_transport(1, 1);
        let broken = collect(&sim, 1, everything()).await;
        assert_eq!(broken.len(), 2);
        assert!(broken[1].is_err());
        let healthy = collect(&sim, 1, everything()).await;
        assert_eq!(healthy.len(), 3);
        assert!(healthy.iter().all(Result::is_ok));
    }

    #[test]
    fn intersection_handles_unbounded_ends() {
        let tail = KeyRange::new(b"m".to_vec(), Vec::new());
        let everything = KeyRange::default();
        assert_eq!(
            intersect(&tail, &everything),
            Some((b"m".to_vec(), Vec::new()))
        );
        let left = KeyRange::new(b"a".to_vec(), b"c".to_vec());
        assert_eq!(intersect(&left, &tail), None);
        assert_eq!(
            intersect(&left, &KeyRange::new(b"b".to_vec(), Vec::new())),
            Some((b"b".to_vec(), b"c".to_vec()))
        );
    }
}
