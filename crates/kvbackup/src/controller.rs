//! Round-based backup driver.
//!
//! Each round:
//! 1. recompute the incomplete ranges (none left: done)
//! 2. resolve target nodes (membership, replica label, liveness)
//! 3. connect to every target and start one worker per node
//! 4. drain the merged result queue, applying results and handling retry
//!    signals, while a timer narrows the request to what is still incomplete
//! 5. once every worker is drained, resolve the round's locks in one batch
//!
//! A topology change restarts the round. A transport failure or a retryable
//! node error restarts only that node's worker; the other nodes keep
//! streaming. Fatal node errors and checkpoint failures abort the job.
//!
//! The progress tree is only touched from the controller's task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kvbackup_rtree::rtree::{ApplyOutcome, ProgressRangeTree};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionLimiter;
use crate::checkpoint::{CheckpointLog, CheckpointRecord};
use crate::cluster::{select_backup_nodes, BackupCluster, NodeClient};
use crate::config::BackupConfig;
use crate::errors::{BackupError, ErrorClassifier, ErrorContext, ErrorStrategy};
use crate::fanin::{FanInCollector, Producer, ProducerRegistry};
use crate::locks::{LockResolutionBatcher, LockRoundOutcome};
use crate::types::{
    noop_progress, ApiVersion, BackupRequest, NodeError, NodeId, NodeResult, ProgressCallback,
    ProgressUnit, RetrySignal,
};
use crate::worker::{spawn_node_worker, NodeWorker};

/// Capacity of the retry-signal queue shared by workers and the topology
/// watcher.
const RETRY_SIGNAL_CAPACITY: usize = 64;

/// Multiplier applied to the cost of an incomplete-range refresh to get the
/// next refresh period.
const REFRESH_COST_FACTOR: u32 = 5;

/// Controller settings derived from [`BackupConfig`].
#[derive(Clone, Debug)]
pub struct RoundConfig {
    pub concurrency: usize,
    pub range_limit: u32,
    pub label_filter: BTreeMap<String, String>,
    pub round_delay: Duration,
    pub incomplete_refresh: Duration,
    pub lock_resolve_max_backoff: Duration,
    pub error_retry_limit: u32,
    /// Zero means no limit.
    pub max_rounds: u64,
}

impl RoundConfig {
    pub fn from_config(config: &BackupConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            concurrency: config.concurrency,
            range_limit: config.range_limit,
            label_filter: config.label_filter()?,
            round_delay: config.round_delay(),
            incomplete_refresh: config.incomplete_refresh(),
            lock_resolve_max_backoff: config.lock_resolve_max_backoff(),
            error_retry_limit: config.error_retry_limit,
            max_rounds: config.max_rounds,
        })
    }
}

impl Default for RoundConfig {
    fn default() -> Self {
        let config = BackupConfig::default();
        Self {
            concurrency: config.concurrency,
            range_limit: config.range_limit,
            label_filter: BTreeMap::new(),
            round_delay: config.round_delay(),
            incomplete_refresh: config.incomplete_refresh(),
            lock_resolve_max_backoff: config.lock_resolve_max_backoff(),
            error_retry_limit: config.error_retry_limit,
            max_rounds: config.max_rounds,
        }
    }
}

/// Counters describing what the controller did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub rounds: u64,
    pub results_applied: u64,
    pub duplicate_results: u64,
    pub untracked_results: u64,
    pub lock_conflicts: u64,
    pub node_retries: u64,
    pub round_restarts: u64,
    pub incomplete_refreshes: u64,
}

/// How a round ended.
enum RoundEnd {
    /// Nothing left to back up.
    Finished,
    /// Every worker drained. `locks_only` is set when the only errors seen
    /// were lock conflicts.
    Drained { locks_only: bool },
    /// Round torn down early; the next one reconnects everything.
    Restart,
}

/// What the round loop must do after applying one result.
enum ResultAction {
    Continue,
    RetryNode(NodeId),
}

#[derive(Default)]
struct RoundFlags {
    locks_seen: bool,
    errors_seen: bool,
}

/// Drives rounds until every tracked range is complete.
pub struct RoundController {
    cluster: BackupCluster,
    config: RoundConfig,
    limiter: AdmissionLimiter,
    batcher: LockResolutionBatcher,
    classifier: Box<dyn ErrorClassifier>,
    checkpoint: Option<Arc<dyn CheckpointLog>>,
    progress: ProgressCallback,
    notify_tx: mpsc::Sender<RetrySignal>,
    notify_rx: mpsc::Receiver<RetrySignal>,
    request: BackupRequest,
    api_version: Option<ApiVersion>,
    stats: ControllerStats,
}

impl RoundController {
    /// `request` is the template sent to every node; its sub-ranges are
    /// rewritten each round.
    pub fn new(cluster: BackupCluster, config: RoundConfig, request: BackupRequest) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(RETRY_SIGNAL_CAPACITY);
        let batcher =
            LockResolutionBatcher::new(cluster.lock_resolver.clone(), config.lock_resolve_max_backoff);
        Self {
            limiter: AdmissionLimiter::new(config.range_limit),
            classifier: Box::new(ErrorContext::new("backup-round", config.error_retry_limit)),
            batcher,
            cluster,
            config,
            checkpoint: None,
            progress: noop_progress(),
            notify_tx,
            notify_rx,
            request,
            api_version: None,
            stats: ControllerStats::default(),
        }
    }

    pub fn with_checkpoint(mut self, log: Arc<dyn CheckpointLog>) -> Self {
        self.checkpoint = Some(log);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_classifier(mut self, classifier: Box<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Sender for out-of-band retry signals (topology watcher).
    pub fn notifier(&self) -> mpsc::Sender<RetrySignal> {
        self.notify_tx.clone()
    }

    pub fn request(&self) -> &BackupRequest {
        &self.request
    }

    /// Data format reported by the nodes, once any result was applied.
    pub fn api_version(&self) -> Option<ApiVersion> {
        self.api_version
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    /// Run rounds until `tree` has no incomplete range.
    pub async fn run(
        &mut self,
        tree: &mut ProgressRangeTree,
        cancel: &CancellationToken,
    ) -> Result<(), BackupError> {
        let mut round = 0u64;
        // Reconnect every round unless the previous one only hit locks.
        let mut reset = true;
        loop {
            round += 1;
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(BackupError::Cancelled),
                () = tokio::time::sleep(self.config.round_delay) => {}
            }
            tracing::info!(round, "backup round starts");
            match self.run_round(round, reset, tree, cancel).await? {
                RoundEnd::Finished => {
                    tracing::info!(round, "all backup ranges finished");
                    return Ok(());
                }
                RoundEnd::Drained { locks_only } => reset = !locks_only,
                RoundEnd::Restart => {
                    self.stats.round_restarts += 1;
                    reset = true;
                }
            }
        }
    }

    async fn run_round(
        &mut self,
        round: u64,
        reset: bool,
        tree: &mut ProgressRangeTree,
        cancel: &CancellationToken,
    ) -> Result<RoundEnd, BackupError> {
        let started = Instant::now();
        self.request.sub_ranges = tree.incomplete_ranges();
        if self.request.sub_ranges.is_empty() {
            return Ok(RoundEnd::Finished);
        }
        if self.config.max_rounds > 0 && round > self.config.max_rounds {
            return Err(BackupError::RoundLimit(self.config.max_rounds));
        }
        self.stats.rounds = round;
        tracing::info!(
            round,
            incomplete_ranges = self.request.sub_ranges.len(),
            remaining = tree.remaining_count(),
            cost_ms = started.elapsed().as_millis() as u64,
            "backup ranges"
        );

        let round_cancel = cancel.child_token();
        let _round_guard = round_cancel.clone().drop_guard();

        let nodes = match self.cluster.membership.nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                tracing::error!(round, error = ?err, "failed to list backup nodes");
                return Ok(RoundEnd::Restart);
            }
        };
        let nodes = select_backup_nodes(nodes, &self.config.label_filter)?;

        let mut registry = ProducerRegistry::new();
        for node in nodes {
            if !node.is_live() {
                tracing::warn!(round, node_id = node.id, state = ?node.state, "node not alive, skipping it this round");
                continue;
            }
            let client = match self.cluster.connector.connect(&node, reset).await {
                Ok(client) => client,
                Err(err) => {
                    tracing::error!(round, node_id = node.id, error = ?err, "failed to connect backup client");
                    return Ok(RoundEnd::Restart);
                }
            };
            self.spawn_worker(&mut registry, node.id, round, client, &round_cancel);
        }
        tracing::debug!(round, nodes = ?registry.node_ids(), "node workers started");

        self.classifier.begin_round();
        self.batcher.clear();
        let mut flags = RoundFlags::default();
        let mut collector = FanInCollector::start(registry, round_cancel.child_token());
        let refresh = tokio::time::sleep(self.config.incomplete_refresh);
        tokio::pin!(refresh);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(BackupError::Cancelled),
                () = &mut refresh => {
                    let began = Instant::now();
                    self.request.sub_ranges = tree.incomplete_ranges();
                    let elapsed = began.elapsed();
                    self.stats.incomplete_refreshes += 1;
                    let next = (elapsed * REFRESH_COST_FACTOR).max(self.config.incomplete_refresh);
                    refresh.as_mut().reset(Instant::now() + next);
                    tracing::info!(
                        round,
                        incomplete_ranges = self.request.sub_ranges.len(),
                        take_ms = elapsed.as_millis() as u64,
                        "updated incomplete ranges"
                    );
                }
                Some(signal) = self.notify_rx.recv() => match signal {
                    RetrySignal::RetryAll => {
                        tracing::info!(round, "cluster state changed, restarting node backups");
                        return Ok(RoundEnd::Restart);
                    }
                    RetrySignal::RetryNode { node_id, round: tagged } if tagged == round => {
                        flags.errors_seen = true;
                        match self.retry_node(node_id, round, collector, &round_cancel).await {
                            Some(next) => collector = next,
                            None => return Ok(RoundEnd::Restart),
                        }
                    }
                    RetrySignal::RetryNode { node_id, round: tagged } => {
                        tracing::debug!(round, node_id, signal_round = tagged, "ignoring retry signal from an earlier round");
                    }
                },
                item = collector.recv() => {
                    let Some(result) = item else {
                        break;
                    };
                    match self.on_node_result(result, tree, &mut flags).await? {
                        ResultAction::Continue => {}
                        ResultAction::RetryNode(node_id) => {
                            flags.errors_seen = true;
                            match self.retry_node(node_id, round, collector, &round_cancel).await {
                                Some(next) => collector = next,
                                None => return Ok(RoundEnd::Restart),
                            }
                        }
                    }
                }
            }
        }

        // Every worker drained: resolve this round's locks before the next.
        let outcome = self
            .batcher
            .resolve_round(self.request.end_version, &mut self.request, &round_cancel)
            .await;
        if let LockRoundOutcome::Resolved { ignored, committed } = outcome {
            tracing::info!(round, ignored, committed, "locks resolved for next round");
        }
        Ok(RoundEnd::Drained {
            locks_only: flags.locks_seen && !flags.errors_seen,
        })
    }

    fn spawn_worker(
        &self,
        registry: &mut ProducerRegistry,
        node_id: NodeId,
        round: u64,
        client: Arc<dyn NodeClient>,
        round_cancel: &CancellationToken,
    ) {
        let cancel = round_cancel.child_token();
        let rx = spawn_node_worker(NodeWorker {
            node_id,
            round,
            client,
            request: self.request.clone(),
            concurrency: self.config.concurrency,
            limiter: self.limiter.clone(),
            notify: self.notify_tx.clone(),
            cancel: cancel.clone(),
        });
        registry.insert(node_id, Producer { rx, cancel });
    }

    /// Relaunch the worker for `node_id` without disturbing the others.
    ///
    /// Returns the restarted collector, or `None` when the round has to be
    /// restarted instead.
    async fn retry_node(
        &mut self,
        node_id: NodeId,
        round: u64,
        collector: FanInCollector,
        round_cancel: &CancellationToken,
    ) -> Option<FanInCollector> {
        self.stats.node_retries += 1;
        tracing::info!(round, node_id, "retrying backup on node");
        let node = match self.cluster.membership.node(node_id).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                tracing::info!(round, node_id, "node no longer in membership, restarting round");
                return None;
            }
            Err(err) => {
                tracing::warn!(round, node_id, error = ?err, "cannot look up node, restarting round");
                return None;
            }
        };
        if !node.is_live() {
            tracing::warn!(round, node_id, state = ?node.state, "node not alive, restarting round");
            return None;
        }
        // The node address may have changed; always reconnect.
        let client = match self.cluster.connector.connect(&node, true).await {
            Ok(client) => client,
            Err(err) => {
                tracing::error!(round, node_id, error = ?err, "failed to reset backup client");
                return None;
            }
        };

        let mut registry = collector.stop().await;
        self.spawn_worker(&mut registry, node_id, round, client, round_cancel);
        Some(FanInCollector::start(registry, round_cancel.child_token()))
    }

    async fn on_node_result(
        &mut self,
        result: NodeResult,
        tree: &mut ProgressRangeTree,
        flags: &mut RoundFlags,
    ) -> Result<ResultAction, BackupError> {
        let node_id = result.node_id;
        let response = result.response;
        match response.error {
            None => {}
            Some(NodeError::Locked(lock)) => {
                tracing::debug!(
                    node_id,
                    key = %lock.key.escape_ascii(),
                    lock_version = lock.lock_version,
                    "backup hit a lock"
                );
                self.stats.lock_conflicts += 1;
                flags.locks_seen = true;
                self.batcher.push(lock);
                return Ok(ResultAction::Continue);
            }
            Some(err) => {
                flags.errors_seen = true;
                return match self.classifier.classify(node_id, &err) {
                    ErrorStrategy::GiveUp { reason } => {
                        tracing::error!(node_id, error = %err, "node error is not retryable");
                        Err(BackupError::NodeGaveUp { node_id, reason })
                    }
                    ErrorStrategy::Retry => {
                        tracing::warn!(
                            node_id,
                            start = %response.start_key.escape_ascii(),
                            end = %response.end_key.escape_ascii(),
                            error = %err,
                            "node reported a retryable error"
                        );
                        Ok(ResultAction::RetryNode(node_id))
                    }
                    ErrorStrategy::Defer => {
                        tracing::warn!(
                            node_id,
                            start = %response.start_key.escape_ascii(),
                            end = %response.end_key.escape_ascii(),
                            error = %err,
                            "node error deferred to the next round"
                        );
                        Ok(ResultAction::Continue)
                    }
                };
            }
        }

        let start = response.start_key;
        let end = response.end_key;
        let owner = tree
            .find_contained(&start, &end)
            .map_err(|err| BackupError::MalformedResult {
                node_id,
                message: format!("{err:#}"),
            })?;
        if owner.is_none() {
            tracing::debug!(node_id, start = %start.escape_ascii(), "result outside tracked ranges");
            self.stats.untracked_results += 1;
            return Ok(ResultAction::Continue);
        }
        if tree.is_covered(&start, &end) {
            self.stats.duplicate_results += 1;
            return Ok(ResultAction::Continue);
        }

        if let Some(log) = &self.checkpoint {
            log.append(CheckpointRecord {
                start_key: start.clone(),
                end_key: end.clone(),
                files: response.files.clone(),
            })
            .await
            .map_err(BackupError::Checkpoint)?;
        }
        let outcome = tree
            .apply_completion(&start, &end, response.files)
            .map_err(|err| BackupError::MalformedResult {
                node_id,
                message: format!("{err:#}"),
            })?;
        match outcome {
            ApplyOutcome::Applied { replaced, completed, .. } => {
                self.stats.results_applied += 1;
                tracing::debug!(
                    node_id,
                    start = %start.escape_ascii(),
                    end = %end.escape_ascii(),
                    replaced,
                    completed,
                    "applied backup result"
                );
            }
            ApplyOutcome::Duplicate => self.stats.duplicate_results += 1,
            ApplyOutcome::Untracked => self.stats.untracked_results += 1,
        }
        self.note_api_version(node_id, response.api_version);
        (self.progress)(ProgressUnit::Region);
        Ok(ResultAction::Continue)
    }

    fn note_api_version(&mut self, node_id: NodeId, version: ApiVersion) {
        match self.api_version {
            None => self.api_version = Some(version),
            Some(known) if known != version => {
                tracing::warn!(node_id, ?known, reported = ?version, "node reported a different api version");
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCluster;
    use crate::types::NodeState;
    use kvbackup_rtree::rtree::KeyRange;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> RoundConfig {
        RoundConfig {
            concurrency: 2,
            round_delay: Duration::from_millis(1),
            ..RoundConfig::default()
        }
    }

    fn whole_tree() -> ProgressRangeTree {
        let mut tree = ProgressRangeTree::new();
        tree.insert(KeyRange::new(Vec::new(), Vec::new()), 1).unwrap();
        tree
    }

    fn request() -> BackupRequest {
        BackupRequest {
            end_version: 1 << 18,
            ..BackupRequest::default()
        }
    }

    #[tokio::test]
    async fn single_round_backs_up_everything() {
        let sim = SimCluster::builder().nodes(3).splits(&["k030", "k060"]).rows(90).build();
        let mut tree = whole_tree();
        let regions = Arc::new(AtomicUsize::new(0));
        let counter = regions.clone();
        let mut controller = RoundController::new(sim.cluster(), fast_config(), request())
            .with_progress(Arc::new(move |unit: ProgressUnit| {
                if unit == ProgressUnit::Region {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }));

        controller
            .run(&mut tree, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tree.remaining_count(), 0);
        assert_eq!(controller.stats().rounds, 1);
        assert_eq!(regions.load(Ordering::SeqCst), 3);
        assert_eq!(tree.checksum(1), Some(sim.expected_checksum(&KeyRange::default())));
        assert_eq!(controller.api_version(), Some(ApiVersion::V1));
    }

    #[tokio::test]
    async fn dead_node_is_skipped_until_it_comes_back() {
        let sim = SimCluster::builder().nodes(2).splits(&["k050"]).rows(100).build();
        sim.set_node_state(2, NodeState::Offline);
        let mut tree = whole_tree();
        let mut controller = RoundController::new(sim.cluster(), fast_config(), request());

        let cancel = CancellationToken::new();
        let revive = {
            let sim = sim.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                sim.set_node_state(2, NodeState::Up);
            })
        };
        controller.run(&mut tree, &cancel).await.unwrap();
        revive.await.unwrap();
        assert_eq!(tree.remaining_count(), 0);
        assert!(controller.stats().rounds >= 2);
        assert!(sim.backup_calls(2) > 0);
    }

    #[tokio::test]
    async fn round_limit_stops_a_stuck_job() {
        let sim = SimCluster::builder().nodes(1).rows(10).build();
        sim.set_node_state(1, NodeState::Down);
        let mut tree = whole_tree();
        let config = RoundConfig {
            max_rounds: 3,
            ..fast_config()
        };
        let mut controller = RoundController::new(sim.cluster(), config, request());
        let err = controller
            .run(&mut tree, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::RoundLimit(3)));
    }

    #[tokio::test]
    async fn stale_retry_signal_is_ignored() {
        let sim = SimCluster::builder().nodes(1).rows(10).build();
        let mut tree = whole_tree();
        let mut controller = RoundController::new(sim.cluster(), fast_config(), request());
        controller
            .notifier()
            .send(RetrySignal::RetryNode {
                node_id: 1,
                round: 0,
            })
            .await
            .unwrap();
        controller
            .run(&mut tree, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(controller.stats().node_retries, 0);
        assert_eq!(controller.stats().round_restarts, 0);
    }

    #[tokio::test]
    async fn transport_failure_forces_reconnect_after_lock_round() {
        let sim = SimCluster::builder().nodes(1).rows(10).build();
        sim.inject_lock("k001", 41);
        sim.fail_transport(1, 1);
        let mut tree = whole_tree();
        let mut controller = RoundController::new(sim.cluster(), fast_config(), request());

        controller
            .run(&mut tree, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tree.remaining_count(), 0);
        let stats = controller.stats();
        assert_eq!(stats.node_retries, 1);
        assert_eq!(stats.rounds, 2);
        assert!(stats.lock_conflicts >= 1);
        // Round one saw a broken stream besides the lock, so round two
        // must not reuse the connection.
        assert_eq!(sim.connects(), vec![(1, true), (1, true), (1, true)]);
    }
}
