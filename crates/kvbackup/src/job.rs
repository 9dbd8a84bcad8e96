//! Backup job bootstrap and execution.
//!
//! A job claims a destination, decides whether it resumes a previous run,
//! picks the snapshot timestamp, opens the checkpoint log and then drives
//! the round controller over the requested ranges.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kvbackup_rtree::rtree::{ChecksumStats, CompletedRange, CompletionCallback, KeyRange, ProgressRangeTree};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{
    save_metadata, CheckpointLog, CheckpointLogOptions, CheckpointMetadata, FileCheckpointLog,
};
use crate::cluster::{BackupCluster, ClusterMembership};
use crate::config::{job_config_hash, BackupConfig};
use crate::controller::{ControllerStats, RoundConfig, RoundController};
use crate::errors::BackupError;
use crate::storage::{check_storage_not_in_use, write_lock_file, BackupStorage, CHECKPOINT_DATA_DIR};
use crate::topology::spawn_topology_watcher;
use crate::types::{noop_progress, ApiVersion, BackupRequest, ProgressCallback, ProgressUnit};

/// Bits of a timestamp holding the logical counter.
pub const TSO_LOGICAL_BITS: u32 = 18;
const TSO_LOGICAL_MASK: u64 = (1 << TSO_LOGICAL_BITS) - 1;
const TSO_MAX_PHYSICAL_MS: u64 = u64::MAX >> TSO_LOGICAL_BITS;

/// Build a timestamp from wall-clock milliseconds and a logical counter.
pub fn compose_ts(physical_ms: u64, logical: u64) -> anyhow::Result<u64> {
    anyhow::ensure!(
        physical_ms <= TSO_MAX_PHYSICAL_MS,
        "physical time {physical_ms} does not fit a timestamp"
    );
    anyhow::ensure!(
        logical <= TSO_LOGICAL_MASK,
        "logical counter {logical} does not fit a timestamp"
    );
    Ok((physical_ms << TSO_LOGICAL_BITS) | logical)
}

pub fn extract_physical(ts: u64) -> u64 {
    ts >> TSO_LOGICAL_BITS
}

pub fn extract_logical(ts: u64) -> u64 {
    ts & TSO_LOGICAL_MASK
}

/// Ranges to back up plus the hooks observing the run.
pub struct RangeBackup {
    /// Requested ranges and the physical table id each belongs to.
    pub ranges: Vec<(KeyRange, i64)>,
    pub request: BackupRequest,
    pub progress: ProgressCallback,
    pub on_range_complete: Option<CompletionCallback>,
}

impl RangeBackup {
    pub fn new(ranges: Vec<(KeyRange, i64)>, request: BackupRequest) -> Self {
        Self {
            ranges,
            request,
            progress: noop_progress(),
            on_range_complete: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    /// Called with the files of every range once it is fully backed up.
    pub fn on_range_complete(mut self, callback: CompletionCallback) -> Self {
        self.on_range_complete = Some(callback);
        self
    }
}

/// What a finished backup produced.
#[derive(Debug)]
pub struct BackupSummary {
    /// Aggregated checksum per physical table id.
    pub checksums: BTreeMap<i64, ChecksumStats>,
    pub api_version: Option<ApiVersion>,
    /// Completions restored from the checkpoint log before the first round.
    pub replayed: usize,
    pub stats: ControllerStats,
}

/// A backup job bound to one destination.
pub struct BackupJob {
    storage: Arc<dyn BackupStorage>,
    config: BackupConfig,
    resumed: Option<CheckpointMetadata>,
    safepoint_id: String,
    checkpoint: Option<Arc<FileCheckpointLog>>,
}

impl BackupJob {
    /// Check the destination and load the metadata of a previous run.
    pub fn open(storage: Arc<dyn BackupStorage>, config: BackupConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let resumed = check_storage_not_in_use(storage.as_ref())?;
        if resumed.is_some() && !config.checkpoint {
            anyhow::bail!(
                "{} holds checkpoint metadata of an earlier backup but checkpointing is disabled",
                storage.uri()
            );
        }
        let safepoint_id = match &resumed {
            Some(meta) => meta.gc_service_id.clone(),
            None => format!("kvbackup-{:016x}", rand::random::<u64>()),
        };
        Ok(Self {
            storage,
            config,
            resumed,
            safepoint_id,
            checkpoint: None,
        })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Metadata of the run this job resumes, if any.
    pub fn resumed(&self) -> Option<&CheckpointMetadata> {
        self.resumed.as_ref()
    }

    /// Service id under which the job holds the GC safepoint.
    pub fn safepoint_id(&self) -> &str {
        &self.safepoint_id
    }

    pub fn config_hash(&self, ranges: &[(KeyRange, i64)], backup_ts: u64) -> anyhow::Result<Vec<u8>> {
        job_config_hash(&self.config, ranges, backup_ts)
    }

    /// A resumed job must run with the configuration it was started with.
    pub fn check_config_hash(&self, config_hash: &[u8]) -> anyhow::Result<()> {
        if let Some(meta) = &self.resumed {
            anyhow::ensure!(
                meta.config_hash == config_hash,
                "backup configuration differs from the checkpoint in {}; \
                 use a new destination or the original configuration",
                self.storage.uri()
            );
        }
        Ok(())
    }

    /// Snapshot timestamp to export at.
    ///
    /// A resumed job keeps its timestamp. Otherwise `explicit_ts` wins, then
    /// the current cluster time moved back by `timeago`. The result must not
    /// be older than the GC safe point.
    pub async fn resolve_snapshot_ts(
        &self,
        membership: &dyn ClusterMembership,
        timeago: Duration,
        explicit_ts: Option<u64>,
    ) -> anyhow::Result<u64> {
        if let Some(meta) = &self.resumed {
            tracing::info!(backup_ts = meta.backup_ts, "reusing snapshot ts from checkpoint");
            return Ok(meta.backup_ts);
        }
        let ts = match explicit_ts.filter(|ts| *ts > 0) {
            Some(ts) => ts,
            None => {
                let now = membership.current_ts().await.context("get current ts")?;
                let ago_ms = u64::try_from(timeago.as_millis()).unwrap_or(u64::MAX);
                if ago_ms == 0 {
                    now
                } else {
                    let physical = extract_physical(now);
                    anyhow::ensure!(physical > ago_ms, "backup ts overflow: timeago {timeago:?} is too far back");
                    compose_ts(physical - ago_ms, extract_logical(now))?
                }
            }
        };
        let safe_point = membership.gc_safe_point().await.context("get gc safe point")?;
        anyhow::ensure!(
            ts >= safe_point,
            "backup ts {ts} is older than the GC safe point {safe_point}"
        );
        tracing::info!(backup_ts = ts, safe_point, "snapshot ts resolved");
        Ok(ts)
    }

    /// Request template for this job at `backup_ts`.
    pub fn request_template(&self, cluster_id: u64, backup_ts: u64) -> BackupRequest {
        BackupRequest {
            cluster_id,
            start_version: 0,
            end_version: backup_ts,
            rate_limit: self.config.rate_limit,
            replica_read: !self.config.replica_read_label.is_empty(),
            ..BackupRequest::default()
        }
    }

    pub fn write_lock_file(&self) -> anyhow::Result<()> {
        write_lock_file(self.storage.as_ref())
    }

    /// Persist metadata for a fresh job and open the checkpoint log.
    pub fn start_checkpoint(&mut self, config_hash: Vec<u8>, backup_ts: u64) -> anyhow::Result<()> {
        if !self.config.checkpoint {
            return Ok(());
        }
        if self.resumed.is_none() {
            let meta = CheckpointMetadata {
                gc_service_id: self.safepoint_id.clone(),
                config_hash,
                backup_ts,
            };
            save_metadata(self.storage.as_ref(), &meta)?;
        }
        let dir = self
            .storage
            .local_path(CHECKPOINT_DATA_DIR)
            .with_context(|| format!("checkpoint log needs a local destination, got {}", self.storage.uri()))?;
        let log = FileCheckpointLog::open_dir(&dir, CheckpointLogOptions::from_env())?;
        tracing::info!(path = %log.path().display(), "checkpoint log opened");
        self.checkpoint = Some(Arc::new(log));
        Ok(())
    }

    /// Flush outstanding checkpoint records.
    pub async fn finish_checkpoint(&self, flush: bool) -> anyhow::Result<()> {
        match &self.checkpoint {
            Some(log) => log.drain(flush).await,
            None => Ok(()),
        }
    }

    /// Back up `target` against `cluster` until every range is complete.
    pub async fn backup_ranges(
        &self,
        cluster: BackupCluster,
        target: RangeBackup,
        cancel: &CancellationToken,
    ) -> Result<BackupSummary, BackupError> {
        let RangeBackup {
            ranges,
            request,
            progress,
            mut on_range_complete,
        } = target;

        let mut tree = ProgressRangeTree::new();
        tree.set_skip_checksum(self.config.skip_checksum);
        for (range, physical_id) in ranges {
            tree.insert(range, physical_id).map_err(BackupError::Internal)?;
        }
        let range_progress = progress.clone();
        tree.set_completion_callback(Box::new(move |done: CompletedRange| {
            range_progress(ProgressUnit::Range);
            if let Some(callback) = on_range_complete.as_mut() {
                callback(done);
            }
        }));

        let replayed = match &self.checkpoint {
            Some(log) => replay_checkpoint(log.as_ref(), &mut tree, &progress)?,
            None => 0,
        };

        let round_config = RoundConfig::from_config(&self.config).map_err(BackupError::Internal)?;
        let mut controller =
            RoundController::new(cluster.clone(), round_config, request).with_progress(progress);
        if let Some(log) = &self.checkpoint {
            controller = controller.with_checkpoint(log.clone());
        }

        let watcher_cancel = cancel.child_token();
        let watcher = spawn_topology_watcher(
            cluster.membership.clone(),
            controller.notifier(),
            self.config.topology_poll(),
            watcher_cancel.clone(),
        );
        let result = controller.run(&mut tree, cancel).await;
        watcher_cancel.cancel();
        if let Err(err) = watcher.await {
            tracing::warn!(error = ?err, "topology watcher task failed");
        }
        result?;

        let remaining = tree.remaining_count();
        if remaining > 0 {
            return Err(BackupError::Incomplete { remaining });
        }
        let stats = controller.stats();
        tracing::info!(
            rounds = stats.rounds,
            results = stats.results_applied,
            replayed,
            "backup ranges completed"
        );
        Ok(BackupSummary {
            checksums: tree.into_checksum_map(),
            api_version: controller.api_version(),
            replayed,
            stats,
        })
    }
}

/// Re-apply logged completions to a fresh tree.
fn replay_checkpoint(
    log: &dyn CheckpointLog,
    tree: &mut ProgressRangeTree,
    progress: &ProgressCallback,
) -> Result<usize, BackupError> {
    let records = log.load().map_err(BackupError::Checkpoint)?;
    let mut replayed = 0;
    for record in records {
        match tree.find_contained(&record.start_key, &record.end_key) {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(
                    start = %record.start_key.escape_ascii(),
                    "checkpoint record outside the requested ranges, skipping"
                );
                continue;
            }
            Err(err) => return Err(BackupError::Checkpoint(err.context("replay checkpoint record"))),
        }
        tree.apply_completion(&record.start_key, &record.end_key, record.files)
            .map_err(|err| BackupError::Checkpoint(err.context("replay checkpoint record")))?;
        replayed += 1;
        progress(ProgressUnit::Region);
    }
    if replayed > 0 {
        tracing::info!(replayed, remaining = tree.remaining_count(), "replayed checkpoint log");
    }
    Ok(replayed)
}
