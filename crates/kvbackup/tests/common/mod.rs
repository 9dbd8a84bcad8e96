//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kvbackup::sim::SimCluster;
use kvbackup::{
    BackupConfig, BackupError, BackupJob, BackupStorage, BackupSummary, KeyRange, LocalStorage,
    ProgressUnit, RangeBackup,
};
use tokio_util::sync::CancellationToken;

/// Upper bound for a whole simulated backup.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Config with short delays so rounds turn over quickly.
pub fn fast_config() -> BackupConfig {
    BackupConfig {
        round_delay_ms: 1,
        topology_poll_ms: 10,
        checkpoint: false,
        ..BackupConfig::default()
    }
}

/// Two tables splitting the key space at `k050`.
pub fn two_tables() -> Vec<(KeyRange, i64)> {
    vec![
        (KeyRange::new(Vec::new(), b"k050".to_vec()), 100),
        (KeyRange::new(b"k050".to_vec(), Vec::new()), 101),
    ]
}

pub fn local_storage(dir: &Path) -> Arc<dyn BackupStorage> {
    Arc::new(LocalStorage::new(dir))
}

/// Counts of progress callbacks seen during a run.
#[derive(Clone, Default)]
pub struct ProgressCounts {
    pub ranges: Arc<AtomicU64>,
    pub regions: Arc<AtomicU64>,
}

impl ProgressCounts {
    pub fn ranges(&self) -> u64 {
        self.ranges.load(Ordering::SeqCst)
    }

    pub fn regions(&self) -> u64 {
        self.regions.load(Ordering::SeqCst)
    }
}

/// Open a job on `dest`, pick the snapshot and start checkpointing the way
/// a driver would.
pub async fn prepare_job(
    dest: &Path,
    config: BackupConfig,
    sim: &SimCluster,
    ranges: &[(KeyRange, i64)],
) -> anyhow::Result<(BackupJob, u64)> {
    let mut job = BackupJob::open(local_storage(dest), config)?;
    let backup_ts = job.resolve_snapshot_ts(sim, Duration::ZERO, None).await?;
    let config_hash = job.config_hash(ranges, backup_ts)?;
    job.check_config_hash(&config_hash)?;
    job.write_lock_file()?;
    job.start_checkpoint(config_hash, backup_ts)?;
    Ok((job, backup_ts))
}

/// Run `ranges` to completion (or failure) and flush the checkpoint.
pub async fn run_ranges(
    job: &BackupJob,
    backup_ts: u64,
    sim: &SimCluster,
    ranges: &[(KeyRange, i64)],
    progress: &ProgressCounts,
    cancel: &CancellationToken,
) -> Result<BackupSummary, BackupError> {
    let counts = progress.clone();
    let target = RangeBackup::new(ranges.to_vec(), job.request_template(sim.cluster_id(), backup_ts))
        .with_progress(Arc::new(move |unit: ProgressUnit| {
            let counter = match unit {
                ProgressUnit::Range => &counts.ranges,
                ProgressUnit::Region => &counts.regions,
            };
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    let result = tokio::time::timeout(TEST_TIMEOUT, job.backup_ranges(sim.cluster(), target, cancel))
        .await
        .expect("backup timed out");
    job.finish_checkpoint(true)
        .await
        .expect("flush checkpoint log");
    result
}

/// Full run against a fresh destination.
pub async fn backup_all(
    dest: &Path,
    config: BackupConfig,
    sim: &SimCluster,
    ranges: &[(KeyRange, i64)],
) -> Result<BackupSummary, BackupError> {
    let (job, backup_ts) = prepare_job(dest, config, sim, ranges)
        .await
        .expect("prepare backup job");
    run_ranges(
        &job,
        backup_ts,
        sim,
        ranges,
        &ProgressCounts::default(),
        &CancellationToken::new(),
    )
    .await
}

/// Assert every table checksum matches the simulated data.
pub fn assert_checksums(summary: &BackupSummary, sim: &SimCluster, ranges: &[(KeyRange, i64)]) {
    for (range, physical_id) in ranges {
        assert_eq!(
            summary.checksums.get(physical_id),
            Some(&sim.expected_checksum(range)),
            "checksum of table {physical_id} ({range:?})"
        );
    }
}
