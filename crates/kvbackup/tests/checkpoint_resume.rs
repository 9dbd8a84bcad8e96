//! Checkpoint and resume across process lifetimes.
//!
//! Test flow:
//! 1) Run a checkpointed backup and cancel it after a few results landed.
//! 2) Drop the job (the process "exits") and reopen the same destination.
//! 3) Verify the second job resumes with the first job's snapshot and
//!    safepoint, replays the logged completions and finishes with the
//!    same checksums as an uninterrupted run.
//!
//! Also covers the destination checks that refuse to resume.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{assert_checksums, fast_config, local_storage, two_tables, ProgressCounts};
use kvbackup::sim::SimCluster;
use kvbackup::{BackupConfig, BackupError, BackupJob, KeyRange, ProgressUnit, RangeBackup};
use tokio_util::sync::CancellationToken;

fn checkpointed() -> BackupConfig {
    BackupConfig {
        checkpoint: true,
        concurrency: 1,
        ..fast_config()
    }
}

fn many_regions() -> SimCluster {
    SimCluster::builder()
        .nodes(2)
        .splits(&["k010", "k020", "k030", "k040", "k050", "k060", "k070", "k080", "k090"])
        .rows(100)
        .build()
}

/// Run until `stop_after` regions completed, then cancel.
async fn interrupted_run(
    dest: &std::path::Path,
    sim: &SimCluster,
    ranges: &[(KeyRange, i64)],
    stop_after: u64,
) -> (String, u64) {
    let (job, backup_ts) = common::prepare_job(dest, checkpointed(), sim, ranges)
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let regions = Arc::new(AtomicU64::new(0));
    let target = RangeBackup::new(ranges.to_vec(), job.request_template(sim.cluster_id(), backup_ts))
        .with_progress(Arc::new(move |unit: ProgressUnit| {
            if unit == ProgressUnit::Region
                && regions.fetch_add(1, Ordering::SeqCst) + 1 >= stop_after
            {
                trigger.cancel();
            }
        }));

    let result = tokio::time::timeout(
        common::TEST_TIMEOUT,
        job.backup_ranges(sim.cluster(), target, &cancel),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(BackupError::Cancelled)), "{result:?}");
    job.finish_checkpoint(true).await.unwrap();
    (job.safepoint_id().to_string(), backup_ts)
}

#[tokio::test]
async fn interrupted_backup_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let sim = many_regions();
    sim.set_response_delay(Duration::from_millis(5));
    let ranges = two_tables();

    let (safepoint_id, first_ts) = interrupted_run(dir.path(), &sim, &ranges, 2).await;

    let (job, backup_ts) = common::prepare_job(dir.path(), checkpointed(), &sim, &ranges)
        .await
        .unwrap();
    let resumed = job.resumed().expect("resumed from checkpoint metadata");
    assert_eq!(resumed.backup_ts, first_ts);
    assert_eq!(backup_ts, first_ts);
    assert_eq!(job.safepoint_id(), safepoint_id);

    let progress = ProgressCounts::default();
    let summary = common::run_ranges(
        &job,
        backup_ts,
        &sim,
        &ranges,
        &progress,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(summary.replayed >= 2, "replayed {}", summary.replayed);
    assert_checksums(&summary, &sim, &ranges);
    assert_eq!(progress.ranges(), 2);
}

#[tokio::test]
async fn resume_with_other_ranges_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let sim = many_regions();
    sim.set_response_delay(Duration::from_millis(5));
    let ranges = two_tables();
    interrupted_run(dir.path(), &sim, &ranges, 1).await;

    let job = BackupJob::open(local_storage(dir.path()), checkpointed()).unwrap();
    let backup_ts = job
        .resolve_snapshot_ts(&sim, Duration::ZERO, None)
        .await
        .unwrap();
    let narrower = vec![(KeyRange::new(Vec::new(), b"k050".to_vec()), 100)];
    let hash = job.config_hash(&narrower, backup_ts).unwrap();
    let err = job.check_config_hash(&hash).unwrap_err();
    assert!(err.to_string().contains("configuration differs"), "{err:#}");
}

#[tokio::test]
async fn resume_without_checkpointing_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let sim = many_regions();
    sim.set_response_delay(Duration::from_millis(5));
    interrupted_run(dir.path(), &sim, &two_tables(), 1).await;

    let err = BackupJob::open(local_storage(dir.path()), fast_config())
        .err()
        .expect("open must fail");
    assert!(err.to_string().contains("checkpointing is disabled"), "{err:#}");
}

#[tokio::test]
async fn leftover_data_without_metadata_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let storage = local_storage(dir.path());
    kvbackup::storage::write_lock_file(storage.as_ref()).unwrap();
    storage.write_file("1_3_6b303130.sst", b"data").unwrap();

    let err = BackupJob::open(storage, checkpointed())
        .err()
        .expect("open must fail");
    assert!(err.to_string().contains("no checkpoint metadata"), "{err:#}");
}
