//! Run a backup job against an in-process simulated cluster.
//!
//! Useful to watch the round controller deal with faults:
//!
//! ```text
//! kvbackup-sim --dest /tmp/bk --nodes 3 --rows 500 --tables 4 \
//!     --fail-transport 2:1 --lock k120@31 --restart-node 1
//! ```
//!
//! Re-running with the same `--dest` after an interruption resumes from the
//! checkpoint.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kvbackup::sim::SimCluster;
use kvbackup::{
    BackupConfig, BackupJob, BackupStorage, CompletedRange, KeyRange, LocalStorage, ProgressUnit,
    RangeBackup,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "kvbackup-sim")]
#[command(about = "Back up a simulated key-value cluster", long_about = None)]
struct Args {
    /// Destination directory for the lock marker and checkpoint.
    #[arg(long)]
    dest: PathBuf,

    /// Number of storage nodes.
    #[arg(long, default_value_t = 3)]
    nodes: u64,

    /// Number of rows in the simulated key space.
    #[arg(long, default_value_t = 300)]
    rows: usize,

    /// Number of regions the key space is split into.
    #[arg(long, default_value_t = 6)]
    regions: usize,

    /// Number of tables (backup ranges) the key space is split into.
    #[arg(long, default_value_t = 2)]
    tables: usize,

    /// Back up the snapshot this far in the past (seconds).
    #[arg(long, default_value_t = 0)]
    timeago_secs: u64,

    /// Explicit snapshot timestamp; overrides `--timeago-secs`.
    #[arg(long)]
    backup_ts: Option<u64>,

    /// Break the next backup stream of a node, as `node:times`.
    #[arg(long)]
    fail_transport: Vec<String>,

    /// Leave a lock on a key, as `key@txn_version`.
    #[arg(long)]
    lock: Vec<String>,

    /// Restart this node shortly after the job starts.
    #[arg(long)]
    restart_node: Option<u64>,

    /// Delay before every streamed response (ms).
    #[arg(long, default_value_t = 0)]
    response_delay_ms: u64,

    #[command(flatten)]
    backup: BackupConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let sim = build_cluster(&args)?;
    let ranges = table_ranges(args.rows, args.tables);

    let storage: Arc<dyn BackupStorage> = Arc::new(LocalStorage::new(&args.dest));
    let mut job = BackupJob::open(storage, args.backup.clone())?;
    let backup_ts = job
        .resolve_snapshot_ts(&sim, Duration::from_secs(args.timeago_secs), args.backup_ts)
        .await?;
    let config_hash = job.config_hash(&ranges, backup_ts)?;
    job.check_config_hash(&config_hash)?;
    job.write_lock_file()?;
    job.start_checkpoint(config_hash, backup_ts)?;

    let completed_ranges = Arc::new(AtomicU64::new(0));
    let applied_regions = Arc::new(AtomicU64::new(0));
    let progress = {
        let completed_ranges = completed_ranges.clone();
        let applied_regions = applied_regions.clone();
        Arc::new(move |unit: ProgressUnit| {
            let counter = match unit {
                ProgressUnit::Range => &completed_ranges,
                ProgressUnit::Region => &applied_regions,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        })
    };
    let target = RangeBackup::new(
        ranges.clone(),
        job.request_template(sim.cluster_id(), backup_ts),
    )
    .with_progress(progress)
    .on_range_complete(Box::new(|done: CompletedRange| {
        tracing::info!(
            range = ?done.origin,
            physical_id = done.physical_id,
            files = done.files.len(),
            "range backed up"
        );
    }));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping backup");
                cancel.cancel();
            }
        });
    }
    if let Some(node_id) = args.restart_node {
        let sim = sim.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tracing::info!(node_id, "restarting simulated node");
            sim.restart_node(node_id);
        });
    }

    let result = job.backup_ranges(sim.cluster(), target, &cancel).await;
    job.finish_checkpoint(true).await?;
    let summary = result?;

    let mut tables = Vec::new();
    for (range, physical_id) in &ranges {
        let got = summary.checksums.get(physical_id).copied().unwrap_or_default();
        let want = sim.expected_checksum(range);
        if !args.backup.skip_checksum && got != want {
            anyhow::bail!("checksum mismatch for table {physical_id}: got {got:?}, want {want:?}");
        }
        tables.push(serde_json::json!({
            "physical_id": physical_id,
            "total_kvs": got.total_kvs,
            "total_bytes": got.total_bytes,
            "crc64_xor": got.crc64_xor,
        }));
    }
    let report = serde_json::json!({
        "backup_ts": backup_ts,
        "safepoint_id": job.safepoint_id(),
        "rounds": summary.stats.rounds,
        "node_retries": summary.stats.node_retries,
        "round_restarts": summary.stats.round_restarts,
        "replayed": summary.replayed,
        "ranges_completed": completed_ranges.load(Ordering::Relaxed),
        "regions_applied": applied_regions.load(Ordering::Relaxed),
        "tables": tables,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn build_cluster(args: &Args) -> anyhow::Result<SimCluster> {
    let regions = args.regions.max(1);
    let splits: Vec<String> = (1..regions)
        .map(|i| format!("k{:03}", i * args.rows / regions))
        .collect();
    let split_refs: Vec<&str> = splits.iter().map(String::as_str).collect();
    let sim = SimCluster::builder()
        .nodes(args.nodes)
        .splits(&split_refs)
        .rows(args.rows)
        .build();

    for raw in &args.fail_transport {
        let (node, times) = raw
            .split_once(':')
            .with_context(|| format!("invalid --fail-transport {raw:?}, expected node:times"))?;
        sim.fail_transport(node.parse()?, times.parse()?);
    }
    for raw in &args.lock {
        let (key, version) = raw
            .split_once('@')
            .with_context(|| format!("invalid --lock {raw:?}, expected key@version"))?;
        sim.inject_lock(key, version.parse()?);
    }
    if args.response_delay_ms > 0 {
        sim.set_response_delay(Duration::from_millis(args.response_delay_ms));
    }
    Ok(sim)
}

/// Split the key space into `tables` contiguous ranges with ids from 100.
fn table_ranges(rows: usize, tables: usize) -> Vec<(KeyRange, i64)> {
    let tables = tables.max(1);
    let mut interior: Vec<Vec<u8>> = (1..tables)
        .map(|i| format!("k{:03}", i * rows / tables).into_bytes())
        .collect();
    interior.dedup();
    let mut bounds = vec![Vec::new()];
    bounds.extend(interior);
    bounds.push(Vec::new());
    bounds
        .windows(2)
        .enumerate()
        .map(|(i, pair)| (KeyRange::new(pair[0].clone(), pair[1].clone()), 100 + i as i64))
        .collect()
}
