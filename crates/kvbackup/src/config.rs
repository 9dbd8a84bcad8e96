//! Job configuration.
//!
//! `BackupConfig` is a clap argument group so binaries can flatten it into
//! their CLI; every option can also be set through a `KVBACKUP_*` environment
//! variable. Checkpoint log tuning is read from the environment only.

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use kvbackup_rtree::rtree::KeyRange;
use serde::Serialize;

use crate::admission::DEFAULT_RANGE_LIMIT;
use crate::cluster::parse_label_filter;
use crate::errors::DEFAULT_ERROR_RETRY_LIMIT;

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_ROUND_DELAY_MS: u64 = 200;
const DEFAULT_INCOMPLETE_REFRESH_MS: u64 = 15_000;
const DEFAULT_LOCK_RESOLVE_MAX_BACKOFF_MS: u64 = 600_000;
const DEFAULT_TOPOLOGY_POLL_MS: u64 = 10_000;

/// Options controlling a backup job.
#[derive(clap::Args, Clone, Debug, Serialize)]
pub struct BackupConfig {
    /// Concurrent request units per storage node.
    #[arg(long, env = "KVBACKUP_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Cap on sub-ranges in flight across all nodes.
    #[arg(long, env = "KVBACKUP_RANGE_LIMIT", default_value_t = DEFAULT_RANGE_LIMIT)]
    pub range_limit: u32,

    /// Only back up from nodes carrying these labels, e.g. `zone=z1,disk=ssd`.
    ///
    /// Empty selects every node.
    #[arg(long, env = "KVBACKUP_REPLICA_READ_LABEL", default_value = "")]
    pub replica_read_label: String,

    /// Per-node export rate limit in bytes per second (0 = unlimited).
    #[arg(long, env = "KVBACKUP_RATE_LIMIT", default_value_t = 0)]
    pub rate_limit: u64,

    /// Pause between rounds (ms).
    #[arg(long, env = "KVBACKUP_ROUND_DELAY_MS", default_value_t = DEFAULT_ROUND_DELAY_MS)]
    pub round_delay_ms: u64,

    /// Floor for the period at which in-flight requests are narrowed to the
    /// still-incomplete ranges (ms).
    #[arg(
        long,
        env = "KVBACKUP_INCOMPLETE_REFRESH_MS",
        default_value_t = DEFAULT_INCOMPLETE_REFRESH_MS
    )]
    pub incomplete_refresh_ms: u64,

    /// Total backoff budget for one lock resolution call (ms).
    #[arg(
        long,
        env = "KVBACKUP_LOCK_RESOLVE_MAX_BACKOFF_MS",
        default_value_t = DEFAULT_LOCK_RESOLVE_MAX_BACKOFF_MS
    )]
    pub lock_resolve_max_backoff_ms: u64,

    /// Membership polling interval for topology change detection (ms).
    #[arg(long, env = "KVBACKUP_TOPOLOGY_POLL_MS", default_value_t = DEFAULT_TOPOLOGY_POLL_MS)]
    pub topology_poll_ms: u64,

    /// Unknown errors tolerated per node per round before giving up.
    #[arg(
        long,
        env = "KVBACKUP_ERROR_RETRY_LIMIT",
        default_value_t = DEFAULT_ERROR_RETRY_LIMIT
    )]
    pub error_retry_limit: u32,

    /// Stop after this many rounds (0 = keep retrying until done).
    #[arg(long, env = "KVBACKUP_MAX_ROUNDS", default_value_t = 0)]
    pub max_rounds: u64,

    /// Do not accumulate per-table checksums.
    #[arg(long, env = "KVBACKUP_SKIP_CHECKSUM")]
    pub skip_checksum: bool,

    /// Persist completed ranges so an interrupted job can resume.
    #[arg(
        long,
        env = "KVBACKUP_CHECKPOINT_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub checkpoint: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            range_limit: DEFAULT_RANGE_LIMIT,
            replica_read_label: String::new(),
            rate_limit: 0,
            round_delay_ms: DEFAULT_ROUND_DELAY_MS,
            incomplete_refresh_ms: DEFAULT_INCOMPLETE_REFRESH_MS,
            lock_resolve_max_backoff_ms: DEFAULT_LOCK_RESOLVE_MAX_BACKOFF_MS,
            topology_poll_ms: DEFAULT_TOPOLOGY_POLL_MS,
            error_retry_limit: DEFAULT_ERROR_RETRY_LIMIT,
            max_rounds: 0,
            skip_checksum: false,
            checkpoint: true,
        }
    }
}

impl BackupConfig {
    /// Parsed replica-read label filter.
    pub fn label_filter(&self) -> anyhow::Result<BTreeMap<String, String>> {
        parse_label_filter(&self.replica_read_label)
    }

    pub fn round_delay(&self) -> Duration {
        Duration::from_millis(self.round_delay_ms)
    }

    pub fn incomplete_refresh(&self) -> Duration {
        Duration::from_millis(self.incomplete_refresh_ms)
    }

    pub fn lock_resolve_max_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_resolve_max_backoff_ms)
    }

    pub fn topology_poll(&self) -> Duration {
        Duration::from_millis(self.topology_poll_ms.max(1))
    }

    /// Reject values the coordinator cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.concurrency > 0, "concurrency must be at least 1");
        anyhow::ensure!(self.range_limit > 0, "range limit must be at least 1");
        self.label_filter().context("replica read label")?;
        Ok(())
    }
}

/// Hash identifying a job; resuming requires the same ranges, snapshot and
/// export-affecting options.
pub fn job_config_hash(
    config: &BackupConfig,
    ranges: &[(KeyRange, i64)],
    backup_ts: u64,
) -> anyhow::Result<Vec<u8>> {
    #[derive(Serialize)]
    struct HashedJob<'a> {
        replica_read_label: &'a str,
        skip_checksum: bool,
        backup_ts: u64,
        ranges: Vec<(&'a [u8], &'a [u8], i64)>,
    }
    let job = HashedJob {
        replica_read_label: &config.replica_read_label,
        skip_checksum: config.skip_checksum,
        backup_ts,
        ranges: ranges
            .iter()
            .map(|(range, id)| (range.start.as_slice(), range.end.as_slice(), *id))
            .collect(),
    };
    let bytes = serde_json::to_vec(&job).context("serialize job config")?;
    Ok(crc32fast::hash(&bytes).to_be_bytes().to_vec())
}

/// Read an env var as u64 with a default.
pub(crate) fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}

/// Read an env var as usize with a default.
pub(crate) fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        backup: BackupConfig,
    }

    #[test]
    fn cli_defaults_match_default_impl() {
        let parsed = Cli::parse_from(["kvbackup"]).backup;
        let default = BackupConfig::default();
        assert_eq!(parsed.concurrency, default.concurrency);
        assert_eq!(parsed.range_limit, 30_000_000);
        assert_eq!(parsed.round_delay(), Duration::from_millis(200));
        assert_eq!(parsed.incomplete_refresh(), Duration::from_secs(15));
        assert_eq!(parsed.lock_resolve_max_backoff(), Duration::from_secs(600));
        assert_eq!(parsed.error_retry_limit, 10);
        assert!(parsed.checkpoint);
        assert!(!parsed.skip_checksum);

        let disabled = Cli::parse_from(["kvbackup", "--checkpoint", "false"]).backup;
        assert!(!disabled.checkpoint);
    }

    #[test]
    fn validate_rejects_bad_label() {
        let config = BackupConfig {
            replica_read_label: "zone".to_string(),
            ..BackupConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(BackupConfig::default().validate().is_ok());
    }

    #[test]
    fn config_hash_tracks_ranges_and_snapshot() {
        let config = BackupConfig::default();
        let ranges = vec![(KeyRange::new(b"a".to_vec(), b"b".to_vec()), 1)];
        let base = job_config_hash(&config, &ranges, 10).unwrap();
        assert_eq!(base, job_config_hash(&config, &ranges, 10).unwrap());
        assert_ne!(base, job_config_hash(&config, &ranges, 11).unwrap());
        let wider = vec![(KeyRange::new(b"a".to_vec(), b"c".to_vec()), 1)];
        assert_ne!(base, job_config_hash(&config, &wider, 10).unwrap());
    }
}
