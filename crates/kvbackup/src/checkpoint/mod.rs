//! Crash-resume state for backup jobs.
//!
//! `log` holds the append-only completion log replayed on restart, `meta`
//! holds the small metadata object that pins the snapshot timestamp, GC
//! safepoint service id and job configuration hash of a resumable job.

mod log;
mod meta;

use async_trait::async_trait;
use kvbackup_rtree::rtree::BackupFile;

pub use log::{CheckpointLogOptions, CheckpointStatsSnapshot, FileCheckpointLog, SyncMode};
pub use meta::{
    decode_metadata, encode_metadata, load_metadata, save_metadata, CheckpointMetadata,
};

/// One completed interval as written to the checkpoint log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub files: Vec<BackupFile>,
}

/// Durable log of completed intervals.
///
/// `append` returns only after the record has been handed to the log's
/// writer and the write has succeeded, so a caller that marks a range
/// complete after `append` returns never gets ahead of the log.
#[async_trait]
pub trait CheckpointLog: Send + Sync + 'static {
    async fn append(&self, record: CheckpointRecord) -> anyhow::Result<()>;

    /// Wait until everything appended so far is written; with `flush`, also
    /// force it to stable storage.
    async fn drain(&self, flush: bool) -> anyhow::Result<()>;

    /// Read every record in append order.
    fn load(&self) -> anyhow::Result<Vec<CheckpointRecord>>;
}
