//! Coordinator for point-in-time backups of a sharded key-value cluster.
//!
//! A [`BackupJob`] tracks the requested key ranges in a progress tree and
//! drives rounds of per-node backup streams until every range is covered.
//! Node failures and topology changes are retried without starting over,
//! lock conflicts are resolved in batches between rounds, and completed
//! ranges can be checkpointed so an interrupted job resumes where it stopped.
//!
//! Cluster access goes through the traits in [`cluster`]; [`sim`] provides an
//! in-process implementation with fault injection.

pub mod admission;
pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod errors;
pub mod fanin;
pub mod job;
pub mod locks;
pub mod sim;
pub mod storage;
pub mod topology;
pub mod types;
pub mod worker;

pub use admission::{AdmissionLimiter, AdmissionPermit};
pub use cluster::{
    BackupCluster, ClusterMembership, ConnectionFactory, LockResolver, NodeClient, ResolvedLocks,
};
pub use config::BackupConfig;
pub use controller::{ControllerStats, RoundConfig, RoundController};
pub use errors::{BackupError, ErrorClassifier, ErrorContext, ErrorStrategy};
pub use job::{BackupJob, BackupSummary, RangeBackup};
pub use storage::{BackupStorage, LocalStorage};
pub use types::{
    ApiVersion, BackupRequest, LockInfo, NodeError, NodeId, NodeInfo, NodeResponse, NodeResult,
    NodeState, ProgressCallback, ProgressUnit, RetrySignal,
};

pub use kvbackup_rtree::rtree::{
    BackupFile, ChecksumStats, CompletedRange, KeyRange, ProgressRangeTree,
};
