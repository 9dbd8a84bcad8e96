//! Range tree module wiring.
//!
//! `types` holds the key-range and file value types, `arena` is the slot pool
//! shared by every tracked range, and `tree` is the progress tree itself.

mod arena;
mod tree;
mod types;

pub use arena::{ArenaStats, RangeArena, DEFAULT_MAX_RETAINED_SLOTS};
pub use tree::{ApplyOutcome, CompletedRange, CompletionCallback, ProgressRange, ProgressRangeTree};
pub use types::{cmp_end, key_before_end, BackupFile, ChecksumStats, KeyRange};
