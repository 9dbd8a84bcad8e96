//! Range progress tracking crate.
//!
//! This crate keeps the bookkeeping used by the backup coordinator: which
//! requested key ranges exist, which sub-intervals of each have been exported,
//! and what checksum has accumulated per physical table. The API surface is
//! intentionally small: callers insert the requested ranges, feed completions
//! through `ProgressRangeTree::apply_completion`, and ask for the gaps with
//! `ProgressRangeTree::incomplete_ranges`.

pub mod rtree;
