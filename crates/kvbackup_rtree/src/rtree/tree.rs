//! Progress tree over the requested backup ranges.
//!
//! The tree is keyed by the start of each requested ("origin") range. Each
//! origin owns an ordered set of completed sub-intervals that are pairwise
//! disjoint and contained in the origin. Completions are idempotent: a result
//! whose interval is already covered is ignored, and a result that partially
//! overlaps existing entries replaces them. Once an origin is fully covered it
//! is frozen, its checksum is folded into the per-table aggregate, its files
//! are handed to the completion callback, and its slots go back to the arena.
//!
//! The tree is mutated by exactly one owner; it holds no locks.

use std::collections::BTreeMap;
use std::mem;
use std::ops::Bound::{Excluded, Included, Unbounded};

use super::arena::{ArenaStats, RangeArena, SlotId};
use super::types::{cmp_end, key_before_end, BackupFile, ChecksumStats, KeyRange};

/// Callback invoked exactly once per origin when it becomes fully covered.
pub type CompletionCallback = Box<dyn FnMut(CompletedRange) + Send>;

/// An origin range that has just become fully covered.
#[derive(Clone, Debug)]
pub struct CompletedRange {
    pub origin: KeyRange,
    pub physical_id: i64,
    /// Files of every completed interval, ordered by start key.
    pub files: Vec<BackupFile>,
}

/// Result of feeding one completion into the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The interval was recorded.
    Applied {
        physical_id: i64,
        /// Existing entries removed because they overlapped the new one.
        replaced: usize,
        /// The owning origin became fully covered by this completion.
        completed: bool,
    },
    /// The interval was already covered; nothing changed.
    Duplicate,
    /// No origin owns the interval.
    Untracked,
}

/// One requested key range and its completion state.
#[derive(Debug)]
pub struct ProgressRange {
    origin: KeyRange,
    physical_id: i64,
    completed: BTreeMap<Vec<u8>, SlotId>,
    complete: bool,
}

impl ProgressRange {
    pub fn origin(&self) -> &KeyRange {
        &self.origin
    }

    pub fn physical_id(&self) -> i64 {
        self.physical_id
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Ordered set of origin ranges with per-origin completion tracking.
pub struct ProgressRangeTree {
    ranges: BTreeMap<Vec<u8>, ProgressRange>,
    arena: RangeArena,
    checksums: BTreeMap<i64, ChecksumStats>,
    remaining: usize,
    skip_checksum: bool,
    on_complete: Option<CompletionCallback>,
}

impl Default for ProgressRangeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProgressRangeTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressRangeTree")
            .field("ranges", &self.ranges.len())
            .field("remaining", &self.remaining)
            .field("arena", &self.arena.stats())
            .finish()
    }
}

impl ProgressRangeTree {
    pub fn new() -> Self {
        Self::with_arena(RangeArena::default())
    }

    /// Create a tree backed by a specific slot pool.
    pub fn with_arena(arena: RangeArena) -> Self {
        Self {
            ranges: BTreeMap::new(),
            arena,
            checksums: BTreeMap::new(),
            remaining: 0,
            skip_checksum: false,
            on_complete: None,
        }
    }

    /// Disable checksum folding for completed ranges.
    pub fn set_skip_checksum(&mut self, skip: bool) {
        self.skip_checksum = skip;
    }

    /// Register the callback fired when an origin becomes fully covered.
    pub fn set_completion_callback(&mut self, callback: CompletionCallback) {
        self.on_complete = Some(callback);
    }

    /// Track a new origin range.
    ///
    /// Origins must be non-empty and pairwise disjoint.
    pub fn insert(&mut self, origin: KeyRange, physical_id: i64) -> anyhow::Result<()> {
        anyhow::ensure!(!origin.is_empty(), "empty backup range {origin:?}");
        if let Some((_, prev)) = self
            .ranges
            .range::<[u8], _>((Unbounded, Included(origin.start.as_slice())))
            .next_back()
        {
            anyhow::ensure!(
                !prev.origin.overlaps(&origin.start, &origin.end),
                "backup range {origin:?} overlaps {:?}",
                prev.origin
            );
        }
        if let Some((_, next)) = self
            .ranges
            .range::<[u8], _>((Excluded(origin.start.as_slice()), Unbounded))
            .next()
        {
            anyhow::ensure!(
                !next.origin.overlaps(&origin.start, &origin.end),
                "backup range {origin:?} overlaps {:?}",
                next.origin
            );
        }
        self.ranges.insert(
            origin.start.clone(),
            ProgressRange {
                origin,
                physical_id,
                completed: BTreeMap::new(),
                complete: false,
            },
        );
        self.remaining += 1;
        Ok(())
    }

    /// Number of origins tracked, complete or not.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of origins that are not yet fully covered.
    pub fn remaining_count(&self) -> usize {
        self.remaining
    }

    /// Origin containing `key`, if any.
    pub fn find_containing(&self, key: &[u8]) -> Option<&ProgressRange> {
        let (_, range) = self
            .ranges
            .range::<[u8], _>((Unbounded, Included(key)))
            .next_back()?;
        range.origin.contains_key(key).then_some(range)
    }

    /// Origin owning the whole of `[start, end)`.
    ///
    /// Returns `Ok(None)` when no origin overlaps the interval and an error
    /// when the interval crosses an origin boundary.
    pub fn find_contained(
        &self,
        start: &[u8],
        end: &[u8],
    ) -> anyhow::Result<Option<&ProgressRange>> {
        let key = self.owner_key(start, end)?;
        Ok(key.and_then(|key| self.ranges.get(key)))
    }

    /// True when `[start, end)` is already fully covered by completed entries.
    pub fn is_covered(&self, start: &[u8], end: &[u8]) -> bool {
        match self.find_contained(start, end) {
            Ok(Some(range)) => covers(&self.arena, range, start, end),
            _ => false,
        }
    }

    /// Record that `[start, end)` has been exported with `files`.
    pub fn apply_completion(
        &mut self,
        start: &[u8],
        end: &[u8],
        files: Vec<BackupFile>,
    ) -> anyhow::Result<ApplyOutcome> {
        anyhow::ensure!(
            key_before_end(start, end),
            "empty completion [{}, {})",
            start.escape_ascii(),
            end.escape_ascii()
        );
        let Some(key) = self.owner_key(start, end)?.map(<[u8]>::to_vec) else {
            return Ok(ApplyOutcome::Untracked);
        };
        let Some(range) = self.ranges.get_mut(&key) else {
            return Ok(ApplyOutcome::Untracked);
        };
        if range.complete || covers(&self.arena, range, start, end) {
            return Ok(ApplyOutcome::Duplicate);
        }

        let mut doomed = Vec::new();
        if let Some((entry_start, slot)) = range
            .completed
            .range::<[u8], _>((Unbounded, Included(start)))
            .next_back()
        {
            if cmp_end(self.arena.end(*slot), start) == std::cmp::Ordering::Greater {
                doomed.push(entry_start.clone());
            }
        }
        for (entry_start, _) in range
            .completed
            .range::<[u8], _>((Excluded(start), Unbounded))
        {
            if !key_before_end(entry_start, end) {
                break;
            }
            doomed.push(entry_start.clone());
        }
        let replaced = doomed.len();
        for entry_start in doomed {
            if let Some(slot) = range.completed.remove(&entry_start) {
                tracing::debug!(
                    start = %entry_start.escape_ascii(),
                    "replacing overlapped completion"
                );
                self.arena.release(slot);
            }
        }

        let slot = self.arena.alloc(end, files);
        range.completed.insert(start.to_vec(), slot);

        let physical_id = range.physical_id;
        let completed = covers(&self.arena, range, &range.origin.start, &range.origin.end);
        if completed {
            range.complete = true;
            let mut files = Vec::new();
            for (_, slot) in mem::take(&mut range.completed) {
                files.append(self.arena.files_mut(slot));
                self.arena.release(slot);
            }
            self.remaining = self.remaining.saturating_sub(1);
            let origin = range.origin.clone();
            self.aggregate_checksum(physical_id, ChecksumStats::from_files(&files));
            if let Some(callback) = self.on_complete.as_mut() {
                callback(CompletedRange {
                    origin,
                    physical_id,
                    files,
                });
            }
        }

        Ok(ApplyOutcome::Applied {
            physical_id,
            replaced,
            completed,
        })
    }

    /// Sub-intervals of every origin that are not yet covered, in key order.
    ///
    /// Pure: calling it any number of times without intervening completions
    /// returns the same list.
    pub fn incomplete_ranges(&self) -> Vec<KeyRange> {
        let mut out = Vec::new();
        for range in self.ranges.values() {
            if range.complete {
                continue;
            }
            let origin = &range.origin;
            let mut cursor: Option<&[u8]> = Some(&origin.start);
            for (entry_start, slot) in &range.completed {
                let Some(pos) = cursor else {
                    break;
                };
                if entry_start.as_slice() > pos {
                    out.push(KeyRange::new(pos, entry_start.as_slice()));
                }
                let entry_end = self.arena.end(*slot);
                cursor = (!entry_end.is_empty()).then_some(entry_end);
            }
            if let Some(pos) = cursor {
                if key_before_end(pos, &origin.end) {
                    out.push(KeyRange::new(pos, origin.end.as_slice()));
                }
            }
        }
        out
    }

    /// Fold `stats` into the checksum of `physical_id`. No-op in skip-checksum
    /// mode.
    pub fn aggregate_checksum(&mut self, physical_id: i64, stats: ChecksumStats) {
        if self.skip_checksum {
            return;
        }
        self.checksums.entry(physical_id).or_default().merge(stats);
    }

    pub fn checksum(&self, physical_id: i64) -> Option<ChecksumStats> {
        self.checksums.get(&physical_id).copied()
    }

    /// Checksums accumulated so far, per physical id.
    pub fn checksum_map(&self) -> &BTreeMap<i64, ChecksumStats> {
        &self.checksums
    }

    pub fn into_checksum_map(self) -> BTreeMap<i64, ChecksumStats> {
        self.checksums
    }

    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    /// Iterate the tracked origins in key order.
    pub fn iter(&self) -> impl Iterator<Item = &ProgressRange> {
        self.ranges.values()
    }

    /// Map key of the origin owning `[start, end)`.
    fn owner_key(&self, start: &[u8], end: &[u8]) -> anyhow::Result<Option<&[u8]>> {
        if let Some((key, range)) = self
            .ranges
            .range::<[u8], _>((Unbounded, Included(start)))
            .next_back()
        {
            if range.origin.contains_key(start) {
                anyhow::ensure!(
                    range.origin.contains_range(start, end),
                    "result [{}, {}) crosses the end of backup range {:?}",
                    start.escape_ascii(),
                    end.escape_ascii(),
                    range.origin
                );
                return Ok(Some(key.as_slice()));
            }
        }
        // Nothing owns `start`; any origin that begins inside the interval
        // means the result straddles a boundary.
        if let Some((_, next)) = self
            .ranges
            .range::<[u8], _>((Excluded(start), Unbounded))
            .next()
        {
            anyhow::ensure!(
                !next.origin.overlaps(start, end),
                "result [{}, {}) crosses the start of backup range {:?}",
                start.escape_ascii(),
                end.escape_ascii(),
                next.origin
            );
        }
        Ok(None)
    }
}

/// True when the completed entries of `range` cover `[start, end)`.
fn covers(arena: &RangeArena, range: &ProgressRange, start: &[u8], end: &[u8]) -> bool {
    if range.complete {
        return true;
    }
    let mut cursor = start;
    let first = range
        .completed
        .range::<[u8], _>((Unbounded, Included(start)))
        .next_back()
        .map(|(key, _)| key.as_slice())
        .unwrap_or(start);
    for (entry_start, slot) in range.completed.range::<[u8], _>((Included(first), Unbounded)) {
        if entry_start.as_slice() > cursor {
            return false;
        }
        let entry_end = arena.end(*slot);
        if entry_end.is_empty() {
            return true;
        }
        if entry_end > cursor {
            cursor = entry_end;
        }
        if !end.is_empty() && cursor >= end {
            return true;
        }
    }
    false
}
