//! Slot pool for completed-range entries.
//!
//! Every tracked range stores its completed sub-intervals as slot ids into a
//! single arena owned by the tree. Released slots go onto a free list and keep
//! their key/file buffers, so churn from millions of small completions reuses
//! allocations instead of returning them to the allocator each time.

use super::types::BackupFile;

/// Default number of released slots that keep their buffers.
pub const DEFAULT_MAX_RETAINED_SLOTS: usize = 10_240;

pub(crate) type SlotId = u32;

/// Body of one completed interval. The start key lives in the owning map.
#[derive(Debug, Default)]
pub(crate) struct Entry {
    pub(crate) end: Vec<u8>,
    pub(crate) files: Vec<BackupFile>,
    retained: bool,
}

/// Point-in-time counters for the arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Slots currently referenced by a tracked range.
    pub live: usize,
    /// Slots waiting on the free list.
    pub free: usize,
    /// Free slots that still hold reusable buffers.
    pub retained: usize,
}

/// Shared slot pool with a bounded free list.
#[derive(Debug)]
pub struct RangeArena {
    slots: Vec<Entry>,
    free: Vec<SlotId>,
    max_retained: usize,
    retained: usize,
}

impl Default for RangeArena {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETAINED_SLOTS)
    }
}

impl RangeArena {
    /// Create an arena keeping buffers for at most `max_retained` free slots.
    pub fn new(max_retained: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            max_retained,
            retained: 0,
        }
    }

    /// Store an entry, reusing a released slot when one is available.
    pub(crate) fn alloc(&mut self, end: &[u8], mut files: Vec<BackupFile>) -> SlotId {
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            if entry.retained {
                entry.retained = false;
                self.retained -= 1;
            }
            entry.end.clear();
            entry.end.extend_from_slice(end);
            entry.files.clear();
            entry.files.append(&mut files);
            return slot;
        }
        let slot = self.slots.len() as SlotId;
        self.slots.push(Entry {
            end: end.to_vec(),
            files,
            retained: false,
        });
        slot
    }

    /// Return a slot to the free list.
    pub(crate) fn release(&mut self, slot: SlotId) {
        let entry = &mut self.slots[slot as usize];
        if self.retained < self.max_retained {
            entry.end.clear();
            entry.files.clear();
            entry.retained = true;
            self.retained += 1;
        } else {
            // Over the retention cap: drop the buffers but keep the index.
            *entry = Entry::default();
        }
        self.free.push(slot);
    }

    pub(crate) fn end(&self, slot: SlotId) -> &[u8] {
        &self.slots[slot as usize].end
    }

    pub(crate) fn files_mut(&mut self, slot: SlotId) -> &mut Vec<BackupFile> {
        &mut self.slots[slot as usize].files
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            live: self.slots.len() - self.free.len(),
            free: self.free.len(),
            retained: self.retained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_slots_are_reused() {
        let mut arena = RangeArena::new(4);
        let a = arena.alloc(b"b", Vec::new());
        let b = arena.alloc(b"c", Vec::new());
        assert_ne!(a, b);
        arena.release(a);
        assert_eq!(
            arena.stats(),
            ArenaStats {
                live: 1,
                free: 1,
                retained: 1
            }
        );

        let c = arena.alloc(b"zz", Vec::new());
        assert_eq!(c, a);
        assert_eq!(arena.end(c), b"zz");
        assert_eq!(arena.stats().retained, 0);
    }

    #[test]
    fn retention_cap_drops_buffers_but_keeps_index() {
        let mut arena = RangeArena::new(1);
        let a = arena.alloc(b"a", Vec::new());
        let b = arena.alloc(b"b", Vec::new());
        arena.release(a);
        arena.release(b);
        let stats = arena.stats();
        assert_eq!(stats.free, 2);
        assert_eq!(stats.retained, 1);
        assert_eq!(stats.live, 0);
    }
}
