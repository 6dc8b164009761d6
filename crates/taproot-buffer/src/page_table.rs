//! Lock-free page table mapping page IDs to frame IDs.

use crate::frame::FrameId;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use taproot_common::page::PageId;

/// Sentinel value for never-used key slots.
const EMPTY_KEY: u32 = u32::MAX;

/// Sentinel value for deleted key slots (tombstone).
const TOMBSTONE_KEY: u32 = u32::MAX - 1;

/// Open-addressing hash table from `PageId` to `FrameId` with linear
/// probing and tombstones.
///
/// Lookups are lock-free; the buffer pool serializes structural changes
/// (insert/remove) behind its install lock, so plain atomic stores suffice
/// for writers.
pub struct PageTable {
    /// Stored page numbers (`EMPTY_KEY` / `TOMBSTONE_KEY` are reserved).
    keys: Box<[AtomicU32]>,
    /// Frame IDs parallel to `keys`.
    values: Box<[AtomicU32]>,
    /// Bitmask for indexing (`capacity - 1`).
    mask: usize,
    /// Number of live entries.
    len: AtomicUsize,
}

impl PageTable {
    /// Creates a page table sized for the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        // 2x capacity for ~50% load factor, power of two for mask indexing.
        let capacity = (num_frames * 2).next_power_of_two().max(1024);

        let keys: Box<[AtomicU32]> = (0..capacity).map(|_| AtomicU32::new(EMPTY_KEY)).collect();
        let values: Box<[AtomicU32]> = (0..capacity)
            .map(|_| AtomicU32::new(FrameId::INVALID.0))
            .collect();

        Self {
            keys,
            values,
            mask: capacity - 1,
            len: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    fn slot_of(&self, page_id: PageId) -> usize {
        // Fibonacci hashing spreads sequential page numbers.
        (page_id.0.wrapping_mul(0x9E37_79B9) as usize) & self.mask
    }

    /// Looks up a page and returns its frame if present.
    #[inline(always)]
    pub fn get(&self, page_id: PageId) -> Option<FrameId> {
        let key = page_id.0;
        let mut idx = self.slot_of(page_id);

        for _ in 0..self.keys.len() {
            let stored = self.keys[idx].load(Ordering::Acquire);
            if stored == EMPTY_KEY {
                return None;
            }
            if stored == key {
                return Some(FrameId(self.values[idx].load(Ordering::Acquire)));
            }
            // Tombstones keep the probe chain alive.
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Returns true if the page is mapped.
    #[inline]
    pub fn contains(&self, page_id: PageId) -> bool {
        self.get(page_id).is_some()
    }

    /// Inserts or updates a mapping. Returns false if the table is full.
    pub fn insert(&self, page_id: PageId, frame_id: FrameId) -> bool {
        debug_assert!(page_id.0 < TOMBSTONE_KEY);
        let key = page_id.0;
        let mut idx = self.slot_of(page_id);

        for _ in 0..self.keys.len() {
            let stored = self.keys[idx].load(Ordering::Acquire);
            if stored == key {
                self.values[idx].store(frame_id.0, Ordering::Release);
                return true;
            }
            if stored == EMPTY_KEY || stored == TOMBSTONE_KEY {
                // Publish the value before the key so a concurrent reader
                // that sees the key also sees the frame.
                self.values[idx].store(frame_id.0, Ordering::Release);
                self.keys[idx].store(key, Ordering::Release);
                self.len.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            idx = (idx + 1) & self.mask;
        }
        false
    }

    /// Removes a mapping. Returns the frame it pointed to, if any.
    pub fn remove(&self, page_id: PageId) -> Option<FrameId> {
        let key = page_id.0;
        let mut idx = self.slot_of(page_id);

        for _ in 0..self.keys.len() {
            let stored = self.keys[idx].load(Ordering::Acquire);
            if stored == EMPTY_KEY {
                return None;
            }
            if stored == key {
                let frame = FrameId(self.values[idx].load(Ordering::Acquire));
                self.keys[idx].store(TOMBSTONE_KEY, Ordering::Release);
                self.len.fetch_sub(1, Ordering::Relaxed);
                return Some(frame);
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns true if there are no mappings.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every mapping. The callback returns false to stop early.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(PageId, FrameId) -> bool,
    {
        for idx in 0..self.keys.len() {
            let stored = self.keys[idx].load(Ordering::Acquire);
            if stored == EMPTY_KEY || stored == TOMBSTONE_KEY {
                continue;
            }
            let frame = FrameId(self.values[idx].load(Ordering::Acquire));
            if !f(PageId(stored), frame) {
                return;
            }
        }
    }
}
