//! Per-operation work set of pinned, latched pages.
//!
//! A tree operation accumulates the pages it latched during descent here,
//! in acquisition order, together with the page IDs it decided to delete.
//! Releasing walks the list front to back: drop the latch, then return the
//! pin with the recorded dirty flag, and finally hand the queued pages to
//! the allocator (which requires their pin counts to have reached zero).
//!
//! The set is empty before and after every operation. Dropping a non-empty
//! set (an error unwind) still releases every latch and pin.

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use taproot_buffer::BufferPool;
use taproot_common::page::{PageId, PAGE_SIZE};
use taproot_common::Result;
use tracing::warn;

/// How an operation latches the pages it visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LatchMode {
    /// Point lookups: read latches, ancestors released immediately.
    Search,
    /// Inserts: write latches, ancestors kept while the child may split.
    Insert,
    /// Removes: write latches, ancestors kept while the child may underflow.
    Remove,
}

impl LatchMode {
    pub(crate) fn is_exclusive(self) -> bool {
        !matches!(self, LatchMode::Search)
    }
}

/// A held page latch, read or write.
pub(crate) enum PageLatch<'a> {
    Read(RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>),
    Write(RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>),
}

/// One pinned, latched page in the work set.
pub(crate) struct LatchedPage<'a> {
    /// The page this latch covers.
    pub page_id: PageId,
    latch: PageLatch<'a>,
    dirty: bool,
}

impl<'a> LatchedPage<'a> {
    /// Read access to the page bytes.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        match &self.latch {
            PageLatch::Read(guard) => &***guard,
            PageLatch::Write(guard) => &***guard,
        }
    }

    /// Write access to the page bytes. Marks the page dirty: it will be
    /// unpinned with `dirty = true` at release.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.dirty = true;
        match &mut self.latch {
            PageLatch::Write(guard) => &mut ***guard,
            PageLatch::Read(_) => unreachable!("write access through a read latch"),
        }
    }
}

/// Ordered list of latched pages plus the pages queued for deletion.
pub(crate) struct WorkSet<'a> {
    pool: &'a BufferPool,
    pages: Vec<LatchedPage<'a>>,
    deleted: Vec<PageId>,
}

impl<'a> WorkSet<'a> {
    pub fn new(pool: &'a BufferPool) -> Self {
        Self {
            pool,
            pages: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// Pins and latches a page, appending it to the set. Returns its index.
    pub fn acquire(&mut self, page_id: PageId, mode: LatchMode) -> Result<usize> {
        let frame = self.pool.fetch_page(page_id)?;
        let latch = if mode.is_exclusive() {
            PageLatch::Write(frame.write_data())
        } else {
            PageLatch::Read(frame.read_data())
        };
        self.pages.push(LatchedPage {
            page_id,
            latch,
            dirty: false,
        });
        Ok(self.pages.len() - 1)
    }

    /// Adopts a write latch on a freshly allocated (already pinned) page.
    /// The page is marked dirty: it was just initialized.
    pub fn adopt(&mut self, page_id: PageId, guard: RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>) -> usize {
        self.pages.push(LatchedPage {
            page_id,
            latch: PageLatch::Write(guard),
            dirty: true,
        });
        self.pages.len() - 1
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// The most recently acquired page.
    pub fn last(&self) -> &LatchedPage<'a> {
        self.pages.last().expect("work set is empty")
    }

    pub fn get(&self, index: usize) -> &LatchedPage<'a> {
        &self.pages[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut LatchedPage<'a> {
        &mut self.pages[index]
    }

    /// Index of the entry latching `page_id`, if present.
    pub fn position(&self, page_id: PageId) -> Option<usize> {
        self.pages.iter().position(|entry| entry.page_id == page_id)
    }

    /// Mutable access to two distinct entries at once.
    pub fn pair_mut(&mut self, a: usize, b: usize) -> (&mut LatchedPage<'a>, &mut LatchedPage<'a>) {
        debug_assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.pages.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.pages.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    /// Queues a page for physical deletion at release time.
    pub fn queue_delete(&mut self, page_id: PageId) {
        self.deleted.push(page_id);
    }

    /// Unlatches and unpins the most recently acquired page.
    pub fn release_last(&mut self) {
        if let Some(entry) = self.pages.pop() {
            let (page_id, dirty) = (entry.page_id, entry.dirty);
            drop(entry);
            self.pool.unpin_page(page_id, dirty);
        }
    }

    /// Releases every page except the most recent one: the safe-ancestor
    /// release of latch crabbing.
    pub fn release_ancestors(&mut self) {
        if self.pages.len() <= 1 {
            return;
        }
        let pool = self.pool;
        let keep = self.pages.len() - 1;
        for entry in self.pages.drain(..keep) {
            let (page_id, dirty) = (entry.page_id, entry.dirty);
            drop(entry);
            pool.unpin_page(page_id, dirty);
        }
    }

    /// Releases everything in acquisition order, then physically deletes
    /// the queued pages.
    pub fn release_all(&mut self) -> Result<()> {
        let pool = self.pool;
        for entry in self.pages.drain(..) {
            let (page_id, dirty) = (entry.page_id, entry.dirty);
            drop(entry);
            pool.unpin_page(page_id, dirty);
        }
        for page_id in self.deleted.drain(..) {
            if !pool.delete_page(page_id)? {
                // A cursor may still pin a page that was merged away; the
                // page stays allocated but unreachable.
                warn!(page = %page_id, "deferred page still pinned, leaking");
            }
        }
        Ok(())
    }
}

impl Drop for WorkSet<'_> {
    fn drop(&mut self) {
        // Backstop for error unwinds: release latches and pins, attempt
        // the queued deletes, swallow failures.
        let pool = self.pool;
        for entry in self.pages.drain(..) {
            let (page_id, dirty) = (entry.page_id, entry.dirty);
            drop(entry);
            pool.unpin_page(page_id, dirty);
        }
        for page_id in self.deleted.drain(..) {
            let _ = pool.delete_page(page_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use taproot_buffer::{BufferPoolConfig, DiskManager, DiskManagerConfig};

    fn create_test_pool(num_frames: usize) -> (BufferPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskManager::new(DiskManagerConfig {
            path: dir.path().join("ws.db"),
            fsync_enabled: false,
        })
        .unwrap();
        (
            BufferPool::new(BufferPoolConfig { num_frames }, Arc::new(disk)),
            dir,
        )
    }

    fn make_pages(pool: &BufferPool, n: usize) -> Vec<PageId> {
        (0..n)
            .map(|_| {
                let (page_id, _) = pool.new_page().unwrap();
                pool.unpin_page(page_id, false);
                page_id
            })
            .collect()
    }

    #[test]
    fn test_workset_acquire_release_balances_pins() {
        let (pool, _dir) = create_test_pool(8);
        let pages = make_pages(&pool, 3);

        let mut ws = WorkSet::new(&pool);
        for &page_id in &pages {
            ws.acquire(page_id, LatchMode::Insert).unwrap();
        }
        assert_eq!(ws.len(), 3);
        assert_eq!(pool.stats().pinned_frames, 3);

        ws.release_all().unwrap();
        assert!(ws.is_empty());
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_workset_release_ancestors_keeps_last() {
        let (pool, _dir) = create_test_pool(8);
        let pages = make_pages(&pool, 3);

        let mut ws = WorkSet::new(&pool);
        for &page_id in &pages {
            ws.acquire(page_id, LatchMode::Search).unwrap();
        }

        ws.release_ancestors();
        assert_eq!(ws.len(), 1);
        assert_eq!(ws.last().page_id, pages[2]);
        assert_eq!(pool.stats().pinned_frames, 1);

        ws.release_all().unwrap();
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_workset_dirty_tracking() {
        let (pool, _dir) = create_test_pool(8);
        let pages = make_pages(&pool, 1);

        let mut ws = WorkSet::new(&pool);
        let idx = ws.acquire(pages[0], LatchMode::Insert).unwrap();
        ws.get_mut(idx).data_mut()[100] = 0xAB;
        ws.release_all().unwrap();

        let frame = pool.fetch_page(pages[0]).unwrap();
        assert!(frame.is_dirty());
        pool.unpin_page(pages[0], false);
    }

    #[test]
    fn test_workset_deletes_queued_pages() {
        let (pool, _dir) = create_test_pool(8);
        let pages = make_pages(&pool, 2);

        let mut ws = WorkSet::new(&pool);
        ws.acquire(pages[0], LatchMode::Remove).unwrap();
        ws.acquire(pages[1], LatchMode::Remove).unwrap();
        ws.queue_delete(pages[1]);
        ws.release_all().unwrap();

        assert!(!pool.contains(pages[1]));
        assert!(pool.contains(pages[0]));
    }

    #[test]
    fn test_workset_drop_releases_pins() {
        let (pool, _dir) = create_test_pool(8);
        let pages = make_pages(&pool, 2);

        {
            let mut ws = WorkSet::new(&pool);
            ws.acquire(pages[0], LatchMode::Search).unwrap();
            ws.acquire(pages[1], LatchMode::Search).unwrap();
            // Dropped without release_all, as on an error path.
        }

        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_workset_pair_mut() {
        let (pool, _dir) = create_test_pool(8);
        let pages = make_pages(&pool, 2);

        let mut ws = WorkSet::new(&pool);
        ws.acquire(pages[0], LatchMode::Insert).unwrap();
        ws.acquire(pages[1], LatchMode::Insert).unwrap();

        let (a, b) = ws.pair_mut(0, 1);
        assert_eq!(a.page_id, pages[0]);
        assert_eq!(b.page_id, pages[1]);

        let (b2, a2) = ws.pair_mut(1, 0);
        assert_eq!(b2.page_id, pages[1]);
        assert_eq!(a2.page_id, pages[0]);

        ws.release_all().unwrap();
    }

    #[test]
    fn test_workset_position() {
        let (pool, _dir) = create_test_pool(8);
        let pages = make_pages(&pool, 2);

        let mut ws = WorkSet::new(&pool);
        ws.acquire(pages[0], LatchMode::Search).unwrap();

        assert_eq!(ws.position(pages[0]), Some(0));
        assert_eq!(ws.position(pages[1]), None);

        ws.release_all().unwrap();
    }

    #[test]
    fn test_latch_mode_exclusivity() {
        assert!(!LatchMode::Search.is_exclusive());
        assert!(LatchMode::Insert.is_exclusive());
        assert!(LatchMode::Remove.is_exclusive());
    }
}
