//! Buffer pool manager.

use crate::disk::{DiskManager, DiskManagerConfig};
use crate::frame::{BufferFrame, FrameId};
use crate::page_table::PageTable;
use crate::replacer::ClockReplacer;
use parking_lot::Mutex;
use std::sync::Arc;
use sysinfo::System;
use taproot_common::page::{PageId, PAGE_SIZE};
use taproot_common::{Result, StorageConfig, TaprootError};
use tracing::trace;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { num_frames: 1024 }
    }
}

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Page ID to frame ID mapping (lock-free page table)
/// - Free frame list for new pages
/// - Clock replacement for eviction, with dirty-page write-back
/// - Pin counting for concurrent access
///
/// Every `new_page`/`fetch_page` must be matched by exactly one
/// `unpin_page`. A page's frame carries its reader/writer latch; callers
/// that need the page contents stable take that latch while pinned.
pub struct BufferPool {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Page ID to frame ID mapping (lock-free reads).
    page_table: PageTable,
    /// List of free frame IDs.
    free_list: Mutex<Vec<FrameId>>,
    /// Page replacement policy.
    replacer: ClockReplacer,
    /// Backing storage.
    disk: Arc<DiskManager>,
    /// Serializes page-table installs (miss paths, eviction, deletion) so
    /// two fetches of the same page cannot claim two frames.
    install_lock: Mutex<()>,
}

impl BufferPool {
    /// Creates a new buffer pool over the given disk manager.
    pub fn new(config: BufferPoolConfig, disk: Arc<DiskManager>) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();

        // All frames start in the free list.
        let free_list: Vec<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        Self {
            config,
            frames,
            page_table: PageTable::new(num_frames),
            free_list: Mutex::new(free_list),
            replacer: ClockReplacer::new(num_frames),
            disk,
            install_lock: Mutex::new(()),
        }
    }

    /// Opens the data file named by `config` and builds a pool over it.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let disk = DiskManager::new(DiskManagerConfig {
            path: config.path.clone(),
            fsync_enabled: config.fsync_enabled,
        })?;
        Ok(Self::new(
            BufferPoolConfig {
                num_frames: config.buffer_pool_frames,
            },
            Arc::new(disk),
        ))
    }

    /// Creates a buffer pool sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames so caching stays useful on small machines.
    pub fn auto_sized(disk: Arc<DiskManager>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let num_frames = (target_bytes / PAGE_SIZE).max(1_000);

        Self::new(BufferPoolConfig { num_frames }, disk)
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the number of pages currently cached.
    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }

    /// Returns the number of pages in the backing file.
    pub fn num_pages_on_disk(&self) -> u32 {
        self.disk.num_pages()
    }

    /// Checks if a page is currently cached.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.contains(page_id)
    }

    /// Claims a frame, evicting if necessary. Called with the install lock
    /// held. Returns `BufferPoolFull` when every frame is pinned.
    fn claim_frame(&self) -> Result<FrameId> {
        {
            let mut free_list = self.free_list.lock();
            if let Some(frame_id) = free_list.pop() {
                return Ok(frame_id);
            }
        }

        loop {
            let victim_id = self
                .replacer
                .evict(|fid| {
                    let frame = &self.frames[fid.0 as usize];
                    frame.pin_count() == 0 && !frame.is_empty()
                })
                .ok_or(TaprootError::BufferPoolFull)?;

            let frame = &self.frames[victim_id.0 as usize];
            let Some(victim_page) = frame.page_id() else {
                continue;
            };

            // Unmap, then invalidate the frame's page id before the final
            // pin check; fetchers pin before validating, so one side always
            // observes the other.
            self.page_table.remove(victim_page);
            frame.set_page_id(None);
            if frame.is_pinned() {
                // Raced with a fetcher; give the frame back.
                frame.set_page_id(Some(victim_page));
                self.page_table.insert(victim_page, victim_id);
                continue;
            }

            if frame.is_dirty() {
                trace!(page = %victim_page, frame = victim_id.0, "evicting dirty page");
                let data = frame.read_data();
                self.disk.write_page(victim_page, &data)?;
                drop(data);
                frame.set_dirty(false);
            } else {
                trace!(page = %victim_page, frame = victim_id.0, "evicting clean page");
            }

            self.replacer.remove(victim_id);
            return Ok(victim_id);
        }
    }

    /// Allocates a fresh page on disk and pins it in a zeroed frame.
    pub fn new_page(&self) -> Result<(PageId, &BufferFrame)> {
        let page_id = self.disk.allocate_page()?;

        let _install = self.install_lock.lock();
        let frame_id = match self.claim_frame() {
            Ok(frame_id) => frame_id,
            Err(e) => {
                self.disk.deallocate_page(page_id);
                return Err(e);
            }
        };

        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();
        frame.set_page_id(Some(page_id));
        frame.pin();

        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);

        Ok((page_id, frame))
    }

    /// Fetches a page, pinning it. Reads from disk on a cache miss.
    pub fn fetch_page(&self, page_id: PageId) -> Result<&BufferFrame> {
        // Fast path: cached. Pin first, then confirm the frame still holds
        // the page (it may be mid-eviction).
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            if frame.page_id() == Some(page_id) {
                self.replacer.record_access(frame_id);
                return Ok(frame);
            }
            frame.unpin();
        }

        let _install = self.install_lock.lock();

        // Double-check under the lock; another thread may have loaded it.
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.record_access(frame_id);
            return Ok(frame);
        }

        let data = self.disk.read_page(page_id)?;
        let frame_id = self.claim_frame()?;

        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();
        frame.copy_from(&data);
        frame.set_page_id(Some(page_id));
        frame.pin();

        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);

        Ok(frame)
    }

    /// Unpins a page, optionally marking it dirty.
    ///
    /// Returns false if the page is not cached.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            if is_dirty {
                frame.set_dirty(true);
            }

            frame.unpin();
            return true;
        }
        false
    }

    /// Deletes a page, returning its ID to the allocator.
    ///
    /// Returns Ok(false) if the page is pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let _install = self.install_lock.lock();

        if let Some(frame_id) = self.page_table.remove(page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            if frame.is_pinned() {
                // Cannot delete a pinned page; restore the mapping.
                self.page_table.insert(page_id, frame_id);
                return Ok(false);
            }

            self.replacer.remove(frame_id);
            frame.reset();
            self.free_list.lock().push(frame_id);
        }

        self.disk.deallocate_page(page_id);
        Ok(true)
    }

    /// Flushes a page to disk if it is dirty. Returns true if written.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            if frame.is_dirty() {
                let data = frame.read_data();
                self.disk.write_page(page_id, &data)?;
                drop(data);
                frame.set_dirty(false);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Flushes all dirty pages. Returns the number of pages written.
    pub fn flush_all(&self) -> Result<usize> {
        let mut dirty_pages = Vec::new();
        self.page_table.for_each(|page_id, frame_id| {
            if self.frames[frame_id.0 as usize].is_dirty() {
                dirty_pages.push(page_id);
            }
            true
        });

        let mut flushed = 0;
        for page_id in dirty_pages {
            if self.flush_page(page_id)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let mut pinned_count = 0;
        let mut dirty_count = 0;

        self.page_table.for_each(|_, frame_id| {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_count += 1;
            }
            if frame.is_dirty() {
                dirty_count += 1;
            }
            true
        });

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: self.free_count(),
            used_frames: self.page_table.len(),
            pinned_frames: pinned_count,
            dirty_frames: dirty_count,
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let _ = self.flush_all();
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames holding pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_pool(num_frames: usize) -> (BufferPool, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(DiskManagerConfig {
            path: dir.path().join("pool.db"),
            fsync_enabled: false,
        })
        .unwrap();
        let pool = BufferPool::new(BufferPoolConfig { num_frames }, Arc::new(disk));
        (pool, dir)
    }

    #[test]
    fn test_buffer_pool_new() {
        let (pool, _dir) = create_test_pool(10);

        assert_eq!(pool.num_frames(), 10);
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.page_count(), 0);
        assert_eq!(pool.num_pages_on_disk(), 0);
    }

    #[test]
    fn test_buffer_pool_new_page() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, frame) = pool.new_page().unwrap();

        assert_eq!(page_id, PageId(0));
        assert_eq!(frame.page_id(), Some(page_id));
        assert!(frame.is_pinned());
        assert_eq!(pool.free_count(), 9);
        assert_eq!(pool.page_count(), 1);
        assert!(pool.contains(page_id));
    }

    #[test]
    fn test_buffer_pool_fetch_cached() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, _) = pool.new_page().unwrap();
        pool.unpin_page(page_id, false);

        let frame = pool.fetch_page(page_id).unwrap();
        assert_eq!(frame.page_id(), Some(page_id));
        assert!(frame.is_pinned());
    }

    #[test]
    fn test_buffer_pool_fetch_nonexistent() {
        let (pool, _dir) = create_test_pool(10);
        assert!(pool.fetch_page(PageId(7)).is_err());
    }

    #[test]
    fn test_buffer_pool_fetch_from_disk_after_eviction() {
        let (pool, _dir) = create_test_pool(2);

        let (p0, frame) = pool.new_page().unwrap();
        frame.write_data()[0] = 0xAA;
        pool.unpin_page(p0, true);

        // Fill the remaining frame and force p0 out.
        let (p1, _) = pool.new_page().unwrap();
        pool.unpin_page(p1, false);
        let (p2, _) = pool.new_page().unwrap();
        pool.unpin_page(p2, false);

        // p0 must come back from disk with its data intact.
        let frame = pool.fetch_page(p0).unwrap();
        assert_eq!(frame.read_data()[0], 0xAA);
        pool.unpin_page(p0, false);
    }

    #[test]
    fn test_buffer_pool_dirty_tracking() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, _) = pool.new_page().unwrap();
        pool.unpin_page(page_id, true);

        let frame = pool.fetch_page(page_id).unwrap();
        assert!(frame.is_dirty());
        pool.unpin_page(page_id, false);
    }

    #[test]
    fn test_buffer_pool_full_all_pinned() {
        let (pool, _dir) = create_test_pool(2);

        pool.new_page().unwrap();
        pool.new_page().unwrap();

        let result = pool.new_page();
        assert!(matches!(result, Err(TaprootError::BufferPoolFull)));
    }

    #[test]
    fn test_buffer_pool_delete_page() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, _) = pool.new_page().unwrap();
        pool.unpin_page(page_id, false);

        assert!(pool.delete_page(page_id).unwrap());
        assert!(!pool.contains(page_id));
        assert_eq!(pool.free_count(), 10);

        // The freed ID is handed out again.
        let (reused, _) = pool.new_page().unwrap();
        assert_eq!(reused, page_id);
    }

    #[test]
    fn test_buffer_pool_delete_pinned_page() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, _) = pool.new_page().unwrap();
        // Still pinned.
        assert!(!pool.delete_page(page_id).unwrap());
        assert!(pool.contains(page_id));
    }

    #[test]
    fn test_buffer_pool_flush_page() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, frame) = pool.new_page().unwrap();
        frame.write_data()[0] = 0x5A;
        pool.unpin_page(page_id, true);

        assert!(pool.flush_page(page_id).unwrap());
        // No longer dirty.
        assert!(!pool.flush_page(page_id).unwrap());
    }

    #[test]
    fn test_buffer_pool_flush_all() {
        let (pool, _dir) = create_test_pool(10);

        for _ in 0..5 {
            let (page_id, _) = pool.new_page().unwrap();
            pool.unpin_page(page_id, true);
        }

        assert_eq!(pool.flush_all().unwrap(), 5);
        assert_eq!(pool.flush_all().unwrap(), 0);
    }

    #[test]
    fn test_buffer_pool_eviction_writes_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("writeback.db");
        let disk = Arc::new(
            DiskManager::new(DiskManagerConfig {
                path,
                fsync_enabled: false,
            })
            .unwrap(),
        );
        let pool = BufferPool::new(BufferPoolConfig { num_frames: 1 }, disk.clone());

        let (p0, frame) = pool.new_page().unwrap();
        frame.write_data()[0] = 0xCC;
        pool.unpin_page(p0, true);

        // Allocating another page evicts p0 and must write it back.
        let (p1, _) = pool.new_page().unwrap();
        pool.unpin_page(p1, false);

        assert_eq!(disk.read_page(p0).unwrap()[0], 0xCC);
    }

    #[test]
    fn test_buffer_pool_stats() {
        let (pool, _dir) = create_test_pool(10);

        for i in 0..4u32 {
            let (page_id, _) = pool.new_page().unwrap();
            if i % 2 == 0 {
                pool.unpin_page(page_id, true);
            }
            // Odd pages stay pinned.
        }

        let stats = pool.stats();
        assert_eq!(stats.total_frames, 10);
        assert_eq!(stats.free_frames, 6);
        assert_eq!(stats.used_frames, 4);
        assert_eq!(stats.pinned_frames, 2);
        assert_eq!(stats.dirty_frames, 2);
    }

    #[test]
    fn test_buffer_pool_open_from_config() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            path: dir.path().join("open.db"),
            buffer_pool_frames: 8,
            fsync_enabled: false,
        };

        let pool = BufferPool::open(&config).unwrap();
        assert_eq!(pool.num_frames(), 8);
    }
}
