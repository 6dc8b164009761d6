//! Disk manager for page-level file I/O and page allocation.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use taproot_common::page::{PageId, PAGE_SIZE};
use taproot_common::{Result, TaprootError};

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Path to the data file.
    pub path: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./taproot.db"),
            fsync_enabled: true,
        }
    }
}

/// Manages reading, writing and allocating pages in a single data file.
///
/// Deallocated page IDs go onto an in-memory free list and are handed out
/// again before the file is extended. The free list is not persisted:
/// after a restart, IDs freed in the previous run stay unused until the
/// file is rebuilt.
pub struct DiskManager {
    /// Configuration.
    config: DiskManagerConfig,
    /// File handle and allocation state.
    inner: Mutex<DiskInner>,
}

struct DiskInner {
    /// The data file.
    file: File,
    /// Number of pages the file currently holds.
    num_pages: u32,
    /// Deallocated page IDs available for reuse.
    free_pages: Vec<PageId>,
}

impl DiskManager {
    /// Opens or creates the data file.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self {
            config,
            inner: Mutex::new(DiskInner {
                file,
                num_pages,
                free_pages: Vec::new(),
            }),
        })
    }

    /// Returns the data file path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Reads a page from disk. Reading an unallocated or freed page is an
    /// error: handing out stale bytes for a reusable page ID would let a
    /// cache fill with dead pages.
    pub fn read_page(&self, page_id: PageId) -> Result<[u8; PAGE_SIZE]> {
        let mut inner = self.inner.lock();

        if !page_id.is_valid()
            || page_id.0 >= inner.num_pages
            || inner.free_pages.contains(&page_id)
        {
            return Err(TaprootError::PageNotFound { page_id: page_id.0 });
        }

        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;

        let mut buffer = [0u8; PAGE_SIZE];
        inner.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Writes a page to disk.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut inner = self.inner.lock();

        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(data)?;

        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }

        // Writing past the end extends the file.
        if page_id.0 >= inner.num_pages {
            inner.num_pages = page_id.0 + 1;
        }

        Ok(())
    }

    /// Allocates a page, reusing a freed ID when one is available.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();

        if let Some(page_id) = inner.free_pages.pop() {
            return Ok(page_id);
        }

        let page_id = PageId(inner.num_pages);

        // Extend the file with a zeroed page.
        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&[0u8; PAGE_SIZE])?;

        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }

        inner.num_pages = page_id.0 + 1;

        Ok(page_id)
    }

    /// Returns a page ID to the allocator for reuse.
    pub fn deallocate_page(&self, page_id: PageId) {
        if !page_id.is_valid() {
            return;
        }
        let mut inner = self.inner.lock();
        if page_id.0 < inner.num_pages && !inner.free_pages.contains(&page_id) {
            inner.free_pages.push(page_id);
        }
    }

    /// Returns the number of pages in the file.
    pub fn num_pages(&self) -> u32 {
        self.inner.lock().num_pages
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            path: dir.path().join("test.db"),
            fsync_enabled: false,
        };
        let dm = DiskManager::new(config).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_disk_manager_allocate_page() {
        let (dm, _dir) = create_test_disk_manager();

        assert_eq!(dm.allocate_page().unwrap(), PageId(0));
        assert_eq!(dm.allocate_page().unwrap(), PageId(1));
        assert_eq!(dm.num_pages(), 2);
    }

    #[test]
    fn test_disk_manager_write_read() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xEF;
        dm.write_page(page_id, &data).unwrap();

        let read_data = dm.read_page(page_id).unwrap();
        assert_eq!(read_data[0], 0xAB);
        assert_eq!(read_data[PAGE_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_disk_manager_read_nonexistent_page() {
        let (dm, _dir) = create_test_disk_manager();
        dm.allocate_page().unwrap();

        assert!(dm.read_page(PageId(99)).is_err());
        assert!(dm.read_page(PageId::INVALID).is_err());
    }

    #[test]
    fn test_disk_manager_free_list_reuse() {
        let (dm, _dir) = create_test_disk_manager();

        let p0 = dm.allocate_page().unwrap();
        let p1 = dm.allocate_page().unwrap();

        dm.deallocate_page(p1);
        assert_eq!(dm.allocate_page().unwrap(), p1);

        dm.deallocate_page(p0);
        dm.deallocate_page(p0); // double free is ignored
        assert_eq!(dm.allocate_page().unwrap(), p0);
        assert_eq!(dm.allocate_page().unwrap(), PageId(2));
    }

    #[test]
    fn test_disk_manager_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");
        let page_id;

        {
            let dm = DiskManager::new(DiskManagerConfig {
                path: path.clone(),
                fsync_enabled: true,
            })
            .unwrap();
            page_id = dm.allocate_page().unwrap();

            let mut data = [0u8; PAGE_SIZE];
            data[0] = 0xFF;
            dm.write_page(page_id, &data).unwrap();
        }

        {
            let dm = DiskManager::new(DiskManagerConfig {
                path,
                fsync_enabled: true,
            })
            .unwrap();

            assert_eq!(dm.num_pages(), 1);
            assert_eq!(dm.read_page(page_id).unwrap()[0], 0xFF);
        }
    }

    #[test]
    fn test_disk_manager_flush() {
        let (dm, _dir) = create_test_disk_manager();
        dm.allocate_page().unwrap();
        dm.flush().unwrap();
    }
}
