//! Forward cursor over the leaf sibling chain.

use crate::btree::page::BTreeLeafPage;
use parking_lot::RwLockReadGuard;
use std::marker::PhantomData;
use taproot_buffer::BufferPool;
use taproot_common::key::IndexKey;
use taproot_common::page::{PageId, PAGE_SIZE};
use taproot_common::rid::Rid;

/// Cursor yielding `(key, rid)` pairs in ascending key order.
///
/// The cursor owns one pin and one read latch on the leaf it points into,
/// so the bytes it reads are never recycled under it. Advancing to the
/// next leaf pins the successor before releasing the current latch, and
/// only then blocks on the successor's latch; the cursor therefore never
/// waits while holding a latch, which keeps it out of any latch cycle
/// with writers. Entries inserted or moved concurrently may be missed;
/// the cursor promises a consistent view of each leaf it visits, not a
/// snapshot of the whole tree.
pub struct TreeIterator<'a, K: IndexKey> {
    pool: &'a BufferPool,
    page_id: PageId,
    index: usize,
    latch: Option<RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>>,
    _key: PhantomData<K>,
}

impl<'a, K: IndexKey> TreeIterator<'a, K> {
    /// An exhausted cursor (empty tree).
    pub(crate) fn empty(pool: &'a BufferPool) -> Self {
        Self {
            pool,
            page_id: PageId::INVALID,
            index: 0,
            latch: None,
            _key: PhantomData,
        }
    }

    /// A cursor at `index` within the pinned, read-latched leaf `page_id`.
    pub(crate) fn at(
        pool: &'a BufferPool,
        page_id: PageId,
        index: usize,
        latch: RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>,
    ) -> Self {
        Self {
            pool,
            page_id,
            index,
            latch: Some(latch),
            _key: PhantomData,
        }
    }

    /// Releases the current leaf and ends iteration.
    fn release(&mut self) {
        if let Some(guard) = self.latch.take() {
            drop(guard);
            self.pool.unpin_page(self.page_id, false);
        }
        self.page_id = PageId::INVALID;
    }
}

impl<K: IndexKey> Iterator for TreeIterator<'_, K> {
    type Item = (K, Rid);

    fn next(&mut self) -> Option<(K, Rid)> {
        loop {
            let (item, next_leaf) = {
                let guard = self.latch.as_ref()?;
                let leaf = BTreeLeafPage::<K, _>::new(&***guard);
                if self.index < leaf.size() {
                    (
                        Some((leaf.key_at(self.index), leaf.rid_at(self.index))),
                        PageId::INVALID,
                    )
                } else {
                    (None, leaf.next_leaf_page_id())
                }
            };

            if let Some(item) = item {
                self.index += 1;
                return Some(item);
            }

            if !next_leaf.is_valid() {
                self.release();
                return None;
            }

            // Pin the successor before unlatching the current leaf so the
            // chain link we just read stays meaningful, then latch it with
            // no other latch held.
            let frame = match self.pool.fetch_page(next_leaf) {
                Ok(frame) => frame,
                Err(_) => {
                    self.release();
                    return None;
                }
            };
            if let Some(guard) = self.latch.take() {
                drop(guard);
                self.pool.unpin_page(self.page_id, false);
            }
            self.latch = Some(frame.read_data());
            self.page_id = next_leaf;
            self.index = 0;
        }
    }
}

impl<K: IndexKey> Drop for TreeIterator<'_, K> {
    fn drop(&mut self) {
        self.release();
    }
}
