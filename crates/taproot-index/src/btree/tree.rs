//! Concurrent B+Tree index over the buffer pool.

use crate::btree::iterator::TreeIterator;
use crate::btree::page::{
    internal_capacity, leaf_capacity, BTreeInternalPage, BTreeLeafPage, BTreePage, PageKind,
};
use crate::btree::workset::{LatchMode, WorkSet};
use crate::header::HeaderPage;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use taproot_buffer::BufferPool;
use taproot_common::key::IndexKey;
use taproot_common::page::{PageId, PAGE_SIZE};
use taproot_common::rid::Rid;
use taproot_common::{Result, TaprootError};
use tracing::debug;

/// A disk-resident B+Tree mapping fixed-width keys to record identifiers.
///
/// Unique keys only. Point lookups take read latches and crab down the
/// tree; inserts and removes take write latches and keep ancestors
/// latched only while the child could still split or underflow. The root
/// page ID is persisted in the header page under the index name, so the
/// tree survives a restart.
///
/// The handle itself is stateless apart from the atomic root pointer;
/// clones of the `Arc`-wrapped tree can be used from many threads.
pub struct BPlusTree<K: IndexKey> {
    index_name: String,
    pool: Arc<BufferPool>,
    root_page_id: AtomicU32,
    leaf_max_size: u16,
    internal_max_size: u16,
    _key: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Opens (or creates) the index named `index_name`, with page fan-out
    /// derived from the page size.
    pub fn new(index_name: impl Into<String>, pool: Arc<BufferPool>) -> Result<Self> {
        let leaf_max = (leaf_capacity::<K>() - 1).min(u16::MAX as usize) as u16;
        let internal_max = ((internal_capacity::<K>() - 1) & !1).min(u16::MAX as usize) as u16;
        Self::with_max_sizes(index_name, pool, leaf_max, internal_max)
    }

    /// Opens (or creates) the index with explicit per-page entry limits.
    /// Small limits are useful to exercise splits and merges in tests.
    pub fn with_max_sizes(
        index_name: impl Into<String>,
        pool: Arc<BufferPool>,
        leaf_max_size: u16,
        internal_max_size: u16,
    ) -> Result<Self> {
        if leaf_max_size < 2 || (leaf_max_size as usize) + 1 > leaf_capacity::<K>() {
            return Err(TaprootError::InvalidParameter {
                name: "leaf_max_size".to_string(),
                value: leaf_max_size.to_string(),
            });
        }
        if internal_max_size < 3 || (internal_max_size as usize) + 1 > internal_capacity::<K>() {
            return Err(TaprootError::InvalidParameter {
                name: "internal_max_size".to_string(),
                value: internal_max_size.to_string(),
            });
        }

        let tree = Self {
            index_name: index_name.into(),
            pool,
            root_page_id: AtomicU32::new(PageId::INVALID.0),
            leaf_max_size,
            internal_max_size,
            _key: PhantomData,
        };
        tree.bootstrap()?;
        Ok(tree)
    }

    /// Ensures the header page exists and loads this index's root from it.
    fn bootstrap(&self) -> Result<()> {
        if self.pool.num_pages_on_disk() == 0 {
            let (page_id, frame) = self.pool.new_page()?;
            if page_id != PageId::HEADER {
                self.pool.unpin_page(page_id, false);
                return Err(TaprootError::Internal(format!(
                    "header bootstrap allocated {page_id}"
                )));
            }
            {
                let mut guard = frame.write_data();
                HeaderPage::new(&mut **guard).init();
            }
            self.pool.unpin_page(page_id, true);
        }

        let frame = self.pool.fetch_page(PageId::HEADER)?;
        let root = {
            let guard = frame.read_data();
            HeaderPage::new(&**guard).get_root_id(&self.index_name)
        };
        self.pool.unpin_page(PageId::HEADER, false);

        self.root_page_id
            .store(root.unwrap_or(PageId::INVALID).0, Ordering::Release);
        Ok(())
    }

    /// The index name this tree registers its root under.
    pub fn name(&self) -> &str {
        &self.index_name
    }

    /// The buffer pool this tree runs on.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    #[inline]
    fn root(&self) -> PageId {
        PageId(self.root_page_id.load(Ordering::Acquire))
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        !self.root().is_valid()
    }

    /// Registers the current root under the index name in the header page.
    /// Called every time the root page ID changes.
    fn update_root_page_id(&self) -> Result<()> {
        let root = self.root();
        let frame = self.pool.fetch_page(PageId::HEADER)?;
        let result = {
            let mut guard = frame.write_data();
            let mut header = HeaderPage::new(&mut **guard);
            if header.get_root_id(&self.index_name).is_some() {
                header.update_record(&self.index_name, root)
            } else {
                header.insert_record(&self.index_name, root)
            }
        };
        self.pool.unpin_page(PageId::HEADER, true);
        result
    }

    fn finish<T>(out: Result<T>, released: Result<()>) -> Result<T> {
        match (out, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
        }
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Descends from the root to the leaf responsible for `key`, crabbing
    /// latches in `mode`. On success the leaf is the last entry of `ws`;
    /// unsafe ancestors (those a split or merge could touch) remain
    /// latched beneath it. Returns false if the tree is empty.
    fn find_leaf<'p>(&'p self, key: &K, mode: LatchMode, ws: &mut WorkSet<'p>) -> Result<bool> {
        // The root pointer is not protected by any latch: latch the
        // presumed root, then re-read the pointer and retry if it moved.
        // The presumed root may even have been freed by the time we pin it.
        loop {
            let root = self.root();
            if !root.is_valid() {
                return Ok(false);
            }
            match ws.acquire(root, mode) {
                Ok(_) => {
                    if self.root() == root {
                        break;
                    }
                    ws.release_last();
                }
                Err(TaprootError::PageNotFound { .. }) if self.root() != root => continue,
                Err(e) => return Err(e),
            }
        }

        loop {
            let child = {
                let entry = ws.last();
                let page = BTreePage::new(entry.data());
                match page.kind() {
                    PageKind::Leaf => return Ok(true),
                    PageKind::Internal => {
                        BTreeInternalPage::<K, _>::new(entry.data()).lookup(key)
                    }
                    PageKind::Invalid => {
                        return Err(TaprootError::TreeCorrupted(format!(
                            "descended into uninitialized {}",
                            entry.page_id
                        )))
                    }
                }
            };

            ws.acquire(child, mode)?;

            let safe = {
                let page = BTreePage::new(ws.last().data());
                match mode {
                    LatchMode::Search => true,
                    LatchMode::Insert => page.size() < page.max_size(),
                    LatchMode::Remove => page.size() > page.min_size(),
                }
            };
            if safe {
                ws.release_ancestors();
            }
        }
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Point lookup.
    pub fn get(&self, key: &K) -> Result<Option<Rid>> {
        let mut ws = WorkSet::new(self.pool.as_ref());
        let out = self.get_inner(key, &mut ws);
        let released = ws.release_all();
        Self::finish(out, released)
    }

    fn get_inner<'p>(&'p self, key: &K, ws: &mut WorkSet<'p>) -> Result<Option<Rid>> {
        if !self.find_leaf(key, LatchMode::Search, ws)? {
            return Ok(None);
        }
        let leaf = BTreeLeafPage::<K, _>::new(ws.last().data());
        Ok(leaf.lookup(key))
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Inserts a key/rid pair. Returns false iff the key already exists.
    pub fn insert(&self, key: K, rid: Rid) -> Result<bool> {
        loop {
            if self.is_empty() {
                self.start_new_tree()?;
            }
            let mut ws = WorkSet::new(self.pool.as_ref());
            let out = self.insert_inner(&key, rid, &mut ws);
            let released = ws.release_all();
            match Self::finish(out, released)? {
                Some(inserted) => return Ok(inserted),
                // The tree emptied out between the root check and the
                // descent; start over.
                None => continue,
            }
        }
    }

    /// Creates the first leaf and installs it as the root. Losing the
    /// install race is fine: the page is discarded and the winner's root
    /// is used.
    fn start_new_tree(&self) -> Result<()> {
        let (page_id, frame) = self.pool.new_page()?;
        {
            let mut guard = frame.write_data();
            let mut leaf = BTreeLeafPage::<K, _>::new(&mut **guard);
            leaf.init(page_id, PageId::INVALID, self.leaf_max_size);
        }
        self.pool.unpin_page(page_id, true);

        if self
            .root_page_id
            .compare_exchange(
                PageId::INVALID.0,
                page_id.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            debug!(index = %self.index_name, root = %page_id, "created tree root");
            self.update_root_page_id()?;
        } else {
            self.pool.delete_page(page_id)?;
        }
        Ok(())
    }

    fn insert_inner<'p>(&'p self, key: &K, rid: Rid, ws: &mut WorkSet<'p>) -> Result<Option<bool>> {
        if !self.find_leaf(key, LatchMode::Insert, ws)? {
            return Ok(None);
        }
        let leaf_idx = ws.len() - 1;

        let (grew, overflow) = {
            let entry = ws.get_mut(leaf_idx);
            let mut leaf = BTreeLeafPage::<K, _>::new(entry.data_mut());
            let old_size = leaf.size();
            let new_size = leaf.insert(*key, rid);
            (new_size != old_size, new_size > leaf.max_size())
        };

        if !grew {
            return Ok(Some(false));
        }
        if overflow {
            self.split_leaf(ws, leaf_idx)?;
        }
        Ok(Some(true))
    }

    /// Splits an overflowing leaf into itself plus a fresh right sibling
    /// and pushes the separator into the parent.
    fn split_leaf<'p>(&'p self, ws: &mut WorkSet<'p>, leaf_idx: usize) -> Result<()> {
        let (new_page_id, frame) = self.pool.new_page()?;
        let new_idx = ws.adopt(new_page_id, frame.write_data());

        let (old_page_id, separator) = {
            let (old_entry, new_entry) = ws.pair_mut(leaf_idx, new_idx);
            let mut old_leaf = BTreeLeafPage::<K, _>::new(old_entry.data_mut());
            let mut new_leaf = BTreeLeafPage::<K, _>::new(new_entry.data_mut());

            new_leaf.init(new_page_id, old_leaf.parent_page_id(), self.leaf_max_size);
            old_leaf.move_half_to(&mut new_leaf);

            // Leaf splits promote the largest key remaining on the left.
            (old_leaf.page_id(), old_leaf.key_at(old_leaf.size() - 1))
        };

        debug!(left = %old_page_id, right = %new_page_id, "split leaf");
        self.insert_into_parent(ws, old_page_id, separator, new_page_id)
    }

    /// Links `new_page` (the right half of a split) into the parent of
    /// `old_page`, growing a new root or splitting the parent as needed.
    fn insert_into_parent<'p>(
        &'p self,
        ws: &mut WorkSet<'p>,
        old_page_id: PageId,
        key: K,
        new_page_id: PageId,
    ) -> Result<()> {
        let old_idx = ws.position(old_page_id).ok_or_else(|| {
            TaprootError::Internal(format!("split source {old_page_id} not latched"))
        })?;
        let parent_page_id = BTreePage::new(ws.get(old_idx).data()).parent_page_id();

        if !parent_page_id.is_valid() {
            // The old page was the root: grow the tree by one level.
            let (root_page_id, frame) = self.pool.new_page()?;
            let root_idx = ws.adopt(root_page_id, frame.write_data());
            {
                let entry = ws.get_mut(root_idx);
                let mut root = BTreeInternalPage::<K, _>::new(entry.data_mut());
                root.init(root_page_id, PageId::INVALID, self.internal_max_size);
                root.populate_new_root(old_page_id, &key, new_page_id);
            }
            self.reparent(ws, old_page_id, root_page_id)?;
            self.reparent(ws, new_page_id, root_page_id)?;

            self.root_page_id.store(root_page_id.0, Ordering::Release);
            self.update_root_page_id()?;
            debug!(index = %self.index_name, root = %root_page_id, "grew new root");
            return Ok(());
        }

        // The parent is still latched: it was not safe when we descended.
        let parent_idx = ws.position(parent_page_id).ok_or_else(|| {
            TaprootError::TreeCorrupted(format!("parent {parent_page_id} not latched"))
        })?;

        let overflow = {
            let entry = ws.get_mut(parent_idx);
            let mut parent = BTreeInternalPage::<K, _>::new(entry.data_mut());
            let new_size = parent.insert_node_after(old_page_id, &key, new_page_id)?;
            new_size > parent.max_size()
        };
        if !overflow {
            return Ok(());
        }

        // Split the parent and keep propagating.
        let (split_page_id, frame) = self.pool.new_page()?;
        let split_idx = ws.adopt(split_page_id, frame.write_data());

        let promoted = {
            let (parent_entry, split_entry) = ws.pair_mut(parent_idx, split_idx);
            let mut parent = BTreeInternalPage::<K, _>::new(parent_entry.data_mut());
            let mut new_internal = BTreeInternalPage::<K, _>::new(split_entry.data_mut());

            new_internal.init(
                split_page_id,
                parent.parent_page_id(),
                self.internal_max_size,
            );
            parent.move_half_to(&mut new_internal);

            // Internal splits promote the new page's detached first key.
            new_internal.key_at(0)
        };

        let moved_children: Vec<PageId> = {
            let page = BTreeInternalPage::<K, _>::new(ws.get(split_idx).data());
            (0..page.size()).map(|i| page.value_at(i)).collect()
        };
        for child in moved_children {
            self.reparent(ws, child, split_page_id)?;
        }

        debug!(left = %parent_page_id, right = %split_page_id, "split internal");
        self.insert_into_parent(ws, parent_page_id, promoted, split_page_id)
    }

    /// Re-points a page at a new parent. Pages already latched by this
    /// operation are edited in place; others are fetched transiently.
    fn reparent<'p>(&'p self, ws: &mut WorkSet<'p>, page_id: PageId, parent: PageId) -> Result<()> {
        if let Some(idx) = ws.position(page_id) {
            BTreePage::new(ws.get_mut(idx).data_mut()).set_parent_page_id(parent);
            return Ok(());
        }
        let frame = self.pool.fetch_page(page_id)?;
        {
            let mut guard = frame.write_data();
            BTreePage::new(&mut **guard).set_parent_page_id(parent);
        }
        self.pool.unpin_page(page_id, true);
        Ok(())
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Removes `key`. Removing an absent key is a no-op.
    pub fn remove(&self, key: &K) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let mut ws = WorkSet::new(self.pool.as_ref());
        let out = self.remove_inner(key, &mut ws);
        let released = ws.release_all();
        Self::finish(out, released)
    }

    fn remove_inner<'p>(&'p self, key: &K, ws: &mut WorkSet<'p>) -> Result<()> {
        if !self.find_leaf(key, LatchMode::Remove, ws)? {
            return Ok(());
        }
        let leaf_idx = ws.len() - 1;
        let leaf_page_id = ws.get(leaf_idx).page_id;

        let underflow = {
            let entry = ws.get_mut(leaf_idx);
            {
                let leaf = BTreeLeafPage::<K, _>::new(entry.data());
                if leaf.lookup(key).is_none() {
                    return Ok(());
                }
            }
            let mut leaf = BTreeLeafPage::<K, _>::new(entry.data_mut());
            let new_size = leaf.remove(key);
            new_size < leaf.min_size()
        };

        if underflow && self.coalesce_or_redistribute(ws, leaf_page_id)? {
            ws.queue_delete(leaf_page_id);
        }
        Ok(())
    }

    /// Repairs an underflowing page by borrowing from a rich sibling or
    /// merging with one. Returns true iff the caller should delete `page_id`.
    fn coalesce_or_redistribute<'p>(&'p self, ws: &mut WorkSet<'p>, page_id: PageId) -> Result<bool> {
        let node_idx = ws
            .position(page_id)
            .ok_or_else(|| TaprootError::Internal(format!("{page_id} not latched")))?;

        let (size, min_size, parent_page_id, is_leaf) = {
            let page = BTreePage::new(ws.get(node_idx).data());
            (
                page.size(),
                page.min_size(),
                page.parent_page_id(),
                page.is_leaf(),
            )
        };

        if size >= min_size {
            return Ok(false);
        }
        if !parent_page_id.is_valid() {
            return self.adjust_root(ws, page_id);
        }

        let parent_idx = ws.position(parent_page_id).ok_or_else(|| {
            TaprootError::TreeCorrupted(format!("parent {parent_page_id} not latched"))
        })?;
        let (index_in_parent, parent_size) = {
            let parent = BTreeInternalPage::<K, _>::new(ws.get(parent_idx).data());
            let index = parent.value_index(page_id).ok_or_else(|| {
                TaprootError::TreeCorrupted(format!("{page_id} missing from {parent_page_id}"))
            })?;
            (index, parent.size())
        };

        // Latch the siblings we may touch. Holding the parent's write
        // latch keeps any other operation away from them.
        let left = if index_in_parent > 0 {
            let left_page_id = BTreeInternalPage::<K, _>::new(ws.get(parent_idx).data())
                .value_at(index_in_parent - 1);
            Some((left_page_id, ws.acquire(left_page_id, LatchMode::Remove)?))
        } else {
            None
        };

        if let Some((_, left_idx)) = left {
            let rich = {
                let page = BTreePage::new(ws.get(left_idx).data());
                page.size() > page.min_size()
            };
            if rich {
                self.redistribute_from_left(ws, parent_idx, left_idx, node_idx, index_in_parent, is_leaf)?;
                return Ok(false);
            }
        }

        let right = if index_in_parent + 1 < parent_size {
            let right_page_id = BTreeInternalPage::<K, _>::new(ws.get(parent_idx).data())
                .value_at(index_in_parent + 1);
            Some((right_page_id, ws.acquire(right_page_id, LatchMode::Remove)?))
        } else {
            None
        };

        if let Some((_, right_idx)) = right {
            let rich = {
                let page = BTreePage::new(ws.get(right_idx).data());
                page.size() > page.min_size()
            };
            if rich {
                self.redistribute_from_right(ws, parent_idx, right_idx, node_idx, index_in_parent, is_leaf)?;
                return Ok(false);
            }
        }

        // Both siblings are at minimum: merge. Prefer the left sibling.
        let deleted_node = if let Some((_, left_idx)) = left {
            self.merge_into_left(ws, parent_idx, left_idx, node_idx, index_in_parent, is_leaf)?;
            true
        } else if let Some((right_page_id, right_idx)) = right {
            self.merge_right_into_node(ws, parent_idx, right_idx, node_idx, index_in_parent, is_leaf)?;
            ws.queue_delete(right_page_id);
            false
        } else {
            return Err(TaprootError::TreeCorrupted(format!(
                "{page_id} underflowed with no siblings"
            )));
        };

        // The parent lost a slot; repair it recursively.
        if self.coalesce_or_redistribute(ws, parent_page_id)? {
            ws.queue_delete(parent_page_id);
        }
        Ok(deleted_node)
    }

    /// Moves the left sibling's last entry into `node` and refreshes the
    /// parent boundary between the two.
    fn redistribute_from_left<'p>(
        &'p self,
        ws: &mut WorkSet<'p>,
        parent_idx: usize,
        left_idx: usize,
        node_idx: usize,
        index_in_parent: usize,
        is_leaf: bool,
    ) -> Result<()> {
        let node_page_id = ws.get(node_idx).page_id;

        if is_leaf {
            let new_separator = {
                let (left_entry, node_entry) = ws.pair_mut(left_idx, node_idx);
                let mut left = BTreeLeafPage::<K, _>::new(left_entry.data_mut());
                let mut node = BTreeLeafPage::<K, _>::new(node_entry.data_mut());

                let last = left.size() - 1;
                let (key, rid) = (left.key_at(last), left.rid_at(last));
                left.remove(&key);
                node.insert(key, rid);
                // The boundary is the largest key still on the left.
                left.key_at(left.size() - 1)
            };
            let entry = ws.get_mut(parent_idx);
            BTreeInternalPage::<K, _>::new(entry.data_mut())
                .set_key_at(index_in_parent, &new_separator);
        } else {
            let demoted =
                BTreeInternalPage::<K, _>::new(ws.get(parent_idx).data()).key_at(index_in_parent);
            let (promoted, moved_child) = {
                let (left_entry, node_entry) = ws.pair_mut(left_idx, node_idx);
                let mut left = BTreeInternalPage::<K, _>::new(left_entry.data_mut());
                let mut node = BTreeInternalPage::<K, _>::new(node_entry.data_mut());
                left.move_last_to_front_of(&mut node, &demoted)
            };
            {
                let entry = ws.get_mut(parent_idx);
                BTreeInternalPage::<K, _>::new(entry.data_mut())
                    .set_key_at(index_in_parent, &promoted);
            }
            self.reparent(ws, moved_child, node_page_id)?;
        }

        debug!(node = %node_page_id, "redistributed from left sibling");
        Ok(())
    }

    /// Moves the right sibling's first entry into `node` and refreshes the
    /// parent boundary between the two.
    fn redistribute_from_right<'p>(
        &'p self,
        ws: &mut WorkSet<'p>,
        parent_idx: usize,
        right_idx: usize,
        node_idx: usize,
        index_in_parent: usize,
        is_leaf: bool,
    ) -> Result<()> {
        let node_page_id = ws.get(node_idx).page_id;

        if is_leaf {
            let new_separator = {
                let (node_entry, right_entry) = ws.pair_mut(node_idx, right_idx);
                let mut node = BTreeLeafPage::<K, _>::new(node_entry.data_mut());
                let mut right = BTreeLeafPage::<K, _>::new(right_entry.data_mut());

                let (key, rid) = (right.key_at(0), right.rid_at(0));
                right.remove(&key);
                node.insert(key, rid);
                // The moved key is now the largest on the node.
                key
            };
            let entry = ws.get_mut(parent_idx);
            BTreeInternalPage::<K, _>::new(entry.data_mut())
                .set_key_at(index_in_parent + 1, &new_separator);
        } else {
            let demoted = BTreeInternalPage::<K, _>::new(ws.get(parent_idx).data())
                .key_at(index_in_parent + 1);
            let (promoted, moved_child) = {
                let (node_entry, right_entry) = ws.pair_mut(node_idx, right_idx);
                let mut node = BTreeInternalPage::<K, _>::new(node_entry.data_mut());
                let mut right = BTreeInternalPage::<K, _>::new(right_entry.data_mut());
                right.move_first_to_end_of(&mut node, &demoted)
            };
            {
                let entry = ws.get_mut(parent_idx);
                BTreeInternalPage::<K, _>::new(entry.data_mut())
                    .set_key_at(index_in_parent + 1, &promoted);
            }
            self.reparent(ws, moved_child, node_page_id)?;
        }

        debug!(node = %node_page_id, "redistributed from right sibling");
        Ok(())
    }

    /// Merges `node` into its left sibling and drops node's parent slot.
    /// The caller deletes `node`.
    fn merge_into_left<'p>(
        &'p self,
        ws: &mut WorkSet<'p>,
        parent_idx: usize,
        left_idx: usize,
        node_idx: usize,
        index_in_parent: usize,
        is_leaf: bool,
    ) -> Result<()> {
        let left_page_id = ws.get(left_idx).page_id;
        let node_page_id = ws.get(node_idx).page_id;

        if is_leaf {
            let (left_entry, node_entry) = ws.pair_mut(left_idx, node_idx);
            let mut left = BTreeLeafPage::<K, _>::new(left_entry.data_mut());
            let mut node = BTreeLeafPage::<K, _>::new(node_entry.data_mut());
            node.move_all_to(&mut left);
        } else {
            let demoted =
                BTreeInternalPage::<K, _>::new(ws.get(parent_idx).data()).key_at(index_in_parent);
            let moved_children = {
                let (left_entry, node_entry) = ws.pair_mut(left_idx, node_idx);
                let mut left = BTreeInternalPage::<K, _>::new(left_entry.data_mut());
                let mut node = BTreeInternalPage::<K, _>::new(node_entry.data_mut());

                let first_moved = left.size();
                node.move_all_to(&mut left, &demoted);
                (first_moved..left.size())
                    .map(|i| left.value_at(i))
                    .collect::<Vec<_>>()
            };
            for child in moved_children {
                self.reparent(ws, child, left_page_id)?;
            }
        }

        let entry = ws.get_mut(parent_idx);
        BTreeInternalPage::<K, _>::new(entry.data_mut()).remove(index_in_parent);

        debug!(survivor = %left_page_id, merged = %node_page_id, "coalesced with left sibling");
        Ok(())
    }

    /// Merges the right sibling into `node` and drops the sibling's parent
    /// slot. The caller deletes the right sibling.
    fn merge_right_into_node<'p>(
        &'p self,
        ws: &mut WorkSet<'p>,
        parent_idx: usize,
        right_idx: usize,
        node_idx: usize,
        index_in_parent: usize,
        is_leaf: bool,
    ) -> Result<()> {
        let node_page_id = ws.get(node_idx).page_id;
        let right_page_id = ws.get(right_idx).page_id;

        if is_leaf {
            let (node_entry, right_entry) = ws.pair_mut(node_idx, right_idx);
            let mut node = BTreeLeafPage::<K, _>::new(node_entry.data_mut());
            let mut right = BTreeLeafPage::<K, _>::new(right_entry.data_mut());
            right.move_all_to(&mut node);
        } else {
            let demoted = BTreeInternalPage::<K, _>::new(ws.get(parent_idx).data())
                .key_at(index_in_parent + 1);
            let moved_children = {
                let (node_entry, right_entry) = ws.pair_mut(node_idx, right_idx);
                let mut node = BTreeInternalPage::<K, _>::new(node_entry.data_mut());
                let mut right = BTreeInternalPage::<K, _>::new(right_entry.data_mut());

                let first_moved = node.size();
                right.move_all_to(&mut node, &demoted);
                (first_moved..node.size())
                    .map(|i| node.value_at(i))
                    .collect::<Vec<_>>()
            };
            for child in moved_children {
                self.reparent(ws, child, node_page_id)?;
            }
        }

        let entry = ws.get_mut(parent_idx);
        BTreeInternalPage::<K, _>::new(entry.data_mut()).remove(index_in_parent + 1);

        debug!(survivor = %node_page_id, merged = %right_page_id, "coalesced with right sibling");
        Ok(())
    }

    /// Handles underflow at the root, which is exempt from `min_size`:
    /// an empty leaf root empties the tree, an internal root with a single
    /// child hands the root to that child. Returns true iff the old root
    /// should be deleted.
    fn adjust_root<'p>(&'p self, ws: &mut WorkSet<'p>, root_page_id: PageId) -> Result<bool> {
        let root_idx = ws
            .position(root_page_id)
            .ok_or_else(|| TaprootError::Internal(format!("root {root_page_id} not latched")))?;
        let (is_leaf, size) = {
            let page = BTreePage::new(ws.get(root_idx).data());
            (page.is_leaf(), page.size())
        };

        if is_leaf && size == 0 {
            self.root_page_id
                .store(PageId::INVALID.0, Ordering::Release);
            self.update_root_page_id()?;
            debug!(index = %self.index_name, "tree emptied");
            return Ok(true);
        }

        if !is_leaf && size == 1 {
            let child =
                BTreeInternalPage::<K, _>::new(ws.get(root_idx).data()).value_at(0);
            self.root_page_id.store(child.0, Ordering::Release);
            self.reparent(ws, child, PageId::INVALID)?;
            self.update_root_page_id()?;
            debug!(index = %self.index_name, root = %child, "collapsed root");
            return Ok(true);
        }

        Ok(false)
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Cursor over all entries in ascending key order.
    pub fn iter(&self) -> Result<TreeIterator<'_, K>> {
        self.begin_at(None)
    }

    /// Cursor positioned at the first entry with key `>= key`.
    pub fn iter_from(&self, key: &K) -> Result<TreeIterator<'_, K>> {
        self.begin_at(Some(key))
    }

    fn begin_at(&self, key: Option<&K>) -> Result<TreeIterator<'_, K>> {
        let pool = self.pool.as_ref();
        loop {
            let root = self.root();
            if !root.is_valid() {
                return Ok(TreeIterator::empty(pool));
            }
            let frame = match pool.fetch_page(root) {
                Ok(frame) => frame,
                // The root was freed between reading the pointer and
                // pinning the page.
                Err(TaprootError::PageNotFound { .. }) if self.root() != root => continue,
                Err(e) => return Err(e),
            };
            let guard = frame.read_data();
            if self.root() != root {
                drop(guard);
                pool.unpin_page(root, false);
                continue;
            }

            let mut page_id = root;
            let mut guard = guard;
            loop {
                let child = {
                    let page = BTreePage::new(&**guard);
                    match page.kind() {
                        PageKind::Leaf => break,
                        PageKind::Internal => {
                            let internal = BTreeInternalPage::<K, _>::new(&**guard);
                            match key {
                                Some(k) => internal.lookup(k),
                                None => internal.value_at(0),
                            }
                        }
                        PageKind::Invalid => {
                            drop(guard);
                            pool.unpin_page(page_id, false);
                            return Err(TaprootError::TreeCorrupted(format!(
                                "descended into uninitialized {page_id}"
                            )));
                        }
                    }
                };

                let frame = match pool.fetch_page(child) {
                    Ok(frame) => frame,
                    Err(e) => {
                        drop(guard);
                        pool.unpin_page(page_id, false);
                        return Err(e);
                    }
                };
                let child_guard = frame.read_data();
                drop(guard);
                pool.unpin_page(page_id, false);
                guard = child_guard;
                page_id = child;
            }

            let index = match key {
                Some(k) => BTreeLeafPage::<K, _>::new(&**guard).key_index(k),
                None => 0,
            };
            return Ok(TreeIterator::at(pool, page_id, index, guard));
        }
    }

    // =========================================================================
    // Utilities and debug
    // =========================================================================

    /// Reads whitespace-separated integers from a file and inserts each as
    /// `(key, rid)` built from the integer. Debug loader.
    pub fn insert_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = std::fs::read_to_string(path)?;
        for token in contents.split_whitespace() {
            if let Ok(value) = token.parse::<i64>() {
                self.insert(K::from_int(value), Rid::from_key(value))?;
            }
        }
        Ok(())
    }

    /// Reads whitespace-separated integers from a file and removes each.
    /// Debug loader.
    pub fn remove_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = std::fs::read_to_string(path)?;
        for token in contents.split_whitespace() {
            if let Ok(value) = token.parse::<i64>() {
                self.remove(&K::from_int(value))?;
            }
        }
        Ok(())
    }

    /// Rank-by-rank dump of the tree for debugging.
    ///
    /// Each visited page takes one pin for the walk plus one transient
    /// peek pin; seeing any other pin count means an unbalanced pin
    /// somewhere and is reported as an error. Single-threaded use only.
    pub fn to_pretty_string(&self, verbose: bool) -> Result<String> {
        let root = self.root();
        if !root.is_valid() {
            return Ok("Empty tree".to_string());
        }

        let pool = self.pool.as_ref();
        let mut out = String::new();
        let mut level = vec![root];

        while !level.is_empty() {
            let mut next_level = Vec::new();
            for page_id in level {
                let frame = pool.fetch_page(page_id)?;
                let peek = match pool.fetch_page(page_id) {
                    Ok(frame) => frame,
                    Err(e) => {
                        pool.unpin_page(page_id, false);
                        return Err(e);
                    }
                };
                let pin_count = peek.pin_count();
                pool.unpin_page(page_id, false);

                {
                    let guard = frame.read_data();
                    let page = BTreePage::new(&**guard);
                    out.push('\n');
                    match page.kind() {
                        PageKind::Leaf => {
                            let leaf = BTreeLeafPage::<K, _>::new(&**guard);
                            if verbose {
                                out.push_str(&format!(
                                    "[{} parent:{}]<{}> ",
                                    leaf.page_id(),
                                    leaf.parent_page_id(),
                                    leaf.size()
                                ));
                            }
                            for i in 0..leaf.size() {
                                if i > 0 {
                                    out.push(' ');
                                }
                                out.push_str(&format!("{:?}", leaf.key_at(i)));
                                if verbose {
                                    out.push_str(&format!("({})", leaf.rid_at(i)));
                                }
                            }
                        }
                        PageKind::Internal => {
                            let internal = BTreeInternalPage::<K, _>::new(&**guard);
                            if verbose {
                                out.push_str(&format!(
                                    "[{} parent:{}]<{}> ",
                                    internal.page_id(),
                                    internal.parent_page_id(),
                                    internal.size()
                                ));
                            }
                            for i in 0..internal.size() {
                                if i > 0 {
                                    out.push(' ');
                                }
                                if i == 0 {
                                    out.push('_');
                                } else {
                                    out.push_str(&format!("{:?}", internal.key_at(i)));
                                }
                                if verbose {
                                    out.push_str(&format!("({})", internal.value_at(i)));
                                }
                                next_level.push(internal.value_at(i));
                            }
                        }
                        PageKind::Invalid => {
                            drop(guard);
                            pool.unpin_page(page_id, false);
                            return Err(TaprootError::TreeCorrupted(format!(
                                "dump reached uninitialized {page_id}"
                            )));
                        }
                    }
                    out.push_str(&format!(" ref: {pin_count}"));
                }
                pool.unpin_page(page_id, false);

                if pin_count != 2 {
                    return Err(TaprootError::Internal(format!(
                        "{page_id} pinned {pin_count} times during dump, expected 2"
                    )));
                }
            }
            level = next_level;
        }
        Ok(out)
    }

    /// Walks the whole tree and verifies its structural invariants:
    /// in-page ordering, separator ranges, fill bounds, parent pointers,
    /// and the leaf sibling chain. Single-threaded diagnostic.
    pub fn check_integrity(&self) -> Result<()> {
        let root = self.root();
        if !root.is_valid() {
            return Ok(());
        }

        let mut leaves = Vec::new();
        self.check_node(root, None, None, PageId::INVALID, &mut leaves)?;

        // The sibling chain must enumerate exactly the leaves found by the
        // in-order walk.
        for (i, &(leaf_page_id, next)) in leaves.iter().enumerate() {
            let expected = leaves.get(i + 1).map(|&(id, _)| id).unwrap_or(PageId::INVALID);
            if next != expected {
                return Err(TaprootError::TreeCorrupted(format!(
                    "sibling chain: {leaf_page_id} links to {next}, expected {expected}"
                )));
            }
        }
        Ok(())
    }

    fn check_node(
        &self,
        page_id: PageId,
        lower: Option<K>,
        upper: Option<K>,
        expected_parent: PageId,
        leaves: &mut Vec<(PageId, PageId)>,
    ) -> Result<()> {
        let corrupt = |detail: String| TaprootError::TreeCorrupted(detail);

        let frame = self.pool.fetch_page(page_id)?;
        let snapshot = {
            let guard = frame.read_data();
            let mut copy = Box::new([0u8; PAGE_SIZE]);
            copy.copy_from_slice(&guard[..]);
            copy
        };
        self.pool.unpin_page(page_id, false);

        let page = BTreePage::new(snapshot.as_ref());
        if page.page_id() != page_id {
            return Err(corrupt(format!(
                "{page_id} header claims {}",
                page.page_id()
            )));
        }
        if page.parent_page_id() != expected_parent {
            return Err(corrupt(format!(
                "{page_id} parent {} != expected {expected_parent}",
                page.parent_page_id()
            )));
        }

        let is_root = page_id == self.root();
        if page.size() > page.max_size() {
            return Err(corrupt(format!("{page_id} overfull: {}", page.size())));
        }
        if !is_root && page.size() < page.min_size() {
            return Err(corrupt(format!("{page_id} underfull: {}", page.size())));
        }

        // A key `k` in this subtree must satisfy lower < k <= upper.
        let in_range = |k: &K| {
            lower.as_ref().map_or(true, |l| *k > *l) && upper.as_ref().map_or(true, |u| *k <= *u)
        };

        match page.kind() {
            PageKind::Leaf => {
                let leaf = BTreeLeafPage::<K, _>::new(snapshot.as_ref());
                for i in 0..leaf.size() {
                    let key = leaf.key_at(i);
                    if i > 0 && leaf.key_at(i - 1) >= key {
                        return Err(corrupt(format!("{page_id} keys not ascending at {i}")));
                    }
                    if !in_range(&key) {
                        return Err(corrupt(format!(
                            "{page_id} key {key:?} outside separator range"
                        )));
                    }
                }
                leaves.push((page_id, leaf.next_leaf_page_id()));
            }
            PageKind::Internal => {
                let internal = BTreeInternalPage::<K, _>::new(snapshot.as_ref());
                if internal.size() < 2 {
                    return Err(corrupt(format!(
                        "{page_id} internal with {} slots",
                        internal.size()
                    )));
                }
                for i in 1..internal.size() {
                    let key = internal.key_at(i);
                    if i > 1 && internal.key_at(i - 1) >= key {
                        return Err(corrupt(format!(
                            "{page_id} separators not ascending at {i}"
                        )));
                    }
                    if !in_range(&key) {
                        return Err(corrupt(format!(
                            "{page_id} separator {key:?} outside range"
                        )));
                    }
                }
                for i in 0..internal.size() {
                    let child_lower = if i == 0 { lower } else { Some(internal.key_at(i)) };
                    let child_upper = if i + 1 < internal.size() {
                        Some(internal.key_at(i + 1))
                    } else {
                        upper
                    };
                    self.check_node(internal.value_at(i), child_lower, child_upper, page_id, leaves)?;
                }
            }
            PageKind::Invalid => {
                return Err(corrupt(format!("{page_id} has invalid kind")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taproot_buffer::{BufferPoolConfig, DiskManager, DiskManagerConfig};
    use taproot_common::key::Key8;

    fn create_test_pool(num_frames: usize) -> (Arc<BufferPool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskManager::new(DiskManagerConfig {
            path: dir.path().join("tree.db"),
            fsync_enabled: false,
        })
        .unwrap();
        (
            Arc::new(BufferPool::new(
                BufferPoolConfig { num_frames },
                Arc::new(disk),
            )),
            dir,
        )
    }

    #[test]
    fn test_tree_new_defaults() {
        let (pool, _dir) = create_test_pool(16);
        let tree: BPlusTree<Key8> = BPlusTree::new("idx", pool).unwrap();

        assert!(tree.is_empty());
        assert_eq!(tree.name(), "idx");
    }

    #[test]
    fn test_tree_rejects_bad_max_sizes() {
        let (pool, _dir) = create_test_pool(16);

        assert!(matches!(
            BPlusTree::<Key8>::with_max_sizes("idx", pool.clone(), 1, 4),
            Err(TaprootError::InvalidParameter { .. })
        ));
        assert!(matches!(
            BPlusTree::<Key8>::with_max_sizes("idx", pool.clone(), 4, 2),
            Err(TaprootError::InvalidParameter { .. })
        ));
        assert!(matches!(
            BPlusTree::<Key8>::with_max_sizes("idx", pool, 4, u16::MAX),
            Err(TaprootError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_tree_bootstrap_creates_header() {
        let (pool, _dir) = create_test_pool(16);
        let _tree: BPlusTree<Key8> = BPlusTree::new("idx", pool.clone()).unwrap();

        assert_eq!(pool.num_pages_on_disk(), 1);

        // A second tree over the same pool shares the header page.
        let other: BPlusTree<Key8> = BPlusTree::new("other", pool.clone()).unwrap();
        assert!(other.is_empty());
        assert_eq!(pool.num_pages_on_disk(), 1);
    }

    #[test]
    fn test_tree_pin_balance_after_operations() {
        let (pool, _dir) = create_test_pool(16);
        let tree: BPlusTree<Key8> = BPlusTree::with_max_sizes("idx", pool.clone(), 4, 4).unwrap();

        for v in 0..64 {
            tree.insert(Key8::from_int(v), Rid::from_key(v)).unwrap();
        }
        for v in 0..32 {
            tree.remove(&Key8::from_int(v)).unwrap();
        }
        tree.get(&Key8::from_int(40)).unwrap();

        assert_eq!(pool.stats().pinned_frames, 0);
    }
}
