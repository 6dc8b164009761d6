//! Taproot's B+Tree index.
//!
//! A concurrent, disk-resident B+Tree mapping fixed-width keys to record
//! identifiers, built on the `taproot-buffer` page cache. Point lookups,
//! unique-key inserts, deletes and forward scans are linearizable; the
//! root page ID is persisted in a header page so an index survives
//! process restarts.
//!
//! ```no_run
//! use std::sync::Arc;
//! use taproot_buffer::BufferPool;
//! use taproot_common::{Key8, IndexKey, Rid, StorageConfig};
//! use taproot_index::BPlusTree;
//!
//! # fn main() -> taproot_common::Result<()> {
//! let pool = Arc::new(BufferPool::open(&StorageConfig::default())?);
//! let tree: BPlusTree<Key8> = BPlusTree::new("orders_pk", pool)?;
//!
//! tree.insert(Key8::from_int(42), Rid::from_key(42))?;
//! assert!(tree.get(&Key8::from_int(42))?.is_some());
//! for (key, rid) in tree.iter()? {
//!     println!("{key:?} -> {rid}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod btree;
pub mod header;

pub use btree::{BPlusTree, TreeIterator};
pub use header::HeaderPage;
