//! Record identifiers.

use crate::page::PageId;
use serde::{Deserialize, Serialize};

/// Identifier for a record stored outside the index: a data page plus a
/// slot number within it. This is the value type stored in tree leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid {
    /// Data page holding the record.
    pub page_id: PageId,
    /// Slot within the page.
    pub slot: u32,
}

impl Rid {
    /// On-page encoding size in bytes.
    pub const ENCODED_LEN: usize = 8;

    /// Creates a new record identifier.
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }

    /// Packs an integer key into a record id, upper half as the page and
    /// lower half as the slot. Used by the file-based bulk loaders.
    pub fn from_key(key: i64) -> Self {
        Self {
            page_id: PageId((key >> 32) as u32),
            slot: key as u32,
        }
    }

    /// Writes the rid into `buf` (exactly `ENCODED_LEN` bytes).
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.page_id.0.to_le_bytes());
        buf[4..8].copy_from_slice(&self.slot.to_le_bytes());
    }

    /// Reads a rid back from `buf`.
    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            page_id: PageId(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            slot: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_id.0, self.slot)
    }
}
