//! Page identifiers and sizing for Taproot storage.

use serde::{Deserialize, Serialize};

/// Default page size in bytes (16 KB).
pub const PAGE_SIZE: usize = 16 * 1024;

/// Unique identifier for a page within the data file.
///
/// Pages are numbered from zero. Page 0 is reserved for the header page
/// that records index roots; see `PageId::HEADER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Sentinel meaning "no page".
    pub const INVALID: PageId = PageId(u32::MAX);

    /// The well-known header page holding `(index name, root page id)` records.
    pub const HEADER: PageId = PageId(0);

    /// Returns true if this is a valid page ID.
    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "page:{}", self.0)
        } else {
            write!(f, "page:invalid")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_constant() {
        assert_eq!(PAGE_SIZE, 16 * 1024);
        assert_eq!(PAGE_SIZE, 16384);
    }

    #[test]
    fn test_page_id_validity() {
        assert!(PageId(0).is_valid());
        assert!(PageId(123).is_valid());
        assert!(!PageId::INVALID.is_valid());
    }

    #[test]
    fn test_header_page_id() {
        assert_eq!(PageId::HEADER, PageId(0));
        assert!(PageId::HEADER.is_valid());
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId(5).to_string(), "page:5");
        assert_eq!(PageId::INVALID.to_string(), "page:invalid");
    }

    #[test]
    fn test_page_id_ordering() {
        assert!(PageId(1) < PageId(2));
        assert!(PageId(100) < PageId::INVALID);
    }

    #[test]
    fn test_page_id_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(PageId(1));
        set.insert(PageId(2));
        set.insert(PageId(1)); // Duplicate

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_page_id_serde_roundtrip() {
        let original = PageId(500);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PageId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
