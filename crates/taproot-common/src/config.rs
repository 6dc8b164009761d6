//! Configuration structures for Taproot.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration for an index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the index data file.
    pub path: PathBuf,
    /// Buffer pool size in number of frames.
    pub buffer_pool_frames: usize,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./taproot.db"),
            buffer_pool_frames: 1024,
            fsync_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PAGE_SIZE;

    #[test]
    fn test_storage_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.path, PathBuf::from("./taproot.db"));
        assert_eq!(config.buffer_pool_frames, 1024);
        assert!(config.fsync_enabled);
        // 1024 frames of 16 KB pages = 16 MB resident
        assert_eq!(config.buffer_pool_frames * PAGE_SIZE, 16 * 1024 * 1024);
    }

    #[test]
    fn test_storage_config_custom() {
        let config = StorageConfig {
            path: PathBuf::from("/var/lib/taproot/index.db"),
            buffer_pool_frames: 64,
            fsync_enabled: false,
        };
        assert_eq!(config.path, PathBuf::from("/var/lib/taproot/index.db"));
        assert_eq!(config.buffer_pool_frames, 64);
        assert!(!config.fsync_enabled);
    }

    #[test]
    fn test_storage_config_serde_roundtrip() {
        let original = StorageConfig::default();
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StorageConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.path, deserialized.path);
        assert_eq!(original.buffer_pool_frames, deserialized.buffer_pool_frames);
        assert_eq!(original.fsync_enabled, deserialized.fsync_enabled);
    }
}
