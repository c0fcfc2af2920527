//! Configuration for the offline event cache.
//!
//! # Example
//!
//! ```
//! use telemetry_cache::StorageConfig;
//!
//! // Minimal config (uses defaults)
//! let config = StorageConfig::default();
//! assert_eq!(config.max_storage_bytes, 3 * 1024 * 1024); // 3 MB
//! assert!(config.memory_tier_enabled());
//!
//! // Disk-only, small cache
//! let config = StorageConfig {
//!     cache_file_path: "/tmp/events.db".into(),
//!     max_storage_bytes: 512 * 1024,
//!     memory_queue_bytes: 0,
//!     ..Default::default()
//! };
//! assert!(!config.memory_tier_enabled());
//! ```

use serde::Deserialize;
use std::time::Duration;

/// Configuration consumed from the runtime-config owner.
///
/// All fields have defaults; `cache_file_path` should be set for
/// production use.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file path
    #[serde(default = "default_cache_file_path")]
    pub cache_file_path: String,

    /// Durable tier size ceiling in bytes (default: 3 MB)
    #[serde(default = "default_max_storage_bytes")]
    pub max_storage_bytes: u64,

    /// Share of records dropped per trim pass, in percent (default: 25)
    #[serde(default = "default_trim_percent")]
    pub trim_percent: u32,

    /// Releases with failure beyond this count drop the record (default: 5)
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// Memory tier budget in bytes; 0 disables the tier (default: 512 KB)
    #[serde(default = "default_memory_queue_bytes")]
    pub memory_queue_bytes: u64,

    /// Period of the retained-transaction commit timer; 0 disables it
    #[serde(default = "default_auto_commit_interval_ms")]
    pub auto_commit_interval_ms: u64,

    /// `PRAGMA journal_size_limit` applied at open
    #[serde(default = "default_journal_size_limit_bytes")]
    pub journal_size_limit_bytes: i64,
}

fn default_cache_file_path() -> String { "offline_storage.db".to_string() }
fn default_max_storage_bytes() -> u64 { 3 * 1024 * 1024 } // 3 MB
fn default_trim_percent() -> u32 { DEFAULT_TRIM_PERCENT }
fn default_max_retry_count() -> u32 { 5 }
fn default_memory_queue_bytes() -> u64 { 512 * 1024 } // 512 KB
fn default_auto_commit_interval_ms() -> u64 { 500 }
fn default_journal_size_limit_bytes() -> i64 { 512 * 1024 }

const DEFAULT_TRIM_PERCENT: u32 = 25;

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_file_path: default_cache_file_path(),
            max_storage_bytes: default_max_storage_bytes(),
            trim_percent: default_trim_percent(),
            max_retry_count: default_max_retry_count(),
            memory_queue_bytes: default_memory_queue_bytes(),
            auto_commit_interval_ms: default_auto_commit_interval_ms(),
            journal_size_limit_bytes: default_journal_size_limit_bytes(),
        }
    }
}

impl StorageConfig {
    /// Trim share clamped to a usable percentage.
    #[must_use]
    pub fn effective_trim_percent(&self) -> u32 {
        if self.trim_percent == 0 || self.trim_percent > 100 {
            DEFAULT_TRIM_PERCENT
        } else {
            self.trim_percent
        }
    }

    #[must_use]
    pub fn memory_tier_enabled(&self) -> bool {
        self.memory_queue_bytes > 0
    }

    #[must_use]
    pub fn auto_commit_interval(&self) -> Option<Duration> {
        (self.auto_commit_interval_ms > 0).then(|| Duration::from_millis(self.auto_commit_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.trim_percent, 25);
        assert_eq!(config.max_retry_count, 5);
        assert_eq!(config.memory_queue_bytes, 512 * 1024);
        assert_eq!(config.auto_commit_interval(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_trim_percent_out_of_range_falls_back() {
        let mut config = StorageConfig { trim_percent: 0, ..Default::default() };
        assert_eq!(config.effective_trim_percent(), 25);
        config.trim_percent = 150;
        assert_eq!(config.effective_trim_percent(), 25);
        config.trim_percent = 10;
        assert_eq!(config.effective_trim_percent(), 10);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: StorageConfig = serde_json::from_str(
            r#"{"cache_file_path": "events.db", "memory_queue_bytes": 0, "auto_commit_interval_ms": 0}"#,
        )
        .unwrap();
        assert_eq!(config.cache_file_path, "events.db");
        assert!(!config.memory_tier_enabled());
        assert_eq!(config.auto_commit_interval(), None);
        assert_eq!(config.max_storage_bytes, 3 * 1024 * 1024);
    }
}
