//! Store configuration, loadable from TOML or JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::btree::node::max_encoded_len;
use crate::btree::PAGE_HEADER_LEN;
use crate::error::{StoreError, StoreResult};

/// What a writer does when another transaction holds the write intent on
/// the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Return a retriable `WriteConflict` immediately.
    #[default]
    FailFast,
    /// Wait up to `wait_ms` for the holder to commit or abort, then fail
    /// with `WriteConflict`.
    Block {
        /// Upper bound on the wait in milliseconds.
        wait_ms: u64,
    },
}

/// Configuration for a file store instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding index, data and journal files.
    pub root_dir: PathBuf,
    /// B-tree page size in bytes (power of two, at least 4096).
    pub page_size: u32,
    /// Minimum degree `t` of the B-trees; nodes hold up to `2t - 1` keys.
    pub btree_min_degree: u32,
    /// Node cache capacity per tree, in nodes.
    pub node_cache_entries: usize,
    /// Data files roll over once they grow past this size.
    pub max_data_file_bytes: u64,
    /// Idle time after which the reaper force-aborts a transaction.
    pub transaction_timeout_secs: u64,
    /// Interval between reaper scans.
    pub reaper_interval_ms: u64,
    /// How long an expired transaction stays visible to monitoring.
    pub expired_retention_secs: u64,
    /// Policy for concurrent writers of the same id.
    pub conflict_policy: ConflictPolicy,
    /// Whether commit fsyncs data, journal and index files.
    pub sync_on_commit: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/tsfs"),
            page_size: 32 * 1024,
            btree_min_degree: 16,
            node_cache_entries: 4096,
            max_data_file_bytes: 256 * 1024 * 1024, // 256MB
            transaction_timeout_secs: 600,
            reaper_interval_ms: 1000,
            expired_retention_secs: 3600,
            conflict_policy: ConflictPolicy::FailFast,
            sync_on_commit: true,
        }
    }
}

impl StoreConfig {
    /// Default configuration rooted at `root_dir`.
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    /// Loads a configuration file; the format follows the extension.
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: StoreConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| StoreError::InvalidConfig(e.to_string()))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| StoreError::InvalidConfig(e.to_string()))?,
            _ => {
                return Err(StoreError::InvalidConfig(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that the tuning parameters are mutually consistent.
    pub fn validate(&self) -> StoreResult<()> {
        if !self.page_size.is_power_of_two() || self.page_size < 4096 {
            return Err(StoreError::InvalidConfig(format!(
                "page_size {} must be a power of two >= 4096",
                self.page_size
            )));
        }
        if self.btree_min_degree < 2 {
            return Err(StoreError::InvalidConfig(format!(
                "btree_min_degree {} must be at least 2",
                self.btree_min_degree
            )));
        }
        let needed = max_encoded_len(self.btree_min_degree) + PAGE_HEADER_LEN;
        if needed > self.page_size as usize {
            return Err(StoreError::InvalidConfig(format!(
                "a full node with min degree {} needs {} bytes, page_size is {}",
                self.btree_min_degree, needed, self.page_size
            )));
        }
        if self.node_cache_entries == 0 {
            return Err(StoreError::InvalidConfig(
                "node_cache_entries must be positive".to_string(),
            ));
        }
        if self.reaper_interval_ms == 0 {
            return Err(StoreError::InvalidConfig(
                "reaper_interval_ms must be positive".to_string(),
            ));
        }
        if self.transaction_timeout_secs == 0 {
            return Err(StoreError::InvalidConfig(
                "transaction_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Idle timeout as a duration.
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    /// Reaper scan interval as a duration.
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    /// Expired-transaction retention as a duration.
    pub fn expired_retention(&self) -> Duration {
        Duration::from_secs(self.expired_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = StoreConfig::default();
        assert_eq!(config.page_size, 32768);
        assert_eq!(config.btree_min_degree, 16);
        assert_eq!(config.conflict_policy, ConflictPolicy::FailFast);
        assert!(config.sync_on_commit);
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_small_page_for_degree() {
        let config = StoreConfig {
            page_size: 4096,
            btree_min_degree: 64,
            ..StoreConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_odd_page_size() {
        let config = StoreConfig {
            page_size: 5000,
            ..StoreConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
root_dir = "/data/tsfs"
btree_min_degree = 8
transaction_timeout_secs = 30

[conflict_policy]
mode = "block"
wait_ms = 250
            "#
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.root_dir, PathBuf::from("/data/tsfs"));
        assert_eq!(config.btree_min_degree, 8);
        assert_eq!(config.transaction_timeout(), Duration::from_secs(30));
        assert_eq!(config.conflict_policy, ConflictPolicy::Block { wait_ms: 250 });
        assert_eq!(config.page_size, 32768);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"root_dir": "/tmp/x", "conflict_policy": {{"mode": "fail_fast"}}, "sync_on_commit": false}}"#
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.root_dir, PathBuf::from("/tmp/x"));
        assert!(!config.sync_on_commit);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            StoreConfig::from_file(file.path()),
            Err(StoreError::InvalidConfig(_))
        ));
    }
}
