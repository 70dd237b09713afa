//! Storage engine configuration.
//!
//! Provides [`DbConfig`] with defaults suitable for a mid-size chain. The
//! struct deserializes from the host's config file; everything has a
//! sensible default so an empty table works.

use serde::Deserialize;

/// Tuning knobs for the RocksDB environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Size of the shared LRU block cache in bytes.
    pub cache_size: usize,
    /// Maximum open files passed to RocksDB (-1 for unlimited).
    pub max_open_files: i32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            cache_size: 64 << 20,
            max_open_files: 1 << 14,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cache_is_64_mib() {
        assert_eq!(DbConfig::default().cache_size, 67_108_864);
    }

    #[test]
    fn deserializes_with_defaults() {
        let cfg: DbConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_open_files, DbConfig::default().max_open_files);
    }

    #[test]
    fn deserializes_overrides() {
        let cfg: DbConfig =
            serde_json::from_str(r#"{"cache_size": 1024, "max_open_files": -1}"#).unwrap();
        assert_eq!(cfg.cache_size, 1024);
        assert_eq!(cfg.max_open_files, -1);
    }
}
