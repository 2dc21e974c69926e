use std::path::PathBuf;
use std::time::Duration;

use crate::limits::*;

/// Process settings, read once from `VENUEBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub op_timeout: Duration,
    pub preview_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            op_timeout: Duration::from_millis(DEFAULT_OP_TIMEOUT_MS),
            preview_ttl: Duration::from_millis(PREVIEW_TTL_MS as u64),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            data_dir: lookup("VENUEBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: lookup("VENUEBOOK_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            compact_threshold: parsed("VENUEBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            op_timeout: parsed("VENUEBOOK_OP_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.op_timeout),
            preview_ttl: parsed("VENUEBOOK_PREVIEW_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.preview_ttl),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("venuebook.wal")
    }
}
