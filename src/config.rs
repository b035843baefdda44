//! Collection configuration: the tunables the spec calls out as "a pure function of
//! two tunables" (index-mode selection) plus the backup threshold, order-staging
//! bound and cron expression, loaded the way the teacher's `AppConfig` does:
//! read the TOML file if present, otherwise write out defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Configuration for a single collection's Index Worker + Recommend Task Service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Config schema version, bumped when the on-disk shape changes.
    pub version: u32,

    /// Root directory holding the `current`/`next` directory pair and bundle inbox.
    pub data_dir: PathBuf,

    /// Docs-per-MiB above which a build pass is too large for realtime mode (§4.6).
    pub realtime_threshold_docs_per_mb: f64,

    /// Absolute size ceiling, in MiB, for realtime mode regardless of doc density.
    pub max_realtime_mb: u64,

    /// Cumulative bundle bytes since the last backup that trigger a forced backup (§4.6).
    pub backup_threshold_bytes: u64,

    /// Bound on the in-flight `OrderMap` staging size (§3 `MAX_ORDER_NUM`).
    pub max_order_num: usize,

    /// Cron expression the Recommend Task Service's 60s tick evaluates against (§4.7).
    pub recommend_cron: String,

    /// Whether the log-server forwarder (C9) is enabled.
    pub log_forwarder_enabled: bool,
}

const CONFIG_FILE_NAME: &str = "collex.toml";

impl Config {
    pub fn target_version() -> u32 {
        1
    }

    pub fn default_with_dir(data_dir: PathBuf) -> Self {
        Self {
            version: Self::target_version(),
            data_dir,
            realtime_threshold_docs_per_mb: 200.0,
            max_realtime_mb: 50,
            backup_threshold_bytes: 200 * 1024 * 1024,
            max_order_num: 1000,
            recommend_cron: "0 * * * * *".to_string(),
            log_forwarder_enabled: false,
        }
    }

    /// Load configuration from `data_dir`, writing out defaults if absent.
    pub fn load_from(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            info!(path = %config_path.display(), "loading collection config");
            let raw = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&raw)
                .map_err(|e| Error::bad_format(format!("invalid config at {config_path:?}: {e}")))?;
            Ok(config)
        } else {
            warn!(path = %config_path.display(), "no config found, writing defaults");
            let config = Self::default_with_dir(data_dir.to_path_buf());
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let config_path = self.data_dir.join(CONFIG_FILE_NAME);
        let raw = toml::to_string_pretty(self)
            .map_err(|e| Error::store_error(format!("failed to serialize config: {e}")))?;
        std::fs::write(&config_path, raw)?;
        info!(path = %config_path.display(), "saved collection config");
        Ok(())
    }

    /// Pure function of the two index-mode tunables (§4.6): true selects realtime mode.
    pub fn is_realtime(&self, total_bytes: u64, doc_count: u64) -> bool {
        if doc_count == 0 {
            return true;
        }
        let mb = total_bytes as f64 / (1024.0 * 1024.0);
        let bytes_per_doc = total_bytes as f64 / doc_count as f64;
        let threshold_bytes_per_doc = (1024.0 * 1024.0) / self.realtime_threshold_docs_per_mb;
        bytes_per_doc <= threshold_bytes_per_doc && mb <= self.max_realtime_mb as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_realtime_pure_function_of_tunables() {
        let cfg = Config::default_with_dir(PathBuf::from("/tmp/x"));
        // Small, dense bundle: many small docs comfortably under the per-doc threshold.
        assert!(cfg.is_realtime(1024 * 1024, 1000));
        // Huge bundle: batch, even if doc density would otherwise qualify.
        assert!(!cfg.is_realtime(100 * 1024 * 1024, 100_000));
    }

    #[test]
    fn load_from_writes_defaults_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(dir.path()).unwrap();
        assert_eq!(cfg.max_order_num, 1000);
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
    }

    #[test]
    fn load_from_round_trips_saved_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default_with_dir(dir.path().to_path_buf());
        cfg.max_order_num = 42;
        cfg.save().unwrap();

        let loaded = Config::load_from(dir.path()).unwrap();
        assert_eq!(loaded.max_order_num, 42);
    }
}
