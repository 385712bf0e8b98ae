// =============================================================================
// Service Configuration — hot-loadable settings with atomic save
// =============================================================================
//
// Every tunable lives here so the service can be reconfigured without code
// changes. Persistence uses an atomic tmp + rename pattern to prevent
// corruption on crash. All fields carry `#[serde(default)]` so that adding a
// new field never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_db_path() -> String {
    "pattern_realtime.db".to_string()
}

fn default_matcher_base_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_price_snapshot_base_url() -> String {
    "https://api.polygon.io".to_string()
}

fn default_price_aggs_base_url() -> String {
    "https://api.polygon.io".to_string()
}

fn default_verification_check_interval_secs() -> u64 {
    60
}

fn default_price_poll_interval_secs() -> u64 {
    15
}

fn default_retention_days() -> i64 {
    30
}

fn default_k() -> u32 {
    50
}

fn default_horizon() -> i64 {
    10
}

fn default_alpha() -> f64 {
    0.05
}

fn default_min_edge() -> f64 {
    0.0
}

fn default_max_concurrency() -> usize {
    8
}

/// Top-level runtime configuration for the pattern-matching service.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Address the HTTP/WS facade binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Optional admin bearer token guarding `run`/`cancel`. When absent,
    /// those endpoints are open (single-tenant / local-dev deployments).
    #[serde(default)]
    pub admin_token: Option<String>,

    /// SQLite database path, or `:memory:` for ephemeral runs.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Base URL of the external nearest-neighbor pattern matcher.
    #[serde(default = "default_matcher_base_url")]
    pub matcher_base_url: String,

    /// Base URL for live price snapshots.
    #[serde(default = "default_price_snapshot_base_url")]
    pub price_snapshot_base_url: String,

    /// Base URL for minute-aggregate price fallback.
    #[serde(default = "default_price_aggs_base_url")]
    pub price_aggs_base_url: String,

    /// API key for the price provider.
    #[serde(default)]
    pub price_api_key: String,

    /// How often the verification worker sweeps for matured predictions.
    #[serde(default = "default_verification_check_interval_secs")]
    pub verification_check_interval_secs: u64,

    /// How often the price tracker polls for live unrealized PnL.
    #[serde(default = "default_price_poll_interval_secs")]
    pub price_poll_interval_secs: u64,

    /// Days of history retained before `cleanup_old_data` prunes it.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Bounded concurrency for `ScanEngine::run_parallel`.
    #[serde(default = "default_max_concurrency")]
    pub max_scan_concurrency: usize,

    /// Default scan parameters applied when a request omits them.
    #[serde(default = "default_k")]
    pub default_k: u32,
    #[serde(default = "default_horizon")]
    pub default_horizon: i64,
    #[serde(default = "default_alpha")]
    pub default_alpha: f64,
    #[serde(default = "default_min_edge")]
    pub default_min_edge: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            admin_token: None,
            db_path: default_db_path(),
            matcher_base_url: default_matcher_base_url(),
            price_snapshot_base_url: default_price_snapshot_base_url(),
            price_aggs_base_url: default_price_aggs_base_url(),
            price_api_key: String::new(),
            verification_check_interval_secs: default_verification_check_interval_secs(),
            price_poll_interval_secs: default_price_poll_interval_secs(),
            retention_days: default_retention_days(),
            max_scan_concurrency: default_max_concurrency(),
            default_k: default_k(),
            default_horizon: default_horizon(),
            default_alpha: default_alpha(),
            default_min_edge: default_min_edge(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read service config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse service config from {}", path.display()))?;

        info!(path = %path.display(), bind_addr = %config.bind_addr, "service config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename). Prevents corruption if the process
    /// crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialize service config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "service config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert!(cfg.admin_token.is_none());
        assert_eq!(cfg.default_k, 50);
        assert_eq!(cfg.default_horizon, 10);
        assert_eq!(cfg.retention_days, 30);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: ServiceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.max_scan_concurrency, 8);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "bind_addr": "127.0.0.1:9090", "admin_token": "secret" }"#;
        let cfg: ServiceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9090");
        assert_eq!(cfg.admin_token.as_deref(), Some("secret"));
        assert_eq!(cfg.default_alpha, 0.05);
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = ServiceConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: ServiceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.bind_addr, cfg2.bind_addr);
        assert_eq!(cfg.db_path, cfg2.db_path);
    }

    #[test]
    fn save_then_load_roundtrips_via_tempfile() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("pattern_realtime_config_test_{}.json", std::process::id()));
        let mut cfg = ServiceConfig::default();
        cfg.bind_addr = "127.0.0.1:1234".to_string();
        cfg.save(&path).unwrap();

        let loaded = ServiceConfig::load(&path).unwrap();
        assert_eq!(loaded.bind_addr, "127.0.0.1:1234");

        std::fs::remove_file(&path).ok();
    }
}
