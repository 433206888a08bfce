//! Configuration loading, validation, and hot-reload.
//!
//! Grounded in the teacher's `config::Config` loader (parse -> validate ->
//! expose behind a swappable handle), adapted from YAML to the JSON shape
//! `data/config.json` requires (see SPEC_FULL.md §6).

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::{ProxyError, ProxyResult};

fn validate_base_url(url: &str) -> Result<(), validator::ValidationError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(validator::ValidationError::new("invalid_base_url"))
    }
}

/// One configured path prefix and the rules that govern it.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PathConfig {
    #[validate(custom(function = "validate_base_url"))]
    pub default_target: String,
    #[serde(default)]
    pub redirect_mode: bool,
    #[serde(default)]
    #[validate(nested)]
    pub extension_map: Vec<ExtensionRuleConfig>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Raw (on-disk) shape of an extension rule, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ExtensionRuleConfig {
    /// Comma-separated extension tokens, or `*` for wildcard.
    pub extensions: String,
    #[validate(custom(function = "validate_base_url"))]
    pub target: String,
    #[serde(default)]
    pub size_threshold: i64,
    #[serde(default)]
    pub max_size: i64,
    #[serde(default)]
    pub redirect_mode: bool,
    /// Comma-separated host list; empty means "any host".
    #[serde(default)]
    pub domains: String,
}

/// Cache tuning knobs, all zero-valued fields mean "use defaults" per the
/// historical `CacheManager` constructor contract (SPEC_FULL.md §9).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    /// Minutes of inactivity before an entry goes stale.
    #[serde(default)]
    pub max_age: u64,
    /// Minutes between cleanup sweeps.
    #[serde(default)]
    pub cleanup_tick: u64,
    /// Total on-disk budget, in gigabytes.
    #[serde(default)]
    pub max_cache_size: u64,
}

impl CacheConfig {
    pub const DEFAULT_MAX_AGE_MINUTES: u64 = 30;
    pub const DEFAULT_CLEANUP_TICK_MINUTES: u64 = 5;
    pub const DEFAULT_MAX_CACHE_SIZE_GB: u64 = 10;

    pub fn max_age(&self) -> std::time::Duration {
        let minutes = if self.max_age == 0 {
            Self::DEFAULT_MAX_AGE_MINUTES
        } else {
            self.max_age
        };
        std::time::Duration::from_secs(minutes * 60)
    }

    pub fn cleanup_tick(&self) -> std::time::Duration {
        let minutes = if self.cleanup_tick == 0 {
            Self::DEFAULT_CLEANUP_TICK_MINUTES
        } else {
            self.cleanup_tick
        };
        std::time::Duration::from_secs(minutes * 60)
    }

    pub fn max_cache_size_bytes(&self) -> u64 {
        let gb = if self.max_cache_size == 0 {
            Self::DEFAULT_MAX_CACHE_SIZE_GB
        } else {
            self.max_cache_size
        };
        gb * 1024 * 1024 * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub address: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_path")]
    pub path: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_path() -> String {
    "data/logs/proxy.log".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            level: default_log_level(),
        }
    }
}

/// Root configuration object, deserialized from `data/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[serde(rename = "MAP", default)]
    #[validate(nested)]
    pub map: HashMap<String, PathConfig>,
    #[serde(rename = "Cache", default)]
    pub cache: CacheConfig,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(rename = "Admin")]
    pub admin: Option<AdminConfig>,
    #[serde(rename = "Log", default)]
    pub log: LogConfig,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            cache: CacheConfig::default(),
            listen: default_listen(),
            admin: None,
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from disk, creating a default file on first run.
    pub fn load_or_init<P: AsRef<Path>>(path: P) -> ProxyResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let default = AppConfig::default();
            default.save(path)?;
            return Ok(default);
        }
        Self::load(path)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> ProxyResult<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .map_err(|e| ProxyError::Configuration(format!("reading config: {e}")))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> ProxyResult<Self> {
        let config: AppConfig = serde_json::from_str(raw)
            .map_err(|e| ProxyError::Configuration(format!("parsing config: {e}")))?;
        config
            .validate()
            .map_err(|e| ProxyError::Configuration(format!("validating config: {e}")))?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> ProxyResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Configuration(format!("serializing config: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Holds the live configuration behind an atomically-swappable pointer so
/// readers never block on a reload (mirrors the teacher's preference for
/// lock-free hot paths over a config `RwLock`).
pub struct ConfigHandle {
    path: PathBuf,
    current: ArcSwap<AppConfig>,
}

impl ConfigHandle {
    pub fn load_or_init<P: Into<PathBuf>>(path: P) -> ProxyResult<Self> {
        let path = path.into();
        let config = AppConfig::load_or_init(&path)?;
        Ok(Self {
            path,
            current: ArcSwap::from_pointee(config),
        })
    }

    pub fn current(&self) -> Arc<AppConfig> {
        self.current.load_full()
    }

    /// Re-reads the file from disk; on failure the prior configuration is
    /// kept and the error is returned for logging (SPEC_FULL.md §7).
    pub fn reload(&self) -> ProxyResult<()> {
        let fresh = AppConfig::load(&self.path)?;
        self.current.store(Arc::new(fresh));
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_valued_cache_fields_use_defaults() {
        let cache = CacheConfig::default();
        assert_eq!(cache.max_age().as_secs(), 30 * 60);
        assert_eq!(cache.cleanup_tick().as_secs(), 5 * 60);
        assert_eq!(cache.max_cache_size_bytes(), 10 * 1024 * 1024 * 1024);
    }

    #[test]
    fn load_or_init_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = AppConfig::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.listen, "0.0.0.0:8080");
    }

    #[test]
    fn invalid_json_is_rejected() {
        let err = AppConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, ProxyError::Configuration(_)));
    }
}
