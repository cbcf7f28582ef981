// Configuration module

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::{DEFAULT_CACHE_ROOT, DEFAULT_LOCK_DIR_NAME, DEFAULT_MANIFEST_DIR, MAX_ZOOM};

pub mod metrics;
pub mod server;

pub use metrics::{default_known_services, MetricsConfig, SourceRulesConfig, UpstreamLogConfig};
pub use server::{ServerConfig, UpstreamConfig};

fn default_cache_root() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_ROOT)
}

fn default_lock_dir_name() -> String {
    DEFAULT_LOCK_DIR_NAME.to_string()
}

fn default_manifest_dir() -> PathBuf {
    PathBuf::from(DEFAULT_MANIFEST_DIR)
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// On-disk tile cache measured by the usage scanner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,
    /// Reserved lock directory excluded from scans (default: "tile_locks")
    #[serde(default = "default_lock_dir_name")]
    pub lock_dir_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            lock_dir_name: default_lock_dir_name(),
        }
    }
}

/// Directory of tile metadata manifests served under /tilejson/
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    #[serde(default = "default_manifest_dir")]
    pub dir: PathBuf,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            dir: default_manifest_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// JSON output for log aggregation (default: true)
    #[serde(default = "default_true")]
    pub json: bool,
    /// Default filter when RUST_LOG is unset (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: default_true(),
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub manifests: ManifestConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub sources: SourceRulesConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_log: Option<UpstreamLogConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_yaml_with_env(yaml: &str) -> Result<Self, String> {
        // Replace ${VAR_NAME} with environment variable values
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").map_err(|e| e.to_string())?;

        // First, check that all referenced environment variables exist
        for caps in re.captures_iter(yaml) {
            let var_name = &caps[1];
            std::env::var(var_name).map_err(|_| {
                format!(
                    "Environment variable '{}' is referenced but not set",
                    var_name
                )
            })?;
        }

        let substituted = re.replace_all(yaml, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        });

        serde_yaml::from_str(&substituted).map_err(|e| e.to_string())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let mut config = Self::from_yaml_with_env(&yaml)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Apply deployment overrides: DEV_MODE, TILEJSON_DIR, PROMETHEUS_MULTIPROC_DIR.
    ///
    /// `lookup` abstracts the environment so tests don't mutate process state.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dev) = lookup("DEV_MODE") {
            self.dev_mode = !dev.is_empty();
        }
        if let Some(dir) = lookup("TILEJSON_DIR").filter(|d| !d.is_empty()) {
            self.manifests.dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("PROMETHEUS_MULTIPROC_DIR").filter(|d| !d.is_empty()) {
            self.metrics.multiprocess_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port must be greater than 0".to_string());
        }

        if self.upstream.address.trim().is_empty() {
            return Err("Upstream address cannot be empty".to_string());
        }

        let namespace_re =
            Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").map_err(|e| e.to_string())?;
        if !namespace_re.is_match(&self.metrics.namespace) {
            return Err(format!(
                "Invalid metrics namespace '{}'. Must match [a-zA-Z_][a-zA-Z0-9_]*",
                self.metrics.namespace
            ));
        }

        if self.metrics.flush_interval_ms == 0 {
            return Err("metrics.flush_interval_ms must be greater than 0".to_string());
        }

        if self.cache.lock_dir_name.is_empty() {
            return Err("cache.lock_dir_name cannot be empty".to_string());
        }

        for (layer, zoom) in &self.sources.premium_min_zoom {
            if *zoom > MAX_ZOOM {
                return Err(format!(
                    "Premium zoom {} for layer '{}' exceeds maximum zoom {}",
                    zoom, layer, MAX_ZOOM
                ));
            }
        }

        if let Some(log) = &self.upstream_log {
            if log.poll_interval_ms == 0 {
                return Err("upstream_log.poll_interval_ms must be greater than 0".to_string());
            }
            if let Some(pattern) = &log.message_pattern {
                let re = Regex::new(pattern)
                    .map_err(|e| format!("Invalid upstream_log.message_pattern: {}", e))?;
                if !re.capture_names().any(|name| name == Some("message")) {
                    return Err(
                        "upstream_log.message_pattern must contain a named group 'message'"
                            .to_string(),
                    );
                }
            }
        }

        Ok(())
    }
}
