//! Metrics, source classification and upstream log configuration types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::constants::{
    DEFAULT_B2_DOMAIN, DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_KNOWN_SERVICES,
    DEFAULT_LOG_POLL_INTERVAL_MS, DEFAULT_METRICS_NAMESPACE, DEFAULT_OSM_HOST, DEFAULT_OS_HOST,
};

fn default_namespace() -> String {
    DEFAULT_METRICS_NAMESPACE.to_string()
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

pub fn default_known_services() -> Vec<String> {
    DEFAULT_KNOWN_SERVICES.iter().map(|s| s.to_string()).collect()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_LOG_POLL_INTERVAL_MS
}

fn default_os_host() -> String {
    DEFAULT_OS_HOST.to_string()
}

fn default_osm_host() -> String {
    DEFAULT_OSM_HOST.to_string()
}

fn default_b2_domain() -> String {
    DEFAULT_B2_DOMAIN.to_string()
}

/// Zoom levels at which OS Maps API layers become premium.
///
/// 3857 layers are open for 7-16 and premium for 17-20; 27700 layers are
/// open for 0-9 with premium from 10, except Leisure which is premium from 6.
pub fn default_premium_min_zoom() -> BTreeMap<String, u32> {
    [
        ("Outdoor_3857", 17),
        ("Road_3857", 17),
        ("Light_3857", 17),
        ("Outdoor_27700", 10),
        ("Road_27700", 10),
        ("Light_27700", 10),
        ("Leisure_27700", 6),
    ]
    .into_iter()
    .map(|(layer, zoom)| (layer.to_string(), zoom))
    .collect()
}

/// Metrics registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prefix for every metric family name (default: "mapproxy")
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Shared directory for multi-process aggregation; enables it when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiprocess_dir: Option<PathBuf>,

    /// Interval between snapshot flushes in multi-process mode (default: 1000ms)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Layer allowlist for tile metrics. Empty accepts every layer, which
    /// leaves the layer label unbounded; set it in any public deployment.
    #[serde(default)]
    pub known_layers: Vec<String>,

    /// First path segments kept as the service label; others become `other`
    #[serde(default = "default_known_services")]
    pub known_services: Vec<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            multiprocess_dir: None,
            flush_interval_ms: default_flush_interval_ms(),
            known_layers: Vec::new(),
            known_services: default_known_services(),
        }
    }
}

/// Host rules for labelling upstream fetches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceRulesConfig {
    #[serde(default = "default_os_host")]
    pub os_host: String,
    #[serde(default = "default_osm_host")]
    pub osm_host: String,
    #[serde(default = "default_b2_domain")]
    pub b2_domain: String,
    /// Layer name -> minimum premium zoom on `os_host`
    #[serde(default = "default_premium_min_zoom")]
    pub premium_min_zoom: BTreeMap<String, u32>,
}

impl Default for SourceRulesConfig {
    fn default() -> Self {
        Self {
            os_host: default_os_host(),
            osm_host: default_osm_host(),
            b2_domain: default_b2_domain(),
            premium_min_zoom: default_premium_min_zoom(),
        }
    }
}

/// External upstream log followed by the correlator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamLogConfig {
    pub path: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Regex with a `message` group extracting the record from a formatted line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_pattern: Option<String>,
}
