//! Upstream source classification.
//!
//! Maps the URL of an outbound fetch made by the tile server to a short
//! source label (`os_premium`, `os_open`, `osm`, `b2`, `local`, or the raw
//! host). Rules are evaluated in order and depend only on the configured
//! rule table, so a given URL always maps to the same label.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::config::SourceRulesConfig;

pub const SOURCE_OS_PREMIUM: &str = "os_premium";
pub const SOURCE_OS_OPEN: &str = "os_open";
pub const SOURCE_OSM: &str = "osm";
pub const SOURCE_B2: &str = "b2";
pub const SOURCE_LOCAL: &str = "local";
pub const SOURCE_UNKNOWN: &str = "unknown";

// Matches e.g. /zxy/Outdoor_3857/13/4018/2504.png
fn zxy_regex() -> &'static Regex {
    static ZXY: OnceLock<Regex> = OnceLock::new();
    ZXY.get_or_init(|| {
        Regex::new(r"/zxy/(\w+)/([0-9]+)/").expect("static regex is valid")
    })
}

#[derive(Debug, Clone)]
pub struct SourceClassifier {
    os_host: String,
    osm_host: String,
    b2_domain: String,
    premium_min_zoom: BTreeMap<String, u32>,
}

impl Default for SourceClassifier {
    fn default() -> Self {
        Self::new(&SourceRulesConfig::default())
    }
}

impl SourceClassifier {
    pub fn new(rules: &SourceRulesConfig) -> Self {
        Self {
            os_host: rules.os_host.to_ascii_lowercase(),
            osm_host: rules.osm_host.to_ascii_lowercase(),
            b2_domain: rules.b2_domain.to_ascii_lowercase(),
            premium_min_zoom: rules.premium_min_zoom.clone(),
        }
    }

    /// Classify an upstream URL. Never fails; unparsable URLs yield "unknown".
    pub fn classify(&self, url: &str) -> String {
        let uri = match url.parse::<http::Uri>() {
            Ok(uri) => uri,
            Err(_) => return SOURCE_UNKNOWN.to_string(),
        };
        let host = uri.host().unwrap_or("").to_ascii_lowercase();

        if host == self.os_host {
            return self.classify_os_path(uri.path()).to_string();
        }
        if host == self.osm_host {
            return SOURCE_OSM.to_string();
        }
        if !self.b2_domain.is_empty() && host.contains(&self.b2_domain) {
            return SOURCE_B2.to_string();
        }
        if host.is_empty() || host == "localhost" {
            return SOURCE_LOCAL.to_string();
        }
        host
    }

    /// Premium iff the zxy layer has a threshold and the zoom reaches it.
    fn classify_os_path(&self, path: &str) -> &'static str {
        let Some(caps) = zxy_regex().captures(path) else {
            return SOURCE_OS_OPEN;
        };
        let Some(min_zoom) = self.premium_threshold(&caps[1]) else {
            return SOURCE_OS_OPEN;
        };
        // Digits that overflow u32 are a zoom above any threshold
        let zoom = caps[2].parse::<u32>().unwrap_or(u32::MAX);
        if zoom >= min_zoom {
            SOURCE_OS_PREMIUM
        } else {
            SOURCE_OS_OPEN
        }
    }

    /// Premium threshold configured for a layer, if any
    pub fn premium_threshold(&self, layer: &str) -> Option<u32> {
        self.premium_min_zoom.get(layer).copied()
    }
}
