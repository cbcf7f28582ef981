//! Inbound request routing and classification.
//!
//! Every inbound path resolves to exactly one [`Route`]: the metrics
//! endpoint, a manifest document, or a delegated request classified as a
//! tile (`layer`, `zoom`) or as another service (first path segment).

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::config::default_known_services;
use crate::constants::{MAX_ZOOM, METRICS_PATH, OTHER_LAYER, OTHER_SERVICE, OTHER_ZOOM};

// Matches /tiles/{layer}/{grid}/{z}/{x}/{y}.{format} and
// /tiles/{layer}/{z}/{x}/{y}.{format} (grid may be absent); same for /tms/
fn tile_regex() -> &'static Regex {
    static TILE: OnceLock<Regex> = OnceLock::new();
    TILE.get_or_init(|| {
        Regex::new(
            r"^/(?:tiles|tms)/(?P<layer>[^/]+)/(?:[^/]+/)?(?P<z>[0-9]+)/[0-9]+/[0-9]+\.\w+$",
        )
        .expect("static regex is valid")
    })
}

fn service_regex() -> &'static Regex {
    static SERVICE: OnceLock<Regex> = OnceLock::new();
    SERVICE.get_or_init(|| Regex::new(r"^/(\w+)").expect("static regex is valid"))
}

fn manifest_regex() -> &'static Regex {
    static MANIFEST: OnceLock<Regex> = OnceLock::new();
    MANIFEST.get_or_init(|| {
        Regex::new(r"^/tilejson/([a-z0-9_-]+)\.json$").expect("static regex is valid")
    })
}

/// Metric dimension of a delegated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestClass {
    Tile { layer: String, zoom: String },
    Other { service: String },
}

/// What the middleware does with an inbound path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Serve the metrics exposition, bypassing the tile server
    Metrics,
    /// Serve `{name}.json` from the manifest directory
    Manifest(String),
    /// Forward to the tile server and record metrics under this class
    Delegate(RequestClass),
}

/// Maps paths to routes and bounded label values.
///
/// Services and zooms are always bounded. Layers are bounded only when a
/// layer allowlist is configured.
#[derive(Debug, Clone)]
pub struct RouteClassifier {
    /// Layer allowlist; empty accepts any layer matched by the tile pattern
    known_layers: HashSet<String>,
    /// Service allowlist; anything else is labelled `other`
    known_services: HashSet<String>,
}

impl Default for RouteClassifier {
    fn default() -> Self {
        Self::new(Vec::<String>::new(), default_known_services())
    }
}

impl RouteClassifier {
    pub fn new<L, S, T, U>(known_layers: L, known_services: T) -> Self
    where
        L: IntoIterator<Item = S>,
        S: Into<String>,
        T: IntoIterator<Item = U>,
        U: Into<String>,
    {
        Self {
            known_layers: known_layers.into_iter().map(Into::into).collect(),
            known_services: known_services.into_iter().map(Into::into).collect(),
        }
    }

    /// True when tile layers go into labels unchecked
    pub fn layers_unbounded(&self) -> bool {
        self.known_layers.is_empty()
    }

    pub fn route(&self, path: &str) -> Route {
        if path == METRICS_PATH {
            return Route::Metrics;
        }
        if let Some(caps) = manifest_regex().captures(path) {
            return Route::Manifest(caps[1].to_string());
        }
        Route::Delegate(self.classify(path))
    }

    /// Classify a delegated path as tile or other-service traffic
    pub fn classify(&self, path: &str) -> RequestClass {
        if let Some(caps) = tile_regex().captures(path) {
            let layer = &caps["layer"];
            let layer = if self.known_layers.is_empty() || self.known_layers.contains(layer) {
                layer.to_string()
            } else {
                OTHER_LAYER.to_string()
            };
            return RequestClass::Tile {
                layer,
                zoom: canonical_zoom(&caps["z"]),
            };
        }

        let service = service_regex()
            .captures(path)
            .map(|caps| caps.get(1).map_or("", |m| m.as_str()))
            .filter(|service| self.known_services.contains(*service))
            .unwrap_or(OTHER_SERVICE);
        RequestClass::Other {
            service: service.to_string(),
        }
    }
}

// "012" and "12" are one series; out-of-range zooms share one label
fn canonical_zoom(digits: &str) -> String {
    match digits.parse::<u32>() {
        Ok(zoom) if zoom <= MAX_ZOOM => zoom.to_string(),
        _ => OTHER_ZOOM.to_string(),
    }
}
