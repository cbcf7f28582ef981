// Constants module - centralized default values for configuration
//
// This module defines all default values used throughout the codebase.
// Using constants instead of magic numbers keeps the defaults in one place.

// =============================================================================
// Server defaults
// =============================================================================

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;

/// Default number of worker threads
pub const DEFAULT_THREADS: usize = 4;

/// Default timeout for the wrapped tile server in seconds
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// Endpoint paths
// =============================================================================

/// Path of the metrics exposition endpoint
pub const METRICS_PATH: &str = "/metrics";

// =============================================================================
// Cache policy
// =============================================================================

/// Cache-Control for production responses: 24 hours (24 * 3600 seconds),
/// matching the upstream data licence terms
pub const PRODUCTION_CACHE_CONTROL: &str = "public, max-age=86400, immutable";

/// Cache-Control for development responses
pub const DEV_CACHE_CONTROL: &str = "no-cache, no-store, must-revalidate";

// =============================================================================
// Cache scan defaults
// =============================================================================

/// Reserved lock directory inside the cache root, excluded from usage scans
pub const DEFAULT_LOCK_DIR_NAME: &str = "tile_locks";

/// Default cache root
pub const DEFAULT_CACHE_ROOT: &str = "/mapproxy/cache_data";

/// Default directory holding tile metadata manifests
pub const DEFAULT_MANIFEST_DIR: &str = "/tilejson";

// =============================================================================
// Metrics defaults
// =============================================================================

/// Default metric name prefix
pub const DEFAULT_METRICS_NAMESPACE: &str = "mapproxy";

/// Default interval between multi-process snapshot flushes in milliseconds
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;

/// Status label used when no response status was ever produced
pub const STATUS_SENTINEL: &str = "none";

/// Service label for paths without a leading word segment
pub const OTHER_SERVICE: &str = "other";

/// Layer label for layers outside the configured allowlist
pub const OTHER_LAYER: &str = "other";

/// Zoom label for zooms above [`MAX_ZOOM`]
pub const OTHER_ZOOM: &str = "other";

/// First path segments of the MapProxy services
pub const DEFAULT_KNOWN_SERVICES: [&str; 7] =
    ["tiles", "tms", "wmts", "wms", "kml", "demo", "service"];

// =============================================================================
// Source classification defaults
// =============================================================================

/// Open-data mapping provider API host
pub const DEFAULT_OS_HOST: &str = "api.os.uk";

/// Open street-tile host
pub const DEFAULT_OSM_HOST: &str = "tile.openstreetmap.org";

/// Object-storage provider domain suffix
pub const DEFAULT_B2_DOMAIN: &str = "backblazeb2.com";

/// Highest zoom accepted in a premium-zoom table or a tile label
pub const MAX_ZOOM: u32 = 30;

// =============================================================================
// Upstream log defaults
// =============================================================================

/// Default poll interval for the upstream log follower in milliseconds
pub const DEFAULT_LOG_POLL_INTERVAL_MS: u64 = 250;

/// Field value meaning "not measured" in an upstream fetch record
pub const FIELD_SENTINEL: &str = "-";
