// Metrics module - Prometheus metric families for tile, service, cache and
// upstream traffic
//
// Single-process deployments expose the in-memory registry directly.
// Multi-process deployments additionally write a per-process snapshot into a
// shared directory and expose the merge of every snapshot found there.

use parking_lot::Mutex;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::MetricsConfig;
use crate::error::MetricsError;
use crate::scanner::CacheBucketSnapshot;

pub mod multiprocess;
pub mod render;

pub use multiprocess::{MultiProcessStore, ProcessSnapshot};

/// Content type of the text exposition format
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Aggregation kind of a metric family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Histogram,
    /// Most-recent-write-wins across processes
    Gauge,
}

/// The fixed set of metric families. Label schemas are part of the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    TileRequests,
    TileRequestDuration,
    OtherRequests,
    CacheSizeBytes,
    CacheTiles,
    UpstreamRequests,
    UpstreamRequestDuration,
}

impl Family {
    pub const ALL: [Family; 7] = [
        Family::TileRequests,
        Family::TileRequestDuration,
        Family::OtherRequests,
        Family::CacheSizeBytes,
        Family::CacheTiles,
        Family::UpstreamRequests,
        Family::UpstreamRequestDuration,
    ];

    /// Name without the namespace prefix
    pub fn name(self) -> &'static str {
        match self {
            Family::TileRequests => "tile_requests_total",
            Family::TileRequestDuration => "tile_request_duration_seconds",
            Family::OtherRequests => "other_requests_total",
            Family::CacheSizeBytes => "cache_size_bytes",
            Family::CacheTiles => "cache_tiles_total",
            Family::UpstreamRequests => "upstream_requests_total",
            Family::UpstreamRequestDuration => "upstream_request_duration_seconds",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            Family::TileRequests => "Tile requests by layer, zoom, and status",
            Family::TileRequestDuration => "Tile request duration by layer and zoom",
            Family::OtherRequests => "Non-tile requests by service and status",
            Family::CacheSizeBytes => "Total size of cached tiles in bytes",
            Family::CacheTiles => "Number of cached tiles",
            Family::UpstreamRequests => "Upstream source requests by source and status",
            Family::UpstreamRequestDuration => "Upstream source request duration by source",
        }
    }

    pub fn kind(self) -> MetricKind {
        match self {
            Family::TileRequests | Family::OtherRequests | Family::UpstreamRequests => {
                MetricKind::Counter
            }
            Family::TileRequestDuration | Family::UpstreamRequestDuration => MetricKind::Histogram,
            Family::CacheSizeBytes | Family::CacheTiles => MetricKind::Gauge,
        }
    }

    pub fn label_names(self) -> &'static [&'static str] {
        match self {
            Family::TileRequests => &["layer", "zoom", "status"],
            Family::TileRequestDuration => &["layer", "zoom"],
            Family::OtherRequests => &["service", "status"],
            Family::CacheSizeBytes | Family::CacheTiles => &["cache"],
            Family::UpstreamRequests => &["source", "status"],
            Family::UpstreamRequestDuration => &["source"],
        }
    }
}

/// Owns every metric family. Constructed once and shared behind an `Arc`.
pub struct MetricsRegistry {
    namespace: String,
    registry: Registry,
    counters: HashMap<Family, IntCounterVec>,
    histograms: HashMap<Family, HistogramVec>,
    gauges: HashMap<Family, IntGaugeVec>,
    // Wall-clock micros of the last write per gauge series, for cross-process merging
    gauge_writes: Mutex<HashMap<(Family, Vec<String>), i64>>,
    store: Option<MultiProcessStore>,
    flush_interval: Duration,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("namespace", &self.namespace)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl MetricsRegistry {
    /// Build the registry and, when configured, open the multi-process directory
    pub fn new(config: &MetricsConfig) -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let mut counters = HashMap::new();
        let mut histograms = HashMap::new();
        let mut gauges = HashMap::new();

        for family in Family::ALL {
            match family.kind() {
                MetricKind::Counter => {
                    let vec = IntCounterVec::new(
                        Opts::new(family.name(), family.help()).namespace(config.namespace.clone()),
                        family.label_names(),
                    )?;
                    registry.register(Box::new(vec.clone()))?;
                    counters.insert(family, vec);
                }
                MetricKind::Histogram => {
                    let vec = HistogramVec::new(
                        HistogramOpts::new(family.name(), family.help())
                            .namespace(config.namespace.clone())
                            .buckets(prometheus::DEFAULT_BUCKETS.to_vec()),
                        family.label_names(),
                    )?;
                    registry.register(Box::new(vec.clone()))?;
                    histograms.insert(family, vec);
                }
                MetricKind::Gauge => {
                    let vec = IntGaugeVec::new(
                        Opts::new(family.name(), family.help()).namespace(config.namespace.clone()),
                        family.label_names(),
                    )?;
                    registry.register(Box::new(vec.clone()))?;
                    gauges.insert(family, vec);
                }
            }
        }

        let store = match &config.multiprocess_dir {
            Some(dir) => Some(MultiProcessStore::open(dir)?),
            None => None,
        };

        if let Some(store) = &store {
            tracing::info!(
                dir = %store.dir().display(),
                process_id = %store.process_id(),
                "Multi-process metrics aggregation enabled"
            );
        }

        Ok(Self {
            namespace: config.namespace.clone(),
            registry,
            counters,
            histograms,
            gauges,
            gauge_writes: Mutex::new(HashMap::new()),
            store,
            flush_interval: Duration::from_millis(config.flush_interval_ms),
        })
    }

    /// Fully qualified family name, e.g. `mapproxy_tile_requests_total`
    pub fn full_name(&self, family: Family) -> String {
        format!("{}_{}", self.namespace, family.name())
    }

    pub fn is_multiprocess(&self) -> bool {
        self.store.is_some()
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Increment a counter series by one
    pub fn increment_counter(&self, family: Family, labels: &[&str]) {
        let Some(vec) = self.counters.get(&family) else {
            tracing::debug!(family = family.name(), "increment_counter on a non-counter family");
            return;
        };
        match vec.get_metric_with_label_values(labels) {
            Ok(counter) => counter.inc(),
            Err(e) => tracing::debug!(family = family.name(), error = %e, "Dropped counter update"),
        }
    }

    /// Record one observation in seconds
    pub fn observe_histogram(&self, family: Family, labels: &[&str], value_seconds: f64) {
        let Some(vec) = self.histograms.get(&family) else {
            tracing::debug!(family = family.name(), "observe_histogram on a non-histogram family");
            return;
        };
        match vec.get_metric_with_label_values(labels) {
            Ok(histogram) => histogram.observe(value_seconds),
            Err(e) => {
                tracing::debug!(family = family.name(), error = %e, "Dropped histogram observation")
            }
        }
    }

    /// Set a gauge series; the last writer wins
    pub fn set_gauge(&self, family: Family, labels: &[&str], value: i64) {
        let Some(vec) = self.gauges.get(&family) else {
            tracing::debug!(family = family.name(), "set_gauge on a non-gauge family");
            return;
        };
        match vec.get_metric_with_label_values(labels) {
            Ok(gauge) => {
                gauge.set(value);
                let key = (family, labels.iter().map(|l| l.to_string()).collect());
                self.gauge_writes
                    .lock()
                    .insert(key, chrono::Utc::now().timestamp_micros());
            }
            Err(e) => tracing::debug!(family = family.name(), error = %e, "Dropped gauge update"),
        }
    }

    /// Record a completed tile request
    pub fn record_tile_request(&self, layer: &str, zoom: &str, status: &str, elapsed: Duration) {
        self.increment_counter(Family::TileRequests, &[layer, zoom, status]);
        self.observe_histogram(
            Family::TileRequestDuration,
            &[layer, zoom],
            elapsed.as_secs_f64(),
        );
    }

    /// Record a completed non-tile request
    pub fn record_other_request(&self, service: &str, status: &str) {
        self.increment_counter(Family::OtherRequests, &[service, status]);
    }

    /// Record an upstream fetch reported by the tile server
    pub fn record_upstream_request(
        &self,
        source: &str,
        status: &str,
        duration_seconds: Option<f64>,
    ) {
        self.increment_counter(Family::UpstreamRequests, &[source, status]);
        if let Some(seconds) = duration_seconds {
            self.observe_histogram(Family::UpstreamRequestDuration, &[source], seconds);
        }
    }

    /// Publish a cache scan into the size and tile-count gauges
    pub fn set_cache_usage(&self, buckets: &[CacheBucketSnapshot]) {
        for bucket in buckets {
            let size = i64::try_from(bucket.total_bytes).unwrap_or(i64::MAX);
            let count = i64::try_from(bucket.tile_count).unwrap_or(i64::MAX);
            self.set_gauge(Family::CacheSizeBytes, &[&bucket.name], size);
            self.set_gauge(Family::CacheTiles, &[&bucket.name], count);
        }
    }

    /// Write this process's snapshot to the shared directory (multi-process only)
    pub fn flush(&self) -> Result<(), MetricsError> {
        match &self.store {
            Some(store) => store.write(&self.snapshot()),
            None => Ok(()),
        }
    }

    /// Fold this process's counts into the shared compacted snapshot and
    /// stop writing its own file (multi-process only). Called at shutdown.
    pub fn retire(&self) -> Result<(), MetricsError> {
        match &self.store {
            Some(store) => store.retire(&self.snapshot()),
            None => Ok(()),
        }
    }

    /// Render the text exposition.
    ///
    /// In multi-process mode this flushes the local snapshot first, then
    /// merges every process snapshot: counters and histograms are summed,
    /// gauges take the most recent write.
    pub fn render(&self) -> Result<Vec<u8>, MetricsError> {
        match &self.store {
            None => {
                let mut buffer = Vec::new();
                TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
                Ok(buffer)
            }
            Some(store) => {
                store.write(&self.snapshot())?;
                let snapshots = store.read_all()?;
                let merged = multiprocess::merge(&snapshots);
                Ok(render::render_families(&merged).into_bytes())
            }
        }
    }

    /// Capture the in-memory state of this process
    pub fn snapshot(&self) -> ProcessSnapshot {
        let families: HashMap<String, Family> = Family::ALL
            .iter()
            .map(|family| (self.full_name(*family), *family))
            .collect();
        let gauge_writes = self.gauge_writes.lock().clone();
        let process_id = self
            .store
            .as_ref()
            .map(|s| s.process_id().to_string())
            .unwrap_or_default();

        multiprocess::snapshot_from_gathered(
            process_id,
            &self.registry.gather(),
            &families,
            &gauge_writes,
        )
    }

    /// Current value of a counter series, 0 if never incremented
    pub fn counter_value(&self, family: Family, labels: &[&str]) -> u64 {
        self.find_metric(family, labels)
            .map(|m| m.get_counter().get_value() as u64)
            .unwrap_or(0)
    }

    /// Observation count of a histogram series, 0 if never observed
    pub fn histogram_count(&self, family: Family, labels: &[&str]) -> u64 {
        self.find_metric(family, labels)
            .map(|m| m.get_histogram().get_sample_count())
            .unwrap_or(0)
    }

    /// Sum of observations of a histogram series
    pub fn histogram_sum(&self, family: Family, labels: &[&str]) -> f64 {
        self.find_metric(family, labels)
            .map(|m| m.get_histogram().get_sample_sum())
            .unwrap_or(0.0)
    }

    /// Current value of a gauge series, if it was ever set
    pub fn gauge_value(&self, family: Family, labels: &[&str]) -> Option<i64> {
        self.find_metric(family, labels)
            .map(|m| m.get_gauge().get_value() as i64)
    }

    // Reads go through gather() so inspecting a series never creates it
    fn find_metric(&self, family: Family, labels: &[&str]) -> Option<prometheus::proto::Metric> {
        let name = self.full_name(family);
        let names = family.label_names();
        if names.len() != labels.len() {
            return None;
        }
        let gathered = self.registry.gather();
        let metric_family = gathered.iter().find(|mf| mf.get_name() == name)?;
        let found = metric_family.get_metric().iter().find(|metric| {
            names.iter().zip(labels).all(|(name, value)| {
                metric
                    .get_label()
                    .iter()
                    .any(|pair| pair.get_name() == *name && pair.get_value() == *value)
            })
        });
        found.cloned()
    }
}
