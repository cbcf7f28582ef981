//! Upstream log correlator.
//!
//! The tile server reports every upstream fetch as one log record of the
//! form `METHOD URL STATUS SIZE_KB DURATION_MS`. The correlator turns those
//! records into the upstream request counter and duration histogram, keyed
//! by the source label of the fetched URL.
//!
//! Records reach the correlator two ways:
//! - in-process, as `tracing` events with target [`SOURCE_REQUEST_TARGET`],
//!   consumed by [`CorrelatorLayer`];
//! - from a log file written by an external tile server, via
//!   [`follow::LogFollower`].
//!
//! A malformed record is dropped on its own. Nothing here returns an error
//! into the emitting code path.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::classify::SourceClassifier;
use crate::constants::FIELD_SENTINEL;
use crate::metrics::MetricsRegistry;

pub mod follow;

pub use follow::LogFollower;

/// Target of upstream fetch records. The fmt layer never prints these.
pub const SOURCE_REQUEST_TARGET: &str = "tilegate::source::request";

/// One parsed upstream fetch record
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRecord<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub status: &'a str,
    pub size_kb: &'a str,
    /// `None` when the emitter did not measure the fetch
    pub duration_seconds: Option<f64>,
}

impl<'a> UpstreamRecord<'a> {
    /// Parse a whitespace-separated record. Extra trailing tokens are ignored.
    pub fn parse(line: &'a str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let method = tokens.next()?;
        let url = tokens.next()?;
        let status = tokens.next()?;
        let size_kb = tokens.next()?;
        let duration = tokens.next()?;

        let duration_seconds = if duration == FIELD_SENTINEL {
            None
        } else {
            let millis: f64 = duration.parse().ok()?;
            if !millis.is_finite() || millis < 0.0 {
                return None;
            }
            Some(millis / 1000.0)
        };

        Some(Self {
            method,
            url,
            status,
            size_kb,
            duration_seconds,
        })
    }
}

/// Feeds upstream fetch records into the metrics registry
pub struct UpstreamLogCorrelator {
    classifier: SourceClassifier,
    metrics: Arc<MetricsRegistry>,
}

impl UpstreamLogCorrelator {
    pub fn new(classifier: SourceClassifier, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            classifier,
            metrics,
        }
    }

    /// Correlate one record. Returns whether it was recorded.
    pub fn handle_line(&self, line: &str) -> bool {
        let Some(record) = UpstreamRecord::parse(line) else {
            return false;
        };
        let source = self.classifier.classify(record.url);
        self.metrics
            .record_upstream_request(&source, record.status, record.duration_seconds);
        true
    }
}

impl fmt::Debug for UpstreamLogCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamLogCorrelator")
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

/// `tracing` layer that hands upstream fetch events to the correlator.
///
/// Install it with a per-layer filter on [`SOURCE_REQUEST_TARGET`] and
/// exclude that target from every other layer, so each record is counted
/// once and never printed.
pub struct CorrelatorLayer {
    correlator: Arc<UpstreamLogCorrelator>,
}

impl CorrelatorLayer {
    pub fn new(correlator: Arc<UpstreamLogCorrelator>) -> Self {
        Self { correlator }
    }
}

impl<S: Subscriber> Layer<S> for CorrelatorLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() != SOURCE_REQUEST_TARGET {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if let Some(message) = visitor.message {
            self.correlator.handle_line(&message);
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        }
    }
}

/// Emit an upstream fetch record for the correlator.
///
/// Used by in-process tile servers after each fetch returns.
pub fn log_upstream_fetch(
    method: &str,
    url: &str,
    status: u16,
    size_bytes: Option<u64>,
    elapsed: Option<Duration>,
) {
    let size_kb = size_bytes
        .map(|bytes| (bytes / 1024).to_string())
        .unwrap_or_else(|| FIELD_SENTINEL.to_string());
    let duration_ms = elapsed
        .map(|d| format!("{:.3}", d.as_secs_f64() * 1000.0))
        .unwrap_or_else(|| FIELD_SENTINEL.to_string());

    tracing::info!(
        target: SOURCE_REQUEST_TARGET,
        "{} {} {} {} {}",
        method,
        url,
        status,
        size_kb,
        duration_ms
    );
}
