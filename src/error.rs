// Error types module

use std::path::PathBuf;

/// Boxed error used at the seam with the wrapped application
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from the metrics registry.
///
/// Metric mutation never fails; only exposition can, and only because of
/// the multi-process aggregation directory or the text encoder.
/// Registration errors surface from [`crate::metrics::MetricsRegistry::new`].
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Reading or writing the aggregation directory failed
    #[error("Aggregation directory I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A snapshot file in the aggregation directory could not be decoded
    #[error("Invalid snapshot file {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Registration or text encoding failed inside the prometheus crate
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

impl MetricsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MetricsError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Error returned by the wrapped application in the in-process wrapper
#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    /// The wrapped application failed before producing a response
    #[error("Downstream failed: {0}")]
    Failed(#[source] BoxError),
}
