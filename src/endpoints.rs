//! Endpoints served by the middleware itself.
//!
//! - `/metrics` - cache scan, then Prometheus exposition
//! - `/tilejson/{name}.json` - manifest documents from a directory
//!
//! Handlers return [`EndpointResponse`] rather than writing to a transport,
//! so the Pingora adapter and the in-process wrapper share them.

use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;

use crate::metrics::{self, MetricsRegistry};
use crate::scanner::CacheUsageScanner;

/// Response from an endpoint handler
#[derive(Debug, Clone)]
pub struct EndpointResponse {
    pub status: u16,
    pub content_type: &'static str,
    /// Extra headers besides Content-Type and Content-Length, lowercase names
    pub headers: Vec<(&'static str, &'static str)>,
    pub body: Bytes,
}

impl EndpointResponse {
    /// Prometheus text exposition
    pub fn prometheus(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: metrics::CONTENT_TYPE,
            headers: Vec::new(),
            body: Bytes::from(body),
        }
    }

    /// Manifest document, readable from any origin
    pub fn manifest(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            headers: vec![("access-control-allow-origin", "*")],
            body: Bytes::from(body),
        }
    }

    pub fn not_found() -> Self {
        Self::text(404, "Not Found")
    }

    pub fn internal_error() -> Self {
        Self::text(500, "Internal Server Error")
    }

    fn text(status: u16, body: &'static str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            headers: Vec::new(),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    pub fn content_length(&self) -> usize {
        self.body.len()
    }
}

/// Generate the response for `/metrics`.
///
/// Rescans the cache, publishes the gauges, then renders. The scan and the
/// multi-process file I/O run on the blocking pool. Only a rendering failure
/// yields 500.
pub async fn handle_metrics(
    metrics: Arc<MetricsRegistry>,
    scanner: CacheUsageScanner,
) -> EndpointResponse {
    let rendered = tokio::task::spawn_blocking(move || {
        let buckets = scanner.scan();
        tracing::debug!(
            root = %scanner.root().display(),
            buckets = buckets.len(),
            "Cache scan complete"
        );
        metrics.set_cache_usage(&buckets);
        metrics.render()
    })
    .await;

    match rendered {
        Ok(Ok(body)) => EndpointResponse::prometheus(body),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Failed to render metrics");
            EndpointResponse::internal_error()
        }
        Err(e) => {
            tracing::error!(error = %e, "Metrics render task failed");
            EndpointResponse::internal_error()
        }
    }
}

/// Manifest documents under one directory
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Generate the response for `/tilejson/{name}.json`.
    ///
    /// `name` is already restricted to `[a-z0-9_-]+` by the router.
    pub async fn handle(&self, name: &str) -> EndpointResponse {
        let path = self.dir.join(format!("{}.json", name));
        match tokio::fs::read(&path).await {
            Ok(body) => EndpointResponse::manifest(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => EndpointResponse::not_found(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read manifest");
                EndpointResponse::internal_error()
            }
        }
    }
}
