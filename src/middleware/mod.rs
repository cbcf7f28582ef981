//! Request instrumentation middleware.
//!
//! [`Instrumentation`] holds everything a request needs: the router, the
//! metrics registry, the cache scanner, the manifest store and the cache
//! policy. Transports drive it the same way:
//!
//! 1. [`Instrumentation::route`] decides between the metrics endpoint, a
//!    manifest, or delegation to the tile server.
//! 2. For delegated requests, [`Instrumentation::start`] returns a
//!    [`RequestTimer`]; the transport reports the response status to it and
//!    applies [`CachePolicy`] to the response headers.
//! 3. Dropping the timer records the request exactly once, whether the
//!    downstream answered, failed, or the request was abandoned.
//!
//! [`InstrumentedService`] is the in-process transport; the Pingora adapter
//! lives in [`crate::proxy`].

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, EXPIRES, PRAGMA,
};
use http::{HeaderMap, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Instant;

use crate::classify::{RequestClass, Route, RouteClassifier};
use crate::config::Config;
use crate::constants::{DEV_CACHE_CONTROL, PRODUCTION_CACHE_CONTROL, STATUS_SENTINEL};
use crate::endpoints::{self, EndpointResponse, ManifestStore};
use crate::error::DownstreamError;
use crate::metrics::MetricsRegistry;
use crate::scanner::CacheUsageScanner;

/// Cache headers forced onto every delegated response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// No caching anywhere, so map edits show up immediately
    Development,
    /// 24h immutable
    Production,
}

impl CachePolicy {
    pub fn from_dev_mode(dev_mode: bool) -> Self {
        if dev_mode {
            CachePolicy::Development
        } else {
            CachePolicy::Production
        }
    }

    /// Headers removed from every delegated response before the policy is applied
    pub const STRIPPED: [HeaderName; 3] = [CACHE_CONTROL, PRAGMA, EXPIRES];

    /// Headers appended after stripping
    pub fn headers(self) -> &'static [(HeaderName, &'static str)] {
        static DEVELOPMENT: [(HeaderName, &str); 3] = [
            (CACHE_CONTROL, DEV_CACHE_CONTROL),
            (PRAGMA, "no-cache"),
            (EXPIRES, "0"),
        ];
        static PRODUCTION: [(HeaderName, &str); 1] = [(CACHE_CONTROL, PRODUCTION_CACHE_CONTROL)];

        match self {
            CachePolicy::Development => &DEVELOPMENT,
            CachePolicy::Production => &PRODUCTION,
        }
    }

    /// Replace any cache headers set by the tile server
    pub fn apply(self, headers: &mut HeaderMap) {
        for name in &Self::STRIPPED {
            headers.remove(name);
        }
        for (name, value) in self.headers() {
            headers.append(name.clone(), HeaderValue::from_static(value));
        }
    }
}

/// Measures one delegated request and records it on drop
#[derive(Debug)]
pub struct RequestTimer {
    metrics: Arc<MetricsRegistry>,
    class: RequestClass,
    start: Instant,
    status: Option<u16>,
    recorded: bool,
}

impl RequestTimer {
    pub fn new(metrics: Arc<MetricsRegistry>, class: RequestClass) -> Self {
        Self {
            metrics,
            class,
            start: Instant::now(),
            status: None,
            recorded: false,
        }
    }

    /// Capture the response status. A later call overwrites an earlier one.
    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Record now rather than at drop
    pub fn finish(mut self) {
        self.record();
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        self.recorded = true;

        let status = self
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| STATUS_SENTINEL.to_string());
        let elapsed = self.start.elapsed();

        match &self.class {
            RequestClass::Tile { layer, zoom } => {
                self.metrics.record_tile_request(layer, zoom, &status, elapsed);
            }
            RequestClass::Other { service } => {
                self.metrics.record_other_request(service, &status);
            }
        }
        tracing::debug!(
            class = ?self.class,
            status = %status,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "Request recorded"
        );
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        self.record();
    }
}

/// Shared per-process middleware state
#[derive(Debug)]
pub struct Instrumentation {
    routes: RouteClassifier,
    metrics: Arc<MetricsRegistry>,
    scanner: CacheUsageScanner,
    manifests: ManifestStore,
    policy: CachePolicy,
}

impl Instrumentation {
    pub fn new(
        routes: RouteClassifier,
        metrics: Arc<MetricsRegistry>,
        scanner: CacheUsageScanner,
        manifests: ManifestStore,
        policy: CachePolicy,
    ) -> Self {
        Self {
            routes,
            metrics,
            scanner,
            manifests,
            policy,
        }
    }

    pub fn from_config(config: &Config, metrics: Arc<MetricsRegistry>) -> Self {
        let routes = RouteClassifier::new(
            config.metrics.known_layers.iter().cloned(),
            config.metrics.known_services.iter().cloned(),
        );
        if routes.layers_unbounded() {
            tracing::warn!("metrics.known_layers is empty; tile layer labels are not bounded");
        }

        Self::new(
            routes,
            metrics,
            CacheUsageScanner::new(&config.cache.root, config.cache.lock_dir_name.clone()),
            ManifestStore::new(&config.manifests.dir),
            CachePolicy::from_dev_mode(config.dev_mode),
        )
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn route(&self, path: &str) -> Route {
        self.routes.route(path)
    }

    /// Start timing a delegated request
    pub fn start(&self, class: RequestClass) -> RequestTimer {
        RequestTimer::new(Arc::clone(&self.metrics), class)
    }

    pub async fn serve_metrics(&self) -> EndpointResponse {
        endpoints::handle_metrics(Arc::clone(&self.metrics), self.scanner.clone()).await
    }

    pub async fn serve_manifest(&self, name: &str) -> EndpointResponse {
        self.manifests.handle(name).await
    }
}

/// The wrapped tile-serving application
#[async_trait]
pub trait Downstream: Send + Sync {
    type Body: Send;

    async fn call(&self, request: Request<Bytes>) -> Result<Response<Self::Body>, DownstreamError>;
}

/// Body of an instrumented response
#[derive(Debug)]
pub enum InstrumentedBody<B> {
    /// The downstream body, untouched
    Passthrough(B),
    /// Generated by the middleware
    Full(Bytes),
}

/// In-process middleware around a [`Downstream`]
pub struct InstrumentedService<D> {
    instrumentation: Arc<Instrumentation>,
    downstream: D,
}

impl<D: Downstream> InstrumentedService<D> {
    pub fn new(instrumentation: Arc<Instrumentation>, downstream: D) -> Self {
        Self {
            instrumentation,
            downstream,
        }
    }

    pub fn downstream(&self) -> &D {
        &self.downstream
    }

    /// Handle one request.
    ///
    /// A downstream error is returned unchanged after the request is
    /// recorded with the `none` status.
    pub async fn handle(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<InstrumentedBody<D::Body>>, DownstreamError> {
        let class = match self.instrumentation.route(request.uri().path()) {
            Route::Metrics => {
                return Ok(into_response(self.instrumentation.serve_metrics().await));
            }
            Route::Manifest(name) => {
                return Ok(into_response(self.instrumentation.serve_manifest(&name).await));
            }
            Route::Delegate(class) => class,
        };

        let mut timer = self.instrumentation.start(class);
        let mut response = self.downstream.call(request).await?;
        timer.set_status(response.status().as_u16());
        self.instrumentation.policy().apply(response.headers_mut());
        timer.finish();

        Ok(response.map(InstrumentedBody::Passthrough))
    }
}

fn into_response<B>(endpoint: EndpointResponse) -> Response<InstrumentedBody<B>> {
    let length = endpoint.content_length();
    let mut response = Response::new(InstrumentedBody::Full(endpoint.body));
    *response.status_mut() =
        StatusCode::from_u16(endpoint.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(endpoint.content_type));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    for (name, value) in endpoint.headers {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    response
}
