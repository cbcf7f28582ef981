// Instrumentation middleware tests through the in-process wrapper

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, EXPIRES, PRAGMA};
use http::{Request, Response, StatusCode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use tilegate::classify::RouteClassifier;
use tilegate::config::{Config, MetricsConfig};
use tilegate::endpoints::ManifestStore;
use tilegate::error::DownstreamError;
use tilegate::metrics::{Family, MetricsRegistry};
use tilegate::middleware::{
    CachePolicy, Downstream, Instrumentation, InstrumentedBody, InstrumentedService,
};
use tilegate::scanner::CacheUsageScanner;

/// Stand-in tile server that sets its own cache headers
struct FakeTileServer {
    status: StatusCode,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeTileServer {
    fn ok() -> Self {
        Self::with_status(StatusCode::OK)
    }

    fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::ok()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Downstream for FakeTileServer {
    type Body = Bytes;

    async fn call(&self, request: Request<Bytes>) -> Result<Response<Bytes>, DownstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DownstreamError::Failed("tile server crashed".into()));
        }
        let body = Bytes::from(format!("tile:{}", request.uri().path()));
        Response::builder()
            .status(self.status)
            .header(CACHE_CONTROL, "max-age=60")
            .header(CACHE_CONTROL, "private")
            .header(PRAGMA, "public")
            .header(EXPIRES, "Wed, 21 Oct 2015 07:28:00 GMT")
            .header(CONTENT_TYPE, "image/png")
            .body(body)
            .map_err(|e| DownstreamError::Failed(e.into()))
    }
}

struct Harness {
    service: InstrumentedService<FakeTileServer>,
    metrics: Arc<MetricsRegistry>,
    cache: TempDir,
    manifests: TempDir,
}

fn harness(downstream: FakeTileServer, policy: CachePolicy) -> Harness {
    let cache = TempDir::new().unwrap();
    let manifests = TempDir::new().unwrap();
    let metrics = Arc::new(MetricsRegistry::new(&MetricsConfig::default()).unwrap());
    let instrumentation = Instrumentation::new(
        RouteClassifier::default(),
        Arc::clone(&metrics),
        CacheUsageScanner::new(cache.path(), "tile_locks"),
        ManifestStore::new(manifests.path()),
        policy,
    );
    Harness {
        service: InstrumentedService::new(Arc::new(instrumentation), downstream),
        metrics,
        cache,
        manifests,
    }
}

fn get(path: &str) -> Request<Bytes> {
    Request::builder().uri(path).body(Bytes::new()).unwrap()
}

fn full_body<B>(body: &InstrumentedBody<B>) -> &Bytes {
    match body {
        InstrumentedBody::Full(bytes) => bytes,
        InstrumentedBody::Passthrough(_) => panic!("expected a middleware-generated body"),
    }
}

#[tokio::test]
async fn test_tile_request_records_counter_and_histogram() {
    let h = harness(FakeTileServer::ok(), CachePolicy::Production);

    let response = h
        .service
        .handle(get("/tiles/os_leisure/EPSG3857/12/2047/1362.png"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        h.metrics
            .counter_value(Family::TileRequests, &["os_leisure", "12", "200"]),
        1
    );
    assert_eq!(
        h.metrics
            .histogram_count(Family::TileRequestDuration, &["os_leisure", "12"]),
        1
    );
    assert!(h.metrics.histogram_sum(Family::TileRequestDuration, &["os_leisure", "12"]) >= 0.0);
}

#[tokio::test]
async fn test_other_request_records_counter_only() {
    let h = harness(FakeTileServer::with_status(StatusCode::NOT_FOUND), CachePolicy::Production);

    h.service.handle(get("/wmts/1.0.0/WMTSCapabilities.xml")).await.unwrap();

    assert_eq!(h.metrics.counter_value(Family::OtherRequests, &["wmts", "404"]), 1);
    let body = String::from_utf8(h.metrics.render().unwrap()).unwrap();
    assert!(!body.contains("mapproxy_tile_request_duration_seconds_count{"));
}

#[tokio::test]
async fn test_production_headers_replace_downstream_cache_headers() {
    let h = harness(FakeTileServer::ok(), CachePolicy::Production);

    let response = h.service.handle(get("/tiles/osm/4/1/2.png")).await.unwrap();

    let cache_control: Vec<_> = response.headers().get_all(CACHE_CONTROL).iter().collect();
    assert_eq!(cache_control, vec!["public, max-age=86400, immutable"]);
    assert!(response.headers().get(PRAGMA).is_none());
    assert!(response.headers().get(EXPIRES).is_none());
    assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
}

#[tokio::test]
async fn test_development_headers_disable_caching() {
    let h = harness(FakeTileServer::ok(), CachePolicy::Development);

    let response = h.service.handle(get("/demo/")).await.unwrap();

    assert_eq!(response.headers().get_all(CACHE_CONTROL).iter().count(), 1);
    assert_eq!(
        response.headers()[CACHE_CONTROL],
        "no-cache, no-store, must-revalidate"
    );
    assert_eq!(response.headers()[PRAGMA], "no-cache");
    assert_eq!(response.headers()[EXPIRES], "0");
}

#[tokio::test]
async fn test_body_passes_through_unchanged() {
    let h = harness(FakeTileServer::ok(), CachePolicy::Production);

    let response = h.service.handle(get("/tms/osm/3/4/5.jpeg")).await.unwrap();

    match response.body() {
        InstrumentedBody::Passthrough(body) => assert_eq!(&body[..], b"tile:/tms/osm/3/4/5.jpeg"),
        InstrumentedBody::Full(_) => panic!("tile body was replaced"),
    }
}

#[tokio::test]
async fn test_downstream_error_still_records_sentinel_status() {
    let h = harness(FakeTileServer::failing(), CachePolicy::Production);

    let result = h.service.handle(get("/tiles/osm/7/1/2.png")).await;

    assert!(result.is_err());
    assert_eq!(h.metrics.counter_value(Family::TileRequests, &["osm", "7", "none"]), 1);
    assert_eq!(h.metrics.histogram_count(Family::TileRequestDuration, &["osm", "7"]), 1);
}

#[tokio::test]
async fn test_metrics_endpoint_bypasses_downstream() {
    let h = harness(FakeTileServer::ok(), CachePolicy::Production);
    std::fs::create_dir_all(h.cache.path().join("bucketA")).unwrap();
    std::fs::write(h.cache.path().join("bucketA/1.png"), vec![0u8; 900]).unwrap();

    let response = h.service.handle(get("/metrics")).await.unwrap();

    assert_eq!(h.service.downstream().calls(), 0);
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; version=0.0.4");
    let body = full_body(response.body());
    assert_eq!(
        response.headers()[CONTENT_LENGTH],
        body.len().to_string().as_str()
    );
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("mapproxy_cache_size_bytes{cache=\"bucketA\"} 900"));
    assert!(text.contains("mapproxy_cache_tiles_total{cache=\"bucketA\"} 1"));
    // No cache policy on middleware responses
    assert!(response.headers().get(CACHE_CONTROL).is_none());
}

#[tokio::test]
async fn test_manifest_is_served_with_cors() {
    let h = harness(FakeTileServer::ok(), CachePolicy::Production);
    std::fs::write(h.manifests.path().join("os_leisure.json"), b"{\"tiles\":[]}").unwrap();

    let response = h.service.handle(get("/tilejson/os_leisure.json")).await.unwrap();

    assert_eq!(h.service.downstream().calls(), 0);
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert_eq!(response.headers()[CONTENT_LENGTH], "12");
    assert_eq!(&full_body(response.body())[..], b"{\"tiles\":[]}");
}

#[tokio::test]
async fn test_missing_manifest_is_404_without_metrics() {
    let h = harness(FakeTileServer::ok(), CachePolicy::Production);

    let response = h.service.handle(get("/tilejson/missing.json")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(h.service.downstream().calls(), 0);
    assert_eq!(h.metrics.counter_value(Family::OtherRequests, &["other", "404"]), 0);
    let body = String::from_utf8(h.metrics.render().unwrap()).unwrap();
    assert!(!body.contains("mapproxy_other_requests_total{"));
    assert!(!body.contains("mapproxy_tile_requests_total{"));
}

#[tokio::test]
async fn test_concurrent_requests_are_all_counted() {
    let h = Arc::new(harness(FakeTileServer::ok(), CachePolicy::Production));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let h = Arc::clone(&h);
            tokio::spawn(async move {
                h.service.handle(get("/tiles/osm/10/1/1.png")).await.unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(h.metrics.counter_value(Family::TileRequests, &["osm", "10", "200"]), 32);
    assert_eq!(h.metrics.histogram_count(Family::TileRequestDuration, &["osm", "10"]), 32);
}

fn series_count(metrics: &MetricsRegistry, family: Family) -> usize {
    let name = metrics.full_name(family);
    metrics
        .snapshot()
        .families
        .iter()
        .find(|f| f.name == name)
        .map_or(0, |f| f.samples.len())
}

#[tokio::test]
async fn test_junk_paths_do_not_grow_label_sets() {
    let config = Config::from_yaml_with_env(
        "upstream:\n  address: mapproxy:8081\nmetrics:\n  known_layers: [osm]\n",
    )
    .unwrap();
    let metrics = Arc::new(MetricsRegistry::new(&config.metrics).unwrap());
    let instrumentation = Instrumentation::from_config(&config, Arc::clone(&metrics));
    let service = InstrumentedService::new(Arc::new(instrumentation), FakeTileServer::ok());

    for i in 0..200 {
        let padded_zoom = format!("{:0>width$}", 7, width = i % 5 + 1);
        let paths = [
            format!("/scan{}", i),
            format!("/tiles/layer{}/{}/1/2.png", i, 1000 + i),
            format!("/tiles/osm/{}/1/2.png", padded_zoom),
        ];
        for path in &paths {
            service.handle(get(path)).await.unwrap();
        }
    }

    // "other" service only
    assert_eq!(series_count(&metrics, Family::OtherRequests), 1);
    // (other, other) and (osm, 7)
    assert_eq!(series_count(&metrics, Family::TileRequests), 2);
    assert_eq!(metrics.counter_value(Family::TileRequests, &["osm", "7", "200"]), 200);
    assert_eq!(metrics.counter_value(Family::TileRequests, &["other", "other", "200"]), 200);
    assert_eq!(metrics.counter_value(Family::OtherRequests, &["other", "200"]), 200);
}
