use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tilegate::classify::{RouteClassifier, SourceClassifier};
use tilegate::correlator::UpstreamLogCorrelator;
use tilegate::config::{default_known_services, MetricsConfig};
use tilegate::metrics::MetricsRegistry;
use std::sync::Arc;

/// Benchmark inbound path classification (tile, other, built-in endpoints)
fn bench_route_classification(c: &mut Criterion) {
    let routes = RouteClassifier::default();
    let allowlisted =
        RouteClassifier::new(["os_leisure", "os_outdoor", "osm"], default_known_services());

    c.bench_function("route_tile_with_grid", |b| {
        b.iter(|| routes.route(black_box("/tiles/os_leisure/EPSG3857/12/2047/1362.png")))
    });

    c.bench_function("route_other_service", |b| {
        b.iter(|| routes.route(black_box("/wmts/1.0.0/WMTSCapabilities.xml")))
    });

    c.bench_function("route_tile_unknown_layer_allowlist", |b| {
        b.iter(|| allowlisted.route(black_box("/tiles/unknown_layer/12/2047/1362.png")))
    });
}

/// Benchmark upstream URL classification
fn bench_source_classification(c: &mut Criterion) {
    let sources = SourceClassifier::default();

    c.bench_function("source_os_premium", |b| {
        b.iter(|| {
            sources.classify(black_box(
                "https://api.os.uk/maps/raster/v1/zxy/Outdoor_3857/18/130000/87000.png?key=abc",
            ))
        })
    });

    c.bench_function("source_raw_host", |b| {
        b.iter(|| sources.classify(black_box("https://tiles.example.org/4/5/6.png")))
    });
}

/// Benchmark the full correlation path for one log record
fn bench_correlate_line(c: &mut Criterion) {
    let metrics = Arc::new(MetricsRegistry::new(&MetricsConfig::default()).unwrap());
    let correlator = UpstreamLogCorrelator::new(SourceClassifier::default(), metrics);

    c.bench_function("correlate_upstream_line", |b| {
        b.iter(|| {
            correlator.handle_line(black_box(
                "GET https://tile.openstreetmap.org/12/2047/1362.png 200 14 38.2",
            ))
        })
    });
}

criterion_group!(
    benches,
    bench_route_classification,
    bench_source_classification,
    bench_correlate_line
);
criterion_main!(benches);
