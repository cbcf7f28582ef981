// Multi-process aggregation tests: several registries sharing one directory

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use tilegate::config::MetricsConfig;
use tilegate::metrics::{Family, MetricsRegistry};
use tilegate::scanner::CacheBucketSnapshot;

fn worker(dir: &TempDir) -> Arc<MetricsRegistry> {
    let config = MetricsConfig {
        multiprocess_dir: Some(dir.path().to_path_buf()),
        ..MetricsConfig::default()
    };
    Arc::new(MetricsRegistry::new(&config).unwrap())
}

fn render(metrics: &MetricsRegistry) -> String {
    String::from_utf8(metrics.render().unwrap()).unwrap()
}

#[test]
fn test_counters_and_histograms_sum_across_workers() {
    let dir = TempDir::new().unwrap();
    let first = worker(&dir);
    let second = worker(&dir);

    first.record_tile_request("osm", "4", "200", Duration::from_millis(10));
    first.record_tile_request("osm", "4", "200", Duration::from_millis(10));
    second.record_tile_request("osm", "4", "200", Duration::from_millis(10));
    second.flush().unwrap();

    let output = render(&first);

    assert!(output.contains("# TYPE mapproxy_tile_requests_total counter"));
    assert!(output
        .contains("mapproxy_tile_requests_total{layer=\"osm\",zoom=\"4\",status=\"200\"} 3"));
    assert!(output
        .contains("mapproxy_tile_request_duration_seconds_count{layer=\"osm\",zoom=\"4\"} 3"));
    assert!(output.contains(
        "mapproxy_tile_request_duration_seconds_bucket{layer=\"osm\",zoom=\"4\",le=\"+Inf\"} 3"
    ));
}

#[test]
fn test_gauges_take_latest_write_across_workers() {
    let dir = TempDir::new().unwrap();
    let first = worker(&dir);
    let second = worker(&dir);
    let bucket = |bytes| CacheBucketSnapshot {
        name: "osm_cache".to_string(),
        total_bytes: bytes,
        tile_count: 1,
    };

    first.set_cache_usage(&[bucket(100)]);
    first.flush().unwrap();
    std::thread::sleep(Duration::from_millis(5));
    second.set_cache_usage(&[bucket(250)]);
    second.flush().unwrap();

    // Rendering from the stale worker still exposes the latest write
    let output = render(&first);
    assert!(output.contains("mapproxy_cache_size_bytes{cache=\"osm_cache\"} 250"));
    assert!(!output.contains("mapproxy_cache_size_bytes{cache=\"osm_cache\"} 350"));
}

#[test]
fn test_exited_worker_counts_persist() {
    let dir = TempDir::new().unwrap();
    {
        let exited = worker(&dir);
        exited.increment_counter(Family::UpstreamRequests, &["b2", "200"]);
        exited.flush().unwrap();
    }
    let live = worker(&dir);
    live.increment_counter(Family::UpstreamRequests, &["b2", "200"]);

    let output = render(&live);
    assert!(output.contains("mapproxy_upstream_requests_total{source=\"b2\",status=\"200\"} 2"));
}

#[test]
fn test_render_fails_when_directory_disappears() {
    let dir = TempDir::new().unwrap();
    let shared = dir.path().join("prom");
    let config = MetricsConfig {
        multiprocess_dir: Some(shared.clone()),
        ..MetricsConfig::default()
    };
    let metrics = MetricsRegistry::new(&config).unwrap();
    std::fs::remove_dir_all(&shared).unwrap();

    assert!(metrics.render().is_err());
}

#[test]
fn test_restarted_workers_leave_one_compacted_snapshot() {
    let dir = TempDir::new().unwrap();
    for _ in 0..50 {
        let restarted = worker(&dir);
        restarted.increment_counter(Family::UpstreamRequests, &["osm", "200"]);
        restarted.flush().unwrap();
        restarted.retire().unwrap();
    }
    let live = worker(&dir);
    live.increment_counter(Family::UpstreamRequests, &["osm", "200"]);

    let output = render(&live);
    assert!(output.contains("mapproxy_upstream_requests_total{source=\"osm\",status=\"200\"} 51"));

    let snapshots = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
        .count();
    assert_eq!(snapshots, 2);
}
