// Upstream log correlator tests

use rstest::rstest;
use std::sync::Arc;

use tilegate::classify::SourceClassifier;
use tilegate::config::{MetricsConfig, SourceRulesConfig};
use tilegate::correlator::UpstreamLogCorrelator;
use tilegate::metrics::{Family, MetricsRegistry};

fn correlator_with(rules: &SourceRulesConfig) -> (UpstreamLogCorrelator, Arc<MetricsRegistry>) {
    let metrics = Arc::new(MetricsRegistry::new(&MetricsConfig::default()).unwrap());
    let correlator = UpstreamLogCorrelator::new(SourceClassifier::new(rules), Arc::clone(&metrics));
    (correlator, metrics)
}

#[rstest]
#[case("GET https://api.os.uk/maps/raster/v1/zxy/Road_3857/18/1/2.png?key=x 200 40 120", "os_premium")]
#[case("GET https://api.os.uk/maps/raster/v1/zxy/Road_3857/12/1/2.png?key=x 200 40 120", "os_open")]
#[case("GET https://tile.openstreetmap.org/1/2/3.png 200 12 45", "osm")]
#[case("GET https://f003.backblazeb2.com/file/tiles/1/2/3.png 200 12 45", "b2")]
#[case("GET http://localhost:8000/tiles/1/2/3.png 200 12 45", "local")]
#[case("GET https://tiles.example.net/1/2/3.png 200 12 45", "tiles.example.net")]
fn test_records_under_source_label(#[case] line: &str, #[case] source: &str) {
    let (correlator, metrics) = correlator_with(&SourceRulesConfig::default());

    assert!(correlator.handle_line(line));

    assert_eq!(metrics.counter_value(Family::UpstreamRequests, &[source, "200"]), 1);
    assert_eq!(metrics.histogram_count(Family::UpstreamRequestDuration, &[source]), 1);
}

#[test]
fn test_reference_log_lines() {
    let (correlator, metrics) = correlator_with(&SourceRulesConfig::default());

    correlator.handle_line("GET https://tile.openstreetmap.org/1/2/3.png 200 12 45");
    correlator.handle_line("GET http://x 200 12 -");
    correlator.handle_line("short line");

    assert_eq!(metrics.counter_value(Family::UpstreamRequests, &["osm", "200"]), 1);
    let sum = metrics.histogram_sum(Family::UpstreamRequestDuration, &["osm"]);
    assert!((sum - 0.045).abs() < 1e-9);
    assert_eq!(metrics.counter_value(Family::UpstreamRequests, &["x", "200"]), 1);
    assert_eq!(metrics.histogram_count(Family::UpstreamRequestDuration, &["x"]), 0);
}

#[test]
fn test_configured_rules_are_used() {
    let mut rules = SourceRulesConfig::default();
    rules.osm_host = "tiles.internal".to_string();
    let (correlator, metrics) = correlator_with(&rules);

    correlator.handle_line("GET http://tiles.internal/4/5/6.png 304 0 2");
    correlator.handle_line("GET https://tile.openstreetmap.org/4/5/6.png 200 1 2");

    assert_eq!(metrics.counter_value(Family::UpstreamRequests, &["osm", "304"]), 1);
    assert_eq!(
        metrics.counter_value(Family::UpstreamRequests, &["tile.openstreetmap.org", "200"]),
        1
    );
}

#[test]
fn test_garbage_never_panics() {
    let (correlator, _metrics) = correlator_with(&SourceRulesConfig::default());

    for line in [
        "",
        "   ",
        "GET",
        "GET :// 200 1 1",
        "GET http://[::1 200 1 1",
        "\u{0}\u{1} \u{2} \u{3} \u{4} \u{5}",
        "GET http://x 200 1 1e400",
    ] {
        let _ = correlator.handle_line(line);
    }
}
