// Configuration loading tests through files and environment substitution

use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

use tilegate::config::Config;

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

#[test]
fn test_full_config_file_loads() {
    let file = write_config(
        r#"
server:
  address: "127.0.0.1"
  port: 9090
  threads: 2
upstream:
  address: "mapproxy:8081"
  timeout_secs: 10
dev_mode: false
cache:
  root: "/data/cache"
manifests:
  dir: "/data/tilejson"
metrics:
  namespace: "tiles"
  known_layers: ["os_leisure", "osm"]
sources:
  premium_min_zoom:
    Outdoor_3857: 16
upstream_log:
  path: "/var/log/mapproxy/source-requests.log"
  message_pattern: 'mapproxy\.source\.request - \w+ - (?P<message>.*)$'
logging:
  json: false
  level: debug
"#,
    );

    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.server.listen_addr(), "127.0.0.1:9090");
    assert_eq!(config.upstream.timeout_secs, 10);
    assert_eq!(config.cache.root, PathBuf::from("/data/cache"));
    assert_eq!(config.metrics.namespace, "tiles");
    assert_eq!(config.metrics.known_layers.len(), 2);
    assert_eq!(config.sources.premium_min_zoom.get("Outdoor_3857"), Some(&16));
    // A configured table replaces the default one
    assert!(config.sources.premium_min_zoom.get("Leisure_27700").is_none());
    assert!(!config.logging.json);
    assert!(config.validate().is_ok());
}

#[test]
fn test_missing_file_is_an_error() {
    let err = Config::from_file("/nonexistent/tilegate.yaml").unwrap_err();
    assert!(err.contains("Failed to read config file"));
}

#[test]
fn test_unset_variable_is_an_error() {
    let yaml = r#"
upstream:
  address: "${TILEGATE_TEST_SURELY_UNSET_UPSTREAM}"
"#;
    let err = Config::from_yaml_with_env(yaml).unwrap_err();
    assert!(err.contains("TILEGATE_TEST_SURELY_UNSET_UPSTREAM"));
}

#[test]
fn test_invalid_namespace_fails_validation() {
    let yaml = r#"
upstream:
  address: "mapproxy:8081"
metrics:
  namespace: "9tiles"
"#;
    let config = Config::from_yaml_with_env(yaml).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_message_pattern_requires_message_group() {
    let yaml = r#"
upstream:
  address: "mapproxy:8081"
upstream_log:
  path: "/tmp/upstream.log"
  message_pattern: 'INFO - (.*)$'
"#;
    let config = Config::from_yaml_with_env(yaml).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.contains("message"));
}

#[test]
fn test_premium_zoom_above_maximum_fails_validation() {
    let yaml = r#"
upstream:
  address: "mapproxy:8081"
sources:
  premium_min_zoom:
    Outdoor_3857: 31
"#;
    let config = Config::from_yaml_with_env(yaml).unwrap();
    assert!(config.validate().is_err());
}
