//! Configuration loading tests

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use chatrelay::config::{Config, ConfigManager};
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_partial_file_fills_defaults() {
    let file = write_config(
        r#"
[server]
bind_addr = "127.0.0.1:7000"
send_retry_interval = "250ms"

[client]
name = "alice"
"#,
    );

    let config = ConfigManager::load_from_file(file.path()).unwrap();
    assert_eq!(config.server.bind_addr, "127.0.0.1:7000".parse().unwrap());
    assert_eq!(config.server.send_retry_interval, Duration::from_millis(250));
    assert!(config.server.tcp_nodelay);
    assert_eq!(config.client.name, "alice");
    assert_eq!(config.client.server_addr.port(), 5656);
    assert_eq!(config.monitoring.log_level, "info");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigManager::load_from_file(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.server.bind_addr.port(), 5656);
    assert_eq!(config.server.send_retry_interval, Duration::from_secs(1));
}

#[test]
fn test_load_rejects_invalid_values() {
    let file = write_config(
        r#"
[server]
send_retry_interval = "1ms"
"#,
    );
    assert!(ConfigManager::load_from_file(file.path()).is_err());

    let file = write_config(
        r#"
[monitoring]
log_level = "loud"
"#,
    );
    assert!(ConfigManager::load_from_file(file.path()).is_err());
}

#[test]
fn test_load_rejects_malformed_toml() {
    let file = write_config("[server\nbind_addr = ");
    assert!(ConfigManager::load_from_file(file.path()).is_err());
}

#[test]
fn test_env_then_cli_overrides() {
    let vars: HashMap<&str, &str> = [
        ("CHATRELAY_BIND_ADDR", "0.0.0.0:6000"),
        ("CHATRELAY_NAME", "from-env"),
        ("CHATRELAY_MANAGEMENT_ENABLED", "true"),
    ]
    .into_iter()
    .collect();

    let mut config = Config::default();
    config
        .apply_env(|key| vars.get(key).map(|v| v.to_string()))
        .unwrap();
    assert_eq!(config.server.bind_addr.port(), 6000);
    assert_eq!(config.client.name, "from-env");
    assert!(config.monitoring.management_api.enabled);

    config
        .merge_with_cli_args(None, Some(7000), None, Some("from-cli"), None, None)
        .unwrap();
    assert_eq!(config.server.bind_addr, "0.0.0.0:7000".parse().unwrap());
    assert_eq!(config.client.name, "from-cli");
    config.validate().unwrap();
}

#[test]
fn test_config_round_trips_through_toml() {
    let mut config = Config::default();
    config.server.send_retry_interval = Duration::from_millis(750);
    config.client.name = "carol".to_string();

    let text = toml::to_string(&config).unwrap();
    let file = write_config(&text);
    let loaded = ConfigManager::load_from_file(file.path()).unwrap();

    assert_eq!(loaded.server.send_retry_interval, Duration::from_millis(750));
    assert_eq!(loaded.client.name, "carol");
}

#[test]
fn test_file_log_level_applies_unless_cli_sets_one() {
    let file = write_config(
        r#"
        [monitoring]
        log_level = "warn"
        "#,
    );
    let mut config = ConfigManager::load_from_file(file.path()).unwrap();

    config
        .merge_with_cli_args(None, None, None, None, None, None)
        .unwrap();
    assert_eq!(config.monitoring.log_level, "warn");

    config
        .merge_with_cli_args(None, None, None, None, None, Some("trace"))
        .unwrap();
    assert_eq!(config.monitoring.log_level, "trace");

    config
        .merge_with_cli_args(None, None, None, None, None, Some("shouty"))
        .unwrap();
    assert!(config.validate().is_err());
}
