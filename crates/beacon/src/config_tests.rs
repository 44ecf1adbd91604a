// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use tempfile::TempDir;
use yare::parameterized;

#[test]
fn empty_file_uses_defaults() {
    let config = Config::parse("").unwrap();
    assert_eq!(config, Config::default());
    assert_eq!(config.storage.max_bytes, 20_971_520);
    assert_eq!(config.storage.event_ttl_secs, 2_592_000);
    assert_eq!(config.upload.max_retries, 5);
    assert_eq!(config.upload.max_in_flight_batches, 1);
    assert_eq!(config.policy.default_holding_secs, 900);
    assert_eq!(config.policy.daily_window_secs, 86_400);
    assert_eq!(config.client.app_id, "unknown");
}

#[test]
fn partial_tables_keep_other_defaults() {
    let config = Config::parse(
        r#"
        [storage]
        dir = "/var/lib/beacon"
        max_bytes = 1024

        [upload]
        endpoint = "https://collector.example.com/v1/batch"
        max_batch_events = 50

        [client]
        app_id = "com.example.app"
        "#,
    )
    .unwrap();

    assert_eq!(config.storage.dir, Some(PathBuf::from("/var/lib/beacon")));
    assert_eq!(config.storage.max_bytes, 1024);
    assert_eq!(config.storage.event_ttl_secs, 2_592_000);
    assert_eq!(config.upload.max_batch_events, 50);
    assert_eq!(config.upload.timeout_secs, 30);
    assert_eq!(config.client.app_id, "com.example.app");
    assert_eq!(config.client.os_version, "unknown");
}

#[test]
fn load_reads_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("beacon.toml");
    std::fs::write(&path, "[policy]\ndaily_window_secs = 3600\n").unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.policy.daily_window_secs, 3600);
}

#[test]
fn load_missing_file_fails() {
    let temp = TempDir::new().unwrap();
    let err = Config::load(&temp.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn parse_rejects_bad_toml() {
    assert!(matches!(Config::parse("[storage\nmax_bytes = 1"), Err(Error::Config(_))));
}

#[parameterized(
    ftp_endpoint = { "[upload]\nendpoint = \"ftp://example.com\"" },
    zero_max_bytes = { "[storage]\nmax_bytes = 0" },
    zero_batch = { "[upload]\nmax_batch_events = 0" },
    zero_in_flight = { "[upload]\nmax_in_flight_batches = 0" },
    zero_retries = { "[upload]\nmax_retries = 0" },
    cap_below_base = { "[upload]\nbackoff_base_ms = 5000\nbackoff_cap_ms = 10" },
)]
fn invalid_configs(content: &str) {
    assert!(matches!(Config::parse(content), Err(Error::Config(_))));
}

#[test]
fn derived_settings() {
    let config = Config::parse(
        "[upload]\nmax_retries = 3\ntimeout_secs = 7\n[policy]\ndefault_holding_secs = 60",
    )
    .unwrap();

    let store = config.store_config();
    assert_eq!(store.max_retries, 3);
    assert_eq!(store.event_ttl, Duration::from_secs(2_592_000));

    let policy = config.policy();
    assert_eq!(policy.default_holding, Duration::from_secs(60));
    assert_eq!(policy.max_batch_events, 500);

    let coordinator = config.coordinator_config();
    assert_eq!(coordinator.timeout, Duration::from_secs(7));
    assert_eq!(coordinator.client.app_id, "unknown");
    assert_eq!(config.backoff().cap(), Duration::from_secs(3600));
}

#[test]
fn config_serializes_back_to_toml() {
    let config = Config::default();
    let text = toml::to_string_pretty(&config).unwrap();
    assert_eq!(Config::parse(&text).unwrap(), config);
}
