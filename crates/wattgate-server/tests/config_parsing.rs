use std::{env, fs};

use wattgate_server::StoreFailurePolicy;
use wattgate_server::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("wattgate.toml");

    let toml_content = r#"
[logging]
level = "debug"

[storage.postgres]
host = "localhost"
port = 5432
database = "wattgate"
user = "test"
password = "test"

[redis]
enabled = true
url = "redis://cache:6379"
pool_size = 4

[quota]
standard_uncached = 10
standard_cached = 100
privileged_cached = 5000
on_store_error = "closed"

[cache]
default_ttl_secs = 3600

[metering]
base_url = "https://metering.example"
client_id = "id"
client_secret = "secret"
requests_per_second = 3

[calendar]
timezone = "Europe/Paris"
cutover_hour = 6

[sync]
enabled = true
backfill_years = 2
backfill_chunk_days = 90
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.storage.postgres.as_ref().map(|pg| pg.pool_size > 0), Some(true));
    assert!(cfg.redis.enabled);
    assert_eq!(cfg.redis.pool_size, 4);
    assert_eq!(cfg.quota.standard_uncached, 10);
    assert_eq!(cfg.quota.privileged_uncached, None);
    assert_eq!(cfg.quota.privileged_cached, Some(5000));
    assert_eq!(cfg.quota.on_store_error, StoreFailurePolicy::Closed);
    assert_eq!(cfg.cache.default_ttl_secs, 3600);
    assert_eq!(cfg.metering.requests_per_second, 3);
    assert_eq!(cfg.calendar.cutover_hour, 6);
    assert_eq!(cfg.sync.backfill_chunk_days, 90);

    // 2) Env override should win over file
    unsafe {
        env::set_var("WATTGATE__QUOTA__STANDARD_UNCACHED", "20");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.quota.standard_uncached, 20);
    unsafe {
        env::remove_var("WATTGATE__QUOTA__STANDARD_UNCACHED");
    }

    // 3) Invalid config (uncached ceiling above cached) should error
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
[quota]
standard_uncached = 500
standard_cached = 100
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config(invalid_path.to_str()).expect_err("expected validation error");
    assert!(err.contains("standard_uncached must be <="));

    // 4) Unknown timezone is rejected
    let tz_path = dir.path().join("tz.toml");
    fs::write(&tz_path, "[calendar]\ntimezone = \"Nowhere/City\"\n").expect("write tz toml");
    let err = load_config(tz_path.to_str()).expect_err("expected timezone error");
    assert!(err.contains("Nowhere/City"));
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("absent.toml");

    let cfg = load_config(path.to_str()).expect("defaults are valid");
    assert!(!cfg.redis.enabled);
    assert!(cfg.storage.postgres.is_none());
    assert_eq!(cfg.quota.on_store_error, StoreFailurePolicy::Open);
}
