//! Tests for configuration types and validation

use crate::config::{CoordinatorConfig, WorkerConfig};

fn sample_coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        bind_address: "127.0.0.1:9090".to_string(),
        db_path: "/tmp/octopus.db".to_string(),
        plugins_dir: "./plugins".to_string(),
        assignment_interval_seconds: 2,
        retention_days: 14,
        retention_sweep_interval_seconds: 3600,
        wal_checkpoint_interval_seconds: 60,
        database_busy_timeout_seconds: 30,
        graceful_shutdown_timeout_seconds: 30,
        http_body_limit_mb: 16,
        idle_after_seconds: 60,
        offline_after_seconds: 300,
        admin_users: vec!["root".to_string()],
    }
}

fn sample_worker_config() -> WorkerConfig {
    WorkerConfig {
        hostname: "worker-07".to_string(),
        coordinator_url: "http://coordinator.internal:9090".to_string(),
        plugins_dir: "./plugins".to_string(),
        poll_interval_seconds: 10,
        http_client_timeout_seconds: 30,
        misfire_grace_seconds: 60,
        channel_buffer_size: 1000,
        graceful_shutdown_timeout_seconds: 30,
        retry_base_delay_ms: 5000,
        retry_max_delay_ms: 60000,
    }
}

#[test]
fn test_coordinator_config_validation() {
    let mut config = sample_coordinator_config();
    assert!(config.validate().is_ok());

    config.retention_days = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_coordinator_toml_round_trip() {
    let config = sample_coordinator_config();
    let toml_str = toml::to_string(&config).unwrap();
    let parsed: CoordinatorConfig = toml::from_str(&toml_str).unwrap();
    assert_eq!(config, parsed);
}

#[test]
fn test_worker_config_validation() {
    let mut config = sample_worker_config();
    assert!(config.validate().is_ok());

    config.coordinator_url = "not-a-url".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_worker_toml_round_trip() {
    let config = sample_worker_config();
    let toml_str = toml::to_string(&config).unwrap();
    let parsed: WorkerConfig = toml::from_str(&toml_str).unwrap();
    assert_eq!(config, parsed);
}
