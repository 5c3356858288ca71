//! Configuration types and validation for the Octopus task orchestration system
//!
//! This module defines the configuration structures used by both coordinator
//! and worker components, including validation logic and serialization support.

use crate::defaults::*;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Main coordinator configuration loaded from coordinator.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    /// Address and port to bind the API server to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Path to the SQLite store file
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Directory the coordinator watches for plugin manifests
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: String,
    /// Minimum interval between assignment passes (default: 2, min: 1)
    #[serde(default = "default_assignment_interval_seconds")]
    pub assignment_interval_seconds: u64,
    /// Number of days to retain execution records before purging
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Interval between retention sweeps (default: 3600)
    #[serde(default = "default_retention_sweep_interval_seconds")]
    pub retention_sweep_interval_seconds: u64,
    /// WAL checkpoint interval in seconds (default: 60)
    #[serde(default = "default_wal_checkpoint_interval_seconds")]
    pub wal_checkpoint_interval_seconds: u64,
    /// SQLite busy timeout in seconds (default: 30)
    #[serde(default = "default_database_busy_timeout_seconds")]
    pub database_busy_timeout_seconds: u64,
    /// Wait time for in-flight requests during shutdown (default: 30)
    #[serde(default = "default_graceful_shutdown_timeout_seconds")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// Maximum HTTP request body size in MB (default: 16)
    #[serde(default = "default_http_body_limit_mb")]
    pub http_body_limit_mb: usize,
    /// Seconds since last heartbeat after which a worker is "idle" (default: 60)
    #[serde(default = "default_idle_after_seconds")]
    pub idle_after_seconds: u64,
    /// Seconds since last heartbeat after which a worker is "offline" (default: 300)
    #[serde(default = "default_offline_after_seconds")]
    pub offline_after_seconds: u64,
    /// Usernames permitted to read/write any user's parameters, not just their own
    #[serde(default)]
    pub admin_users: Vec<String>,
}

/// Main worker configuration loaded from worker.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Unique hostname identifying this worker
    pub hostname: String,
    /// Base URL of the coordinator API
    pub coordinator_url: String,
    /// Directory holding plugin manifests for this worker
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: String,
    /// How often to sync assigned tasks from the coordinator (default: 10)
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// HTTP client timeout for coordinator communication (default: 30)
    #[serde(default = "default_http_client_timeout_seconds")]
    pub http_client_timeout_seconds: u64,
    /// Grace period for missed firings in seconds (default: 60)
    #[serde(default = "default_misfire_grace_seconds")]
    pub misfire_grace_seconds: u64,
    /// Result/ready channel buffer capacity (default: 1000)
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
    /// Wait time for in-flight firings during shutdown (default: 30)
    #[serde(default = "default_graceful_shutdown_timeout_seconds")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// Base retry back-off delay when the coordinator is unreachable (ms)
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Retry back-off cap (ms)
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl CoordinatorConfig {
    /// Validate the coordinator configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.bind_address.is_empty() {
            return Err(
                crate::OctopusError::Validation("bind_address cannot be empty".to_string()).into(),
            );
        }

        if self.bind_address.parse::<SocketAddr>().is_err() {
            return Err(crate::OctopusError::Validation(format!(
                "invalid bind_address: {}",
                self.bind_address
            ))
            .into());
        }

        if self.db_path.is_empty() {
            return Err(
                crate::OctopusError::Validation("db_path cannot be empty".to_string()).into(),
            );
        }

        if self.assignment_interval_seconds == 0 {
            return Err(crate::OctopusError::Validation(
                "assignment_interval_seconds must be at least 1".to_string(),
            )
            .into());
        }

        if self.retention_days == 0 {
            return Err(crate::OctopusError::Validation(
                "retention_days must be greater than 0".to_string(),
            )
            .into());
        }

        if self.http_body_limit_mb == 0 {
            return Err(crate::OctopusError::Validation(
                "http_body_limit_mb must be at least 1".to_string(),
            )
            .into());
        }

        if self.idle_after_seconds == 0 || self.offline_after_seconds <= self.idle_after_seconds {
            return Err(crate::OctopusError::Validation(
                "offline_after_seconds must be greater than idle_after_seconds, which must be > 0"
                    .to_string(),
            )
            .into());
        }

        Ok(())
    }
}

impl WorkerConfig {
    /// Validate the worker configuration
    pub fn validate(&self) -> crate::Result<()> {
        crate::utils::validate_hostname(&self.hostname)?;

        if self.coordinator_url.is_empty() {
            return Err(crate::OctopusError::Validation(
                "coordinator_url cannot be empty".to_string(),
            )
            .into());
        }
        crate::utils::validate_url(&self.coordinator_url, false)?;

        if self.poll_interval_seconds == 0 {
            return Err(crate::OctopusError::Validation(
                "poll_interval_seconds must be at least 1".to_string(),
            )
            .into());
        }

        if self.channel_buffer_size == 0 {
            return Err(crate::OctopusError::Validation(
                "channel_buffer_size must be at least 1".to_string(),
            )
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod config_tests;
