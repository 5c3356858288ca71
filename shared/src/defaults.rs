//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the configuration
//! structures. These functions are used by serde when deserializing configuration
//! files that don't specify certain optional fields.

// Coordinator configuration defaults

/// Default address and port the coordinator's API binds to.
pub fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

/// Default path to the SQLite store file.
pub fn default_db_path() -> String {
    "octopus.db".to_string()
}

/// Default directory the coordinator reads plugin manifests from.
pub fn default_plugins_dir() -> String {
    "./plugins".to_string()
}

/// Default minimum interval between assignment passes (seconds).
pub fn default_assignment_interval_seconds() -> u64 {
    2
}

/// Default execution ledger retention (days).
pub fn default_retention_days() -> u32 {
    30
}

/// Default interval between retention sweeps (seconds).
pub fn default_retention_sweep_interval_seconds() -> u64 {
    3600
}

/// Default WAL checkpoint interval (seconds).
pub fn default_wal_checkpoint_interval_seconds() -> u64 {
    60
}

/// Default SQLite busy timeout (seconds).
pub fn default_database_busy_timeout_seconds() -> u64 {
    30
}

/// Default graceful shutdown timeout (seconds).
pub fn default_graceful_shutdown_timeout_seconds() -> u64 {
    30
}

/// Default HTTP request body size limit (MB).
pub fn default_http_body_limit_mb() -> usize {
    16
}

/// Default worker liveness window before a worker is considered idle (seconds).
pub fn default_idle_after_seconds() -> u64 {
    60
}

/// Default worker liveness window before a worker is considered offline (seconds).
pub fn default_offline_after_seconds() -> u64 {
    300
}

// Worker configuration defaults

/// Default interval between coordinator sync polls (seconds).
pub fn default_poll_interval_seconds() -> u64 {
    10
}

/// Default HTTP client timeout when talking to the coordinator (seconds).
pub fn default_http_client_timeout_seconds() -> u64 {
    30
}

/// Default grace period for missed one-shot/interval firings (seconds).
pub fn default_misfire_grace_seconds() -> u64 {
    60
}

/// Default channel buffer size for scheduler ready/result channels.
pub fn default_channel_buffer_size() -> usize {
    1000
}

/// Default retry back-off base delay when the coordinator is unreachable (ms).
pub fn default_retry_base_delay_ms() -> u64 {
    5000
}

/// Default retry back-off cap (ms).
pub fn default_retry_max_delay_ms() -> u64 {
    60000
}
