//! Configuration management for the Octopus worker
//!
//! This module handles loading, validation, and CLI-override of worker
//! configuration from a `worker.toml` file.

use anyhow::{Context, Result};
use shared::config::WorkerConfig;
use std::path::PathBuf;
use tracing::{debug, info};

const WORKER_CONFIG_FILE: &str = "worker.toml";

/// Manages the worker's configuration lifecycle: initial load, validation,
/// and CLI-driven overrides persisted back to disk.
pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: Option<WorkerConfig>,
}

impl ConfigManager {
    /// Creates a new `ConfigManager` and immediately loads the configuration.
    /// `config_path` may point directly at a `worker.toml` file or at the
    /// directory containing one.
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_path = if config_path.is_dir() {
            config_path.join(WORKER_CONFIG_FILE)
        } else {
            config_path
        };

        if !config_path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file does not exist: {}",
                config_path.display()
            ));
        }

        let mut manager = Self {
            config_path,
            config: None,
        };
        manager.load_config()?;
        Ok(manager)
    }

    /// Loads the configuration file from disk, parses, and validates it.
    pub fn load_config(&mut self) -> Result<()> {
        info!(
            "Loading worker configuration from {}",
            self.config_path.display()
        );

        let content = std::fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read {}", self.config_path.display()))?;

        let config: WorkerConfig = toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse {} - TOML syntax error in worker configuration file",
                self.config_path.display()
            )
        })?;

        config.validate().with_context(|| {
            format!(
                "Validation failed for worker configuration in {}",
                self.config_path.display()
            )
        })?;

        debug!(
            hostname = %config.hostname,
            coordinator_url = %config.coordinator_url,
            plugins_dir = %config.plugins_dir,
            poll_interval_seconds = config.poll_interval_seconds,
            misfire_grace_seconds = config.misfire_grace_seconds,
            "Worker configuration parsed"
        );
        info!(hostname = %config.hostname, "Worker configuration loaded successfully");

        self.config = Some(config);
        Ok(())
    }

    /// Applies CLI overrides on top of the loaded configuration and persists
    /// the result to disk if anything changed.
    pub fn override_and_persist_config(
        &mut self,
        hostname: Option<String>,
        coordinator_url: Option<String>,
        plugins_dir: Option<String>,
        poll_interval_seconds: Option<u64>,
    ) -> Result<bool> {
        let mut changed = false;

        if self.config.is_none() {
            self.load_config()?;
        }
        let mut config = self.config.clone().expect("configuration must be loaded");

        if let Some(host) = hostname {
            if config.hostname != host {
                info!("Overriding hostname: {} -> {}", config.hostname, host);
                config.hostname = host;
                changed = true;
            }
        }

        if let Some(url) = coordinator_url {
            if config.coordinator_url != url {
                info!(
                    "Overriding coordinator_url: {} -> {}",
                    config.coordinator_url, url
                );
                config.coordinator_url = url;
                changed = true;
            }
        }

        if let Some(dir) = plugins_dir {
            if config.plugins_dir != dir {
                info!("Overriding plugins_dir: {} -> {}", config.plugins_dir, dir);
                config.plugins_dir = dir;
                changed = true;
            }
        }

        if let Some(interval) = poll_interval_seconds {
            if config.poll_interval_seconds != interval {
                info!(
                    "Overriding poll_interval_seconds: {} -> {}",
                    config.poll_interval_seconds, interval
                );
                config.poll_interval_seconds = interval;
                changed = true;
            }
        }

        if changed {
            config
                .validate()
                .context("Invalid configuration after applying command-line overrides")?;

            let toml_str = toml::to_string_pretty(&config)
                .context("Failed to serialize worker configuration")?;
            std::fs::write(&self.config_path, toml_str)
                .with_context(|| format!("Failed to write {}", self.config_path.display()))?;

            self.config = Some(config);
            info!("Worker configuration updated and persisted to disk");
        }

        Ok(changed)
    }

    pub fn is_loaded(&self) -> bool {
        self.config.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_sample(dir: &TempDir) -> PathBuf {
        let path = dir.path().join(WORKER_CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
            hostname = "worker-01"
            coordinator_url = "http://127.0.0.1:8080"
            plugins_dir = "./plugins"
            "#,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_load_config_applies_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let manager = ConfigManager::new(path).unwrap();
        assert!(manager.is_loaded());
        assert_eq!(manager.config.as_ref().unwrap().poll_interval_seconds, 10);
        assert_eq!(manager.config.as_ref().unwrap().misfire_grace_seconds, 60);
    }

    #[test]
    fn test_override_and_persist_changes_coordinator_url() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let mut manager = ConfigManager::new(path).unwrap();

        let changed = manager
            .override_and_persist_config(
                None,
                Some("http://10.0.0.5:9090".to_string()),
                None,
                None,
            )
            .unwrap();
        assert!(changed);
        assert_eq!(
            manager.config.as_ref().unwrap().coordinator_url,
            "http://10.0.0.5:9090"
        );
    }

    #[test]
    fn test_missing_config_file_errors() {
        let dir = TempDir::new().unwrap();
        let result = ConfigManager::new(dir.path().join("missing.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_hostname_rejected_on_override() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let mut manager = ConfigManager::new(path).unwrap();

        let result =
            manager.override_and_persist_config(Some(String::new()), None, None, None);
        assert!(result.is_err());
    }
}
