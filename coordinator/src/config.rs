//! Configuration management for the Octopus coordinator
//!
//! This module handles loading, validation, and CLI-override of coordinator
//! configuration from a `coordinator.toml` file.

use anyhow::{Context, Result};
use shared::config::CoordinatorConfig;
use std::path::PathBuf;
use tracing::{debug, info};

const COORDINATOR_CONFIG_FILE: &str = "coordinator.toml";

/// Manages the coordinator's configuration lifecycle: initial load,
/// validation, and CLI-driven overrides persisted back to disk.
pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: Option<CoordinatorConfig>,
}

impl ConfigManager {
    /// Creates a new `ConfigManager` and immediately loads the configuration.
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_path = if config_path.is_dir() {
            config_path.join(COORDINATOR_CONFIG_FILE)
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
            "Loading coordinator configuration from {}",
            self.config_path.display()
        );

        let content = std::fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read {}", self.config_path.display()))?;

        let config: CoordinatorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.config_path.display()))?;

        config.validate().with_context(|| {
            format!(
                "Invalid coordinator configuration in {}",
                self.config_path.display()
            )
        })?;

        debug!(bind_address = %config.bind_address, db_path = %config.db_path, "Coordinator configuration parsed");
        info!(
            bind_address = %config.bind_address,
            retention_days = config.retention_days,
            "Coordinator configuration loaded successfully"
        );

        self.config = Some(config);
        Ok(())
    }

    /// Applies CLI overrides on top of the loaded configuration and persists
    /// the result to disk if anything changed.
    pub fn override_and_persist_config(
        &mut self,
        bind_address: Option<String>,
        db_path: Option<String>,
        retention_days: Option<u32>,
        plugins_dir: Option<String>,
    ) -> Result<bool> {
        let mut changed = false;

        if self.config.is_none() {
            self.load_config()?;
        }
        let mut config = self
            .config
            .clone()
            .expect("configuration must be loaded");

        if let Some(addr) = bind_address {
            if config.bind_address != addr {
                info!("Overriding bind_address: {} -> {}", config.bind_address, addr);
                config.bind_address = addr;
                changed = true;
            }
        }

        if let Some(path) = db_path {
            if config.db_path != path {
                info!("Overriding db_path: {} -> {}", config.db_path, path);
                config.db_path = path;
                changed = true;
            }
        }

        if let Some(days) = retention_days {
            if config.retention_days != days {
                info!(
                    "Overriding retention_days: {} -> {}",
                    config.retention_days, days
                );
                config.retention_days = days;
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

        if changed {
            config
                .validate()
                .context("Invalid configuration after applying command-line overrides")?;

            let toml_str = toml::to_string_pretty(&config)
                .context("Failed to serialize coordinator configuration")?;
            std::fs::write(&self.config_path, toml_str)
                .with_context(|| format!("Failed to write {}", self.config_path.display()))?;

            self.config = Some(config);
            info!("Coordinator configuration updated and persisted to disk");
        }

        Ok(changed)
    }

    pub fn is_loaded(&self) -> bool {
        self.config.is_some()
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod config_tests;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_sample(dir: &TempDir) -> PathBuf {
        let path = dir.path().join(COORDINATOR_CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
            bind_address = "127.0.0.1:8080"
            db_path = "octopus.db"
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
        assert_eq!(manager.config.as_ref().unwrap().retention_days, 30);
    }

    #[test]
    fn test_override_and_persist_changes_bind_address() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let mut manager = ConfigManager::new(path).unwrap();

        let changed = manager
            .override_and_persist_config(Some("0.0.0.0:9090".to_string()), None, None, None)
            .unwrap();
        assert!(changed);
        assert_eq!(manager.config.as_ref().unwrap().bind_address, "0.0.0.0:9090");
    }

    #[test]
    fn test_missing_config_file_errors() {
        let dir = TempDir::new().unwrap();
        let result = ConfigManager::new(dir.path().join("missing.toml"));
        assert!(result.is_err());
    }
}
