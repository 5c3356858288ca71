//! Octopus Coordinator
//!
//! The coordinator assigns queued tasks to online workers, records execution
//! results, and serves the HTTP API workers poll against.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const COORDINATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod assignment;
mod cache;
mod commands;
mod config;
mod ledger;
mod params;
mod registry;
mod store;

use config::ConfigManager;
use store::Store;

/// Command-line arguments for the coordinator
#[derive(Parser, Debug)]
#[command(name = "coordinator")]
#[command(about = "Central coordinator for the Octopus task orchestration system", long_about = None)]
struct CliArgs {
    /// Path to the coordinator configuration file (coordinator.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the bind address from config file
    #[arg(long = "bind-address", value_name = "ADDRESS")]
    bind_address: Option<String>,

    /// Override the SQLite database path from config file
    #[arg(long = "db-path", value_name = "PATH")]
    db_path: Option<String>,

    /// Override the data retention days from config file
    #[arg(long = "retention-days", value_name = "DAYS")]
    retention_days: Option<u32>,

    /// Override the plugins directory from config file
    #[arg(long = "plugins-dir", value_name = "DIR")]
    plugins_dir: Option<String>,
}

/// The main coordinator application structure.
pub struct Coordinator {
    pub config_manager: Arc<Mutex<ConfigManager>>,
    bind_address: SocketAddr,
    store: Option<Arc<Mutex<Store>>>,
    assignment_task_handle: Option<JoinHandle<()>>,
    retention_task_handle: Option<JoinHandle<()>>,
    wal_checkpoint_task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Coordinator {
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_manager = ConfigManager::new(config_path)?;
        let config = config_manager
            .config
            .as_ref()
            .expect("coordinator configuration not loaded. This should not happen as config is loaded in new().");

        let bind_address: SocketAddr = config.bind_address.parse().map_err(|e| {
            anyhow::anyhow!("Invalid bind_address '{}': {}", config.bind_address, e)
        })?;

        Ok(Self {
            config_manager: Arc::new(Mutex::new(config_manager)),
            bind_address,
            store: None,
            assignment_task_handle: None,
            retention_task_handle: None,
            wal_checkpoint_task_handle: None,
            shutdown_tx: None,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Starting Octopus coordinator");

        let config = {
            let config_manager = self.config_manager.lock().await;
            config_manager
                .config
                .as_ref()
                .expect("coordinator configuration not loaded. This should not happen as config is loaded in new().")
                .clone()
        };

        info!(
            bind_address = %self.bind_address,
            retention_days = config.retention_days,
            plugins_dir = %config.plugins_dir,
            "Coordinator configuration loaded"
        );

        info!("Initializing store at {}", config.db_path);
        let mut store = Store::new(PathBuf::from(&config.db_path))
            .context("Failed to create store")?;
        store.initialize().context("Failed to initialize store")?;
        info!("Store initialized successfully");

        let store_arc = Arc::new(Mutex::new(store));
        self.store = Some(Arc::clone(&store_arc));

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let app_state = crate::api::AppState::new((*config).clone(), Arc::clone(&store_arc));
        let app = crate::api::create_router(app_state.clone());

        // Periodic assignment pass, in addition to the opportunistic pass
        // `GET /tasks` already triggers.
        let assignment_interval_secs = config.assignment_interval_seconds;
        let assignment_engine = app_state.assignment.clone();
        let mut assignment_shutdown_rx = shutdown_tx.subscribe();
        let assignment_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(assignment_interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match assignment_engine.run_pass(false).await {
                            Ok(crate::assignment::PassOutcome::Ran(stats)) => {
                                if stats.assigned_after > 0 {
                                    info!(
                                        assigned = stats.assigned_after,
                                        total = stats.total,
                                        "Periodic assignment pass completed"
                                    );
                                }
                            }
                            Ok(_) => {}
                            Err(e) => error!("Periodic assignment pass failed: {}", e),
                        }
                    }
                    _ = assignment_shutdown_rx.recv() => {
                        info!("Assignment task received shutdown signal");
                        break;
                    }
                }
            }
        });

        // Periodic retention sweep of old executions.
        let retention_interval_secs = config.retention_sweep_interval_seconds;
        let retention_days = config.retention_days;
        let store_for_retention = Arc::clone(&store_arc);
        let mut retention_shutdown_rx = shutdown_tx.subscribe();
        let retention_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(retention_interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        info!("Running periodic retention sweep");
                        let mut store = store_for_retention.lock().await;
                        match store.purge_older_than(retention_days) {
                            Ok(purged) => info!(purged, "Retention sweep completed"),
                            Err(e) => error!("Retention sweep failed: {}", e),
                        }
                    }
                    _ = retention_shutdown_rx.recv() => {
                        info!("Retention task received shutdown signal");
                        break;
                    }
                }
            }
        });

        // Periodic WAL checkpoint.
        let wal_checkpoint_interval_secs = config.wal_checkpoint_interval_seconds;
        let store_for_wal = Arc::clone(&store_arc);
        let mut wal_shutdown_rx = shutdown_tx.subscribe();
        let wal_checkpoint_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                wal_checkpoint_interval_secs,
            ));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        info!("Running periodic WAL checkpoint");
                        let mut store = store_for_wal.lock().await;
                        match store.checkpoint_wal() {
                            Ok(frames) => info!("WAL checkpoint completed: {} frames checkpointed", frames),
                            Err(e) => warn!("WAL checkpoint failed: {}", e),
                        }
                    }
                    _ = wal_shutdown_rx.recv() => {
                        info!("WAL checkpoint task received shutdown signal");
                        break;
                    }
                }
            }
        });

        self.assignment_task_handle = Some(assignment_task);
        self.retention_task_handle = Some(retention_task);
        self.wal_checkpoint_task_handle = Some(wal_checkpoint_task);

        info!("Starting HTTP server on {}", self.bind_address);
        let listener = tokio::net::TcpListener::bind(self.bind_address)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind TCP listener to {}. \
                     Check if port is already in use (EADDRINUSE) or requires elevated permissions (EACCES).",
                    self.bind_address
                )
            })?;

        let shutdown_signal = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("HTTP server received shutdown signal");
            }
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }

    pub async fn shutdown(&mut self) {
        info!("Shutting down Octopus coordinator gracefully");

        let shutdown_timeout_secs = {
            let config_manager = self.config_manager.lock().await;
            config_manager
                .config
                .as_ref()
                .map(|c| c.graceful_shutdown_timeout_seconds)
                .unwrap_or(30)
        };

        if let Some(shutdown_tx) = &self.shutdown_tx {
            if let Err(e) = shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }

        for (name, handle) in [
            ("assignment", self.assignment_task_handle.take()),
            ("retention", self.retention_task_handle.take()),
            ("WAL checkpoint", self.wal_checkpoint_task_handle.take()),
        ] {
            if let Some(handle) = handle {
                info!(
                    "Waiting for {} task to complete (timeout: {}s)",
                    name, shutdown_timeout_secs
                );
                match tokio::time::timeout(
                    std::time::Duration::from_secs(shutdown_timeout_secs),
                    handle,
                )
                .await
                {
                    Ok(Ok(())) => info!("{} task completed successfully", name),
                    Ok(Err(e)) => warn!("{} task panicked: {}", name, e),
                    Err(_) => warn!("{} task shutdown timeout reached, aborting", name),
                }
            }
        }

        if let Some(store) = &self.store {
            info!("Closing store connection");
            let mut store = store.lock().await;
            store.close();
            info!("Store connection closed");
        }

        info!("Coordinator shutdown complete");
    }
}

async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                error!("Falling back to Ctrl+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for Ctrl+C: {}", e);
                } else {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to receive Ctrl+C signal: {}", e);
        } else {
            info!("Received Ctrl+C");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let file_appender = tracing_appender::rolling::daily("./logs", "coordinator.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("coordinator=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    info!("Octopus coordinator v{} starting up", COORDINATOR_VERSION);
    info!("Configuration file: {}", cli_args.config_file.display());

    if cli_args.bind_address.is_some() {
        info!("Bind address override provided via command line");
    }
    if cli_args.db_path.is_some() {
        info!("Database path override provided via command line");
    }
    if cli_args.retention_days.is_some() {
        info!("Retention days override provided via command line");
    }
    if cli_args.plugins_dir.is_some() {
        info!("Plugins directory override provided via command line");
    }

    let mut coordinator = match Coordinator::new(cli_args.config_file) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("Failed to initialize coordinator: {}", e);
            std::process::exit(1);
        }
    };

    if cli_args.bind_address.is_some()
        || cli_args.db_path.is_some()
        || cli_args.retention_days.is_some()
        || cli_args.plugins_dir.is_some()
    {
        let changed = {
            let mut config_manager = coordinator.config_manager.lock().await;
            match config_manager.override_and_persist_config(
                cli_args.bind_address,
                cli_args.db_path,
                cli_args.retention_days,
                cli_args.plugins_dir,
            ) {
                Ok(changed) => changed,
                Err(e) => {
                    error!("Failed to apply configuration overrides: {}", e);
                    std::process::exit(1);
                }
            }
        };

        if changed {
            info!("Configuration overrides applied and persisted to disk");
            let config = {
                let config_manager = coordinator.config_manager.lock().await;
                config_manager
                    .config
                    .as_ref()
                    .expect("coordinator configuration not loaded. This should not happen as config is loaded in new().")
                    .clone()
            };
            coordinator.bind_address = config
                .bind_address
                .parse()
                .map_err(|e| {
                    error!("Invalid bind_address after override: {}", e);
                    std::process::exit(1);
                })
                .unwrap();
        } else {
            info!("Command-line values match existing config, no changes needed");
        }
    }

    tokio::select! {
        result = coordinator.run() => {
            if let Err(e) = result {
                error!("Coordinator error: {}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
    }

    coordinator.shutdown().await;
    info!("Coordinator shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_coordinator_creation() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
bind_address = "127.0.0.1:8787"
db_path = "/tmp/octopus-test.db"
plugins_dir = "/tmp/octopus-plugins"
"#
        )
        .unwrap();

        let config_path = temp_file.path().to_path_buf();
        let result = Coordinator::new(config_path);
        assert!(result.is_ok());
    }
}
