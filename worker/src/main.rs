//! Octopus worker
//!
//! The worker polls the coordinator for the tasks assigned to its hostname,
//! fires them on schedule, and reports execution results back. It runs the
//! plugins compiled into it; nothing here reaches out to the filesystem for
//! code, only for plugin manifest metadata.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::{error, info, warn};

mod client;
mod config;
mod plugins;
mod response;
mod scheduler;

use client::CoordinatorClient;
use config::ConfigManager;
use plugins::PluginRegistry;
use response::ResponseProcessor;
use scheduler::Scheduler;
use shared::config::WorkerConfig;

/// Command-line arguments for the worker
#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Octopus worker that fires assigned tasks and reports results", long_about = None)]
struct CliArgs {
    /// Path to worker.toml, or the directory containing it
    #[arg(value_name = "CONFIG_PATH")]
    config_path: PathBuf,

    /// Override the hostname from the config file
    #[arg(long = "hostname", value_name = "HOSTNAME")]
    hostname: Option<String>,

    /// Override the coordinator URL from the config file
    #[arg(long = "coordinator-url", value_name = "URL")]
    coordinator_url: Option<String>,

    /// Override the plugins directory from the config file
    #[arg(long = "plugins-dir", value_name = "DIR")]
    plugins_dir: Option<String>,

    /// Override the assignment sync interval in seconds
    #[arg(long = "poll-interval-seconds", value_name = "SECONDS")]
    poll_interval_seconds: Option<u64>,
}

/// Owns every long-lived piece of the worker process: the coordinator
/// client, the plugin registry, and the scheduler that drives firings.
struct Worker {
    config_manager: ConfigManager,
    client: CoordinatorClient,
    scheduler: Scheduler,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl Worker {
    async fn new(config_path: PathBuf) -> Result<Self> {
        let config_manager =
            ConfigManager::new(config_path).context("Failed to load worker configuration")?;
        let config = config_manager
            .config
            .clone()
            .expect("configuration must be loaded");

        Self::build(config_manager, config).await
    }

    async fn build(config_manager: ConfigManager, config: WorkerConfig) -> Result<Self> {
        let client = CoordinatorClient::new(
            config.coordinator_url.clone(),
            config.hostname.clone(),
            config.http_client_timeout_seconds,
            config.retry_base_delay_ms,
            config.retry_max_delay_ms,
        )
        .context("Failed to build coordinator HTTP client")?;

        let plugins_dir = PathBuf::from(&config.plugins_dir);
        let plugins = Arc::new(PluginRegistry::new(&plugins_dir).with_context(|| {
            format!(
                "Failed to initialize plugin registry at {}",
                plugins_dir.display()
            )
        })?);

        let plugin_outputs_dir = plugins_dir
            .parent()
            .unwrap_or(&plugins_dir)
            .join("plugin_outputs");
        let response_processor = Arc::new(ResponseProcessor::new(
            client.clone(),
            plugin_outputs_dir,
            config.hostname.clone(),
        ));

        let scheduler = Scheduler::new(
            client.clone(),
            plugins,
            response_processor,
            config.hostname.clone(),
            config.channel_buffer_size,
            config.graceful_shutdown_timeout_seconds,
            config.misfire_grace_seconds,
        );

        Ok(Self {
            config_manager,
            client,
            scheduler,
            shutdown_tx: None,
        })
    }

    /// Fetches the current assignment list and reconciles it with the
    /// scheduler's registered jobs (§4.5 sync algorithm).
    async fn sync_tasks(&mut self) {
        match self.client.fetch_assigned_tasks().await {
            Ok(tasks) => {
                info!(count = tasks.len(), "Synced assigned tasks");
                self.scheduler.sync(&tasks);
            }
            Err(e) => warn!("Failed to sync assigned tasks: {}", e),
        }
    }

    async fn send_heartbeat(&self) {
        if let Err(e) = self.client.send_heartbeat().await {
            warn!("Failed to send heartbeat: {}", e);
        }
    }

    /// Drains queued commands for this worker. Commands are opaque
    /// operator-issued directives; unrecognized ones are logged rather than
    /// treated as fatal.
    async fn drain_commands(&mut self) {
        match self.client.drain_commands().await {
            Ok(commands) if !commands.is_empty() => {
                info!(count = commands.len(), "Drained queued commands");
                for command in commands {
                    info!(?command, "Received command");
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to drain commands: {}", e),
        }
    }

    /// Main loop: reconciles the task list and heartbeats on a fixed
    /// cadence, while firings and their results are handled as soon as
    /// their channels yield something.
    async fn run(&mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let config = self
            .config_manager
            .config
            .clone()
            .expect("configuration must be loaded");

        let mut sync_interval =
            tokio::time::interval(Duration::from_secs(config.poll_interval_seconds));
        let mut heartbeat_interval = tokio::time::interval(Duration::from_secs(30));

        info!(hostname = %config.hostname, coordinator_url = %config.coordinator_url, "Worker starting");

        loop {
            tokio::select! {
                _ = sync_interval.tick() => {
                    self.sync_tasks().await;
                    self.drain_commands().await;
                }
                _ = heartbeat_interval.tick() => {
                    self.send_heartbeat().await;
                }
                Some(task) = self.scheduler.ready_receiver.recv() => {
                    self.scheduler.fire_ready_task(task);
                }
                Some(result) = self.scheduler.result_receiver.recv() => {
                    self.scheduler.handle_result(result);
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down worker");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.scheduler.shutdown().await;
        info!("Worker shutdown complete");
    }
}

fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    std::fs::create_dir_all("./logs").context("Failed to create logs directory")?;
    let file_appender = tracing_appender::rolling::daily("./logs", "worker.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("worker=info,shared=info"));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(non_blocking)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _tracing_guard = init_tracing().context("Failed to initialize tracing")?;
    let args = CliArgs::parse();

    let mut worker = match Worker::new(args.config_path.clone()).await {
        Ok(worker) => worker,
        Err(e) => {
            error!("FATAL ERROR: Failed to initialize worker: {}", e);
            for cause in e.chain().skip(1) {
                error!("  caused by: {}", cause);
            }
            std::process::exit(1);
        }
    };

    let any_override = args.hostname.is_some()
        || args.coordinator_url.is_some()
        || args.plugins_dir.is_some()
        || args.poll_interval_seconds.is_some();

    if any_override {
        worker
            .config_manager
            .override_and_persist_config(
                args.hostname,
                args.coordinator_url,
                args.plugins_dir,
                args.poll_interval_seconds,
            )
            .context("Failed to apply command-line configuration overrides")?;

        let config = worker
            .config_manager
            .config
            .clone()
            .expect("configuration must be loaded");
        worker = Worker::build(worker.config_manager, config).await?;
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    worker.shutdown_tx = Some(shutdown_tx.clone());

    let shutdown_signal = async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = shutdown_tx.send(());
    };

    tokio::select! {
        _ = worker.run(shutdown_rx) => {}
        _ = shutdown_signal => {}
    }

    worker.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_new_fails_on_missing_config() {
        let result = Worker::new(PathBuf::from("/nonexistent/worker.toml")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_worker_builds_from_valid_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("worker.toml");
        std::fs::write(
            &config_path,
            format!(
                r#"
                hostname = "worker-test"
                coordinator_url = "http://127.0.0.1:1"
                plugins_dir = "{}"
                "#,
                dir.path().join("plugins").display()
            ),
        )
        .unwrap();

        let worker = Worker::new(config_path).await;
        assert!(worker.is_ok());
    }
}
