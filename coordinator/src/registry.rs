//! Worker registry
//!
//! Tracks which workers have checked in and derives liveness state
//! (`Online` / `Idle` / `Offline`) from the time since their last heartbeat,
//! the same upsert-then-classify shape the teacher used to track agents.

use anyhow::Result;
use rusqlite::params;
use shared::{Worker, WorkerStatus};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::Store;

/// Classifies and records worker heartbeats against the shared store.
pub struct WorkerRegistry {
    store: Arc<Mutex<Store>>,
    idle_after_seconds: u64,
    offline_after_seconds: u64,
}

impl WorkerRegistry {
    pub fn new(store: Arc<Mutex<Store>>, idle_after_seconds: u64, offline_after_seconds: u64) -> Self {
        Self {
            store,
            idle_after_seconds,
            offline_after_seconds,
        }
    }

    /// Records a heartbeat from `hostname`, inserting it if it has never
    /// been seen before. Mirrors the update-then-insert-on-zero-rows upsert
    /// pattern used for agent registration.
    pub async fn record_heartbeat(&self, hostname: &str) -> Result<()> {
        let now = shared::utils::current_timestamp();
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;

        let updated = conn.execute(
            "UPDATE workers SET last_heartbeat = ?1 WHERE hostname = ?2",
            params![now, hostname],
        )?;

        if updated == 0 {
            conn.execute(
                "INSERT INTO workers (hostname, last_heartbeat, registered_at) VALUES (?1, ?2, ?2)",
                params![hostname, now],
            )?;
            debug!(hostname, "Registered new worker");
        }

        Ok(())
    }

    /// Returns the worker's status classification based on time since last heartbeat.
    pub fn classify(&self, last_heartbeat: f64, now: f64) -> WorkerStatus {
        let age = now - last_heartbeat;
        if age < self.idle_after_seconds as f64 {
            WorkerStatus::Online
        } else if age < self.offline_after_seconds as f64 {
            WorkerStatus::Idle
        } else {
            WorkerStatus::Offline
        }
    }

    /// Returns all known workers with their raw heartbeat/registration timestamps.
    pub async fn list(&self) -> Result<Vec<Worker>> {
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        let mut stmt =
            conn.prepare("SELECT hostname, last_heartbeat, registered_at FROM workers ORDER BY hostname")?;
        let rows = stmt.query_map([], |row| {
            Ok(Worker {
                hostname: row.get(0)?,
                last_heartbeat: row.get(1)?,
                registered_at: row.get(2)?,
            })
        })?;

        let mut workers = Vec::new();
        for row in rows {
            workers.push(row?);
        }
        Ok(workers)
    }

    /// Returns the set of hostnames currently classified as `Online` or `Idle`,
    /// i.e. eligible to receive new task assignments.
    pub async fn available_workers(&self) -> Result<Vec<String>> {
        let now = shared::utils::current_timestamp();
        let workers = self.list().await?;
        Ok(workers
            .into_iter()
            .filter(|w| self.classify(w.last_heartbeat, now) != WorkerStatus::Offline)
            .map(|w| w.hostname)
            .collect())
    }
}
