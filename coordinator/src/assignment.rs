//! Assignment engine
//!
//! Binds tasks in state `Created` to concrete executors. A single
//! non-reentrant lock plus a minimum-interval guard serializes passes, the
//! same shape the teacher used to keep agent config distribution
//! non-overlapping.

use anyhow::Result;
use rand::seq::SliceRandom;
use rusqlite::params;
use serde::Serialize;
use shared::{Owner, TaskStatus};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::registry::WorkerRegistry;
use crate::store::Store;

const MIN_PASS_INTERVAL_SECONDS: f64 = 2.0;

/// Outcome of an assignment pass request.
#[derive(Debug)]
pub enum PassOutcome {
    Ran(PassStats),
    Locked,
    RateLimited { retry_after_seconds: f64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct PassStats {
    pub total: usize,
    pub unassigned_before: usize,
    pub assigned_after: usize,
    pub active_workers: usize,
}

struct CreatedTaskRow {
    id: String,
    owner: String,
}

/// Serializes assignment passes and rate-limits how often they may run.
pub struct AssignmentEngine {
    store: Arc<Mutex<Store>>,
    registry: Arc<WorkerRegistry>,
    lock: Arc<Mutex<()>>,
    last_pass_at_millis: AtomicI64,
    min_interval_seconds: f64,
}

impl AssignmentEngine {
    pub fn new(store: Arc<Mutex<Store>>, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            store,
            registry,
            lock: Arc::new(Mutex::new(())),
            last_pass_at_millis: AtomicI64::new(0),
            min_interval_seconds: MIN_PASS_INTERVAL_SECONDS,
        }
    }

    /// Runs a pass unless one is already in progress or the rate limit has
    /// not elapsed, unless `force` is set.
    pub async fn run_pass(&self, force: bool) -> Result<PassOutcome> {
        let now_millis = (shared::utils::current_timestamp() * 1000.0) as i64;
        if !force {
            let last = self.last_pass_at_millis.load(Ordering::SeqCst);
            let elapsed_seconds = (now_millis - last) as f64 / 1000.0;
            if last != 0 && elapsed_seconds < self.min_interval_seconds {
                return Ok(PassOutcome::RateLimited {
                    retry_after_seconds: self.min_interval_seconds - elapsed_seconds,
                });
            }
        }

        let guard = match self.lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(PassOutcome::Locked),
        };

        let stats = self.execute_pass().await?;
        self.last_pass_at_millis.store(now_millis, Ordering::SeqCst);
        drop(guard);

        Ok(PassOutcome::Ran(stats))
    }

    async fn execute_pass(&self) -> Result<PassStats> {
        let available = self.registry.available_workers().await?;

        let created_rows = {
            let mut store = self.store.lock().await;
            let conn = store.get_connection()?;
            let mut stmt = conn.prepare(
                "SELECT id, owner FROM tasks WHERE status = 'created' ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(CreatedTaskRow {
                    id: row.get(0)?,
                    owner: row.get(1)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let total = created_rows.len();
        let unassigned_before = created_rows.len();
        let mut assigned_after = 0;

        for task in created_rows {
            let owner: Owner = serde_json::from_value(serde_json::Value::String(task.owner.clone()))
                .unwrap_or(Owner::Anyone);

            let executor = match &owner {
                Owner::All => Some("ALL".to_string()),
                Owner::Anyone => available.choose(&mut rand::thread_rng()).cloned(),
                Owner::Worker(name) => {
                    if available.contains(name) {
                        Some(name.clone())
                    } else {
                        None
                    }
                }
            };

            if let Some(executor) = executor {
                let mut store = self.store.lock().await;
                let conn = store.get_connection()?;
                conn.execute(
                    "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'created'",
                    params![TaskStatus::Active.as_str(), shared::utils::current_timestamp(), task.id],
                )?;
                assigned_after += 1;
                info!(task_id = %task.id, executor, "Assigned task to executor");
            }
        }

        Ok(PassStats {
            total,
            unassigned_before,
            assigned_after,
            active_workers: available.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (AssignmentEngine, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut store = Store::new(dir.path().join("octopus.db")).unwrap();
        store.initialize().unwrap();
        let store = Arc::new(Mutex::new(store));
        let registry = Arc::new(WorkerRegistry::new(store.clone(), 60, 300));
        (AssignmentEngine::new(store, registry), dir)
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_rapid_passes() {
        let (engine, _dir) = setup().await;
        let first = engine.run_pass(false).await.unwrap();
        assert!(matches!(first, PassOutcome::Ran(_)));

        let second = engine.run_pass(false).await.unwrap();
        assert!(matches!(second, PassOutcome::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_force_bypasses_rate_limit() {
        let (engine, _dir) = setup().await;
        engine.run_pass(false).await.unwrap();
        let forced = engine.run_pass(true).await.unwrap();
        assert!(matches!(forced, PassOutcome::Ran(_)));
    }

    #[tokio::test]
    async fn test_all_owner_task_assigned_immediately() {
        let (engine, _dir) = setup().await;
        {
            let mut store = engine.store.lock().await;
            let conn = store.get_connection().unwrap();
            conn.execute(
                "INSERT INTO tasks (id, name, kind, owner, plugin, action, status, created_at, updated_at)
                 VALUES ('t1', 'n', 'adhoc', 'ALL', 'echo', 'run', 'created', 1.0, 1.0)",
                [],
            )
            .unwrap();
        }

        let outcome = engine.run_pass(true).await.unwrap();
        match outcome {
            PassOutcome::Ran(stats) => assert_eq!(stats.assigned_after, 1),
            other => panic!("expected Ran, got {:?}", other),
        }
    }
}
