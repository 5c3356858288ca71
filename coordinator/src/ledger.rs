//! Execution ledger
//!
//! Append-only record of task firing attempts. Derives each task's terminal
//! state from the outcome of its executions, the way the teacher's metrics
//! store derived agent health from the latest reported sample.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use shared::{Execution, ExecutionStatus, TaskKind};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::store::Store;

struct ParentTask {
    kind: TaskKind,
    end_of_window: Option<f64>,
}

/// Appends executions and derives parent-task terminal state.
pub struct ExecutionLedger {
    store: Arc<Mutex<Store>>,
}

impl ExecutionLedger {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }

    /// Appends or upgrades an execution row and, on terminal status, derives
    /// the parent task's new status per the status-guard rule.
    pub async fn append(
        &self,
        execution_id: &str,
        task_id: &str,
        worker: &str,
        status: ExecutionStatus,
        result: &str,
    ) -> Result<()> {
        let now = shared::utils::current_timestamp();
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;

        let updated = conn.execute(
            "UPDATE executions SET status = ?1, result = ?2, updated_at = ?3 WHERE execution_id = ?4",
            params![status_str(status), result, now, execution_id],
        )?;

        if updated == 0 {
            conn.execute(
                "INSERT INTO executions (execution_id, task_id, worker, status, result, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![execution_id, task_id, worker, status_str(status), result, now],
            )?;
        }

        if status.is_terminal() {
            let parent: Option<ParentTask> = conn
                .query_row(
                    "SELECT kind, end_of_window FROM tasks WHERE id = ?1",
                    params![task_id],
                    |row| {
                        let kind_str: String = row.get(0)?;
                        let kind = if kind_str == "schedule" {
                            TaskKind::Schedule
                        } else {
                            TaskKind::Adhoc
                        };
                        Ok(ParentTask {
                            kind,
                            end_of_window: row.get(1)?,
                        })
                    },
                )
                .optional()?;

            if let Some(parent) = parent {
                let new_status = match parent.kind {
                    TaskKind::Adhoc => {
                        if status == ExecutionStatus::Success {
                            Some("done")
                        } else {
                            Some("failed")
                        }
                    }
                    TaskKind::Schedule => match parent.end_of_window {
                        Some(eow) if now > eow => Some("done"),
                        _ => None,
                    },
                };

                if let Some(new_status) = new_status {
                    conn.execute(
                        "UPDATE tasks SET status = ?1, result = ?2, updated_at = ?3 WHERE id = ?4",
                        params![new_status, result, now, task_id],
                    )?;
                } else {
                    info!(
                        task_id,
                        "Suppressing terminal status write: recurring task's window has not elapsed"
                    );
                    conn.execute(
                        "UPDATE tasks SET result = ?1, updated_at = ?2 WHERE id = ?3",
                        params![result, now, task_id],
                    )?;
                }
            }
        }

        Ok(())
    }

    /// Lists executions, newest first, optionally filtered by task or worker.
    pub async fn list(
        &self,
        task_id: Option<&str>,
        worker: Option<&str>,
        status: Option<ExecutionStatus>,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<Execution>, u64)> {
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;

        let mut clauses = Vec::new();
        let mut bind: Vec<String> = Vec::new();
        if let Some(t) = task_id {
            clauses.push("task_id = ?".to_string());
            bind.push(t.to_string());
        }
        if let Some(w) = worker {
            clauses.push("worker = ?".to_string());
            bind.push(w.to_string());
        }
        if let Some(s) = status {
            clauses.push("status = ?".to_string());
            bind.push(status_str(s).to_string());
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM executions {}", where_clause);
        let total: u64 = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(bind.iter()),
            |row| row.get(0),
        )?;

        let list_sql = format!(
            "SELECT execution_id, task_id, worker, status, result, created_at, updated_at
             FROM executions {} ORDER BY created_at DESC LIMIT ? OFFSET ?",
            where_clause
        );
        let mut stmt = conn.prepare(&list_sql)?;
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> =
            bind.iter().map(|b| Box::new(b.clone()) as Box<dyn rusqlite::ToSql>).collect();
        params_vec.push(Box::new(limit as i64));
        params_vec.push(Box::new(offset as i64));

        let rows = stmt.query_map(rusqlite::params_from_iter(params_vec.iter()), |row| {
            let status_raw: String = row.get(3)?;
            Ok(Execution {
                execution_id: row.get(0)?,
                task_id: row.get(1)?,
                worker: row.get(2)?,
                status: ExecutionStatus::parse_tolerant(&status_raw).unwrap_or(ExecutionStatus::Failed),
                result: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?;

        let mut executions = Vec::new();
        for row in rows {
            executions.push(row?);
        }

        Ok((executions, total))
    }
}

fn status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Running => "running",
        ExecutionStatus::Success => "success",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (ExecutionLedger, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut store = Store::new(dir.path().join("octopus.db")).unwrap();
        store.initialize().unwrap();
        {
            let conn = store.get_connection().unwrap();
            conn.execute(
                "INSERT INTO tasks (id, name, kind, owner, plugin, action, status, created_at, updated_at)
                 VALUES ('t1', 'n', 'adhoc', 'ANYONE', 'echo', 'run', 'active', 1.0, 1.0)",
                [],
            )
            .unwrap();
        }
        (ExecutionLedger::new(Arc::new(Mutex::new(store))), dir)
    }

    #[tokio::test]
    async fn test_append_marks_adhoc_task_done_on_success() {
        let (ledger, _dir) = setup().await;
        ledger
            .append("t1_w1_1", "t1", "w1", ExecutionStatus::Success, "ok")
            .await
            .unwrap();

        let mut store = ledger.store.lock().await;
        let conn = store.get_connection().unwrap();
        let status: String = conn
            .query_row("SELECT status FROM tasks WHERE id = 't1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "done");
    }

    #[tokio::test]
    async fn test_append_upgrades_running_row_in_place() {
        let (ledger, _dir) = setup().await;
        ledger
            .append("t1_w1_1", "t1", "w1", ExecutionStatus::Running, "")
            .await
            .unwrap();
        ledger
            .append("t1_w1_1", "t1", "w1", ExecutionStatus::Success, "done")
            .await
            .unwrap();

        let (rows, total) = ledger.list(Some("t1"), None, None, 0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_schedule_task_stays_active_before_end_of_window() {
        let (ledger, _dir) = setup().await;
        {
            let mut store = ledger.store.lock().await;
            let conn = store.get_connection().unwrap();
            conn.execute(
                "UPDATE tasks SET kind = 'schedule', end_of_window = 999999999999.0 WHERE id = 't1'",
                [],
            )
            .unwrap();
        }

        ledger
            .append("t1_w1_1", "t1", "w1", ExecutionStatus::Success, "ok")
            .await
            .unwrap();

        let mut store = ledger.store.lock().await;
        let conn = store.get_connection().unwrap();
        let status: String = conn
            .query_row("SELECT status FROM tasks WHERE id = 't1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "active");
    }
}
