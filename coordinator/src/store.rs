//! Store management for the Octopus coordinator
//!
//! This module owns the single SQLite database that backs every coordinator
//! component: tasks, executions, workers, the per-worker command queue, and
//! user parameters. Other coordinator modules (registry, assignment, ledger,
//! cache, commands) borrow the connection through `Store::get_connection`
//! while holding the shared `tokio::sync::Mutex<Store>` in `AppState`.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Manages the SQLite database for the coordinator.
pub struct Store {
    db_path: PathBuf,
    connection: Option<Connection>,
}

impl Store {
    /// Creates a new `Store` manager, ensuring the database's parent directory exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
            }
        }

        Ok(Self {
            db_path,
            connection: None,
        })
    }

    /// Initializes the database by creating tables and indexes if they don't exist.
    /// Idempotent and safe to call on every coordinator startup.
    pub fn initialize(&mut self) -> Result<()> {
        info!("Initializing coordinator store at {}", self.db_path.display());

        let conn = self.get_connection()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                owner TEXT NOT NULL,
                plugin TEXT NOT NULL,
                action TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '[]',
                kwargs TEXT NOT NULL DEFAULT '{}',
                interval_seconds INTEGER,
                end_of_window REAL,
                status TEXT NOT NULL,
                result TEXT NOT NULL DEFAULT '',
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create tasks table")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT UNIQUE NOT NULL,
                task_id TEXT NOT NULL,
                worker TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT NOT NULL DEFAULT '',
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create executions table")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                hostname TEXT PRIMARY KEY,
                last_heartbeat REAL NOT NULL,
                registered_at REAL NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create workers table")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS commands (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hostname TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at REAL NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create commands table")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS user_params (
                username TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                is_sensitive INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (username, name)
            )
            "#,
            [],
        )
        .context("Failed to create user_params table")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                expires_at REAL,
                PRIMARY KEY (namespace, key)
            )
            "#,
            [],
        )
        .context("Failed to create cache_entries table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_task_id ON executions(task_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_worker ON executions(worker)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_created_at ON executions(created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_commands_hostname ON commands(hostname, id)",
            [],
        )?;

        self.migrate_schema()?;

        info!("Coordinator store initialization complete");
        Ok(())
    }

    /// Adds columns introduced after a table's initial `CREATE TABLE IF NOT EXISTS`,
    /// so existing deployments upgrade in place without a destructive migration.
    fn migrate_schema(&mut self) -> Result<()> {
        let conn = self
            .connection
            .as_mut()
            .expect("connection initialized above");

        let has_column = |conn: &Connection, table: &str, column: &str| -> Result<bool> {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(1)?;
                if name == column {
                    return Ok(true);
                }
            }
            Ok(false)
        };

        if !has_column(conn, "executions", "result")? {
            conn.execute(
                "ALTER TABLE executions ADD COLUMN result TEXT NOT NULL DEFAULT ''",
                [],
            )?;
        }

        if !has_column(conn, "tasks", "result")? {
            conn.execute(
                "ALTER TABLE tasks ADD COLUMN result TEXT NOT NULL DEFAULT ''",
                [],
            )?;
        }

        Ok(())
    }

    /// Lazily gets a mutable reference to the database connection, creating it if needed.
    pub fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;

            conn.query_row("PRAGMA wal_autocheckpoint=1000", [], |_| Ok(()))
                .context("Failed to set WAL auto-checkpoint")?;

            conn.execute("PRAGMA foreign_keys=ON", [])
                .context("Failed to enable foreign key constraints")?;

            conn.busy_timeout(std::time::Duration::from_secs(30))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }
        Ok(self
            .connection
            .as_mut()
            .expect("connection should exist after lazy init"))
    }

    /// Performs a WAL checkpoint to merge WAL file changes back into the main database.
    pub fn checkpoint_wal(&mut self) -> Result<i64> {
        debug!("Performing WAL checkpoint on coordinator store");

        let conn = self.get_connection()?;
        let (busy, log_frames, checkpointed): (i64, i64, i64) =
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;

        if busy != 0 {
            warn!(
                "WAL checkpoint was blocked (busy). Frames remaining in log: {}",
                log_frames
            );
        } else {
            debug!(
                "WAL checkpoint complete: {} frames checkpointed, {} frames remaining",
                checkpointed, log_frames
            );
        }

        Ok(checkpointed)
    }

    /// Purges executions and terminal tasks older than `retention_days`.
    pub fn purge_older_than(&mut self, retention_days: u32) -> Result<u64> {
        let cutoff = shared::utils::current_timestamp() - (retention_days as f64 * 86_400.0);
        info!(
            retention_days,
            cutoff, "Purging executions older than retention window"
        );

        let conn = self.get_connection()?;
        let deleted = conn.execute(
            "DELETE FROM executions WHERE created_at < ?1",
            rusqlite::params![cutoff],
        )?;

        conn.execute("VACUUM", [])?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;

        Ok(deleted as u64)
    }

    /// Closes the database connection.
    pub fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Err(e) = conn.close() {
                warn!("Error closing store connection: {:?}", e.1);
            } else {
                debug!("Store connection closed");
            }
        }
    }
}
