//! Per-hostname command queue
//!
//! A FIFO of plugin-level control messages (restart, shutdown, info). A GET
//! drains the queue for that hostname (at-most-once delivery).

use anyhow::Result;
use rusqlite::params;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::store::Store;

pub struct CommandQueue {
    store: Arc<Mutex<Store>>,
}

impl CommandQueue {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }

    /// Enqueues a command payload for delivery to `hostname`.
    pub async fn push(&self, hostname: &str, payload: &Value) -> Result<()> {
        let now = shared::utils::current_timestamp();
        let serialized = serde_json::to_string(payload)?;

        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        conn.execute(
            "INSERT INTO commands (hostname, payload, created_at) VALUES (?1, ?2, ?3)",
            params![hostname, serialized, now],
        )?;
        Ok(())
    }

    /// Drains and returns all queued commands for `hostname`, oldest first.
    pub async fn drain(&self, hostname: &str) -> Result<Vec<Value>> {
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;

        let commands: Vec<Value> = {
            let mut stmt = conn.prepare(
                "SELECT payload FROM commands WHERE hostname = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![hostname], |row| {
                let raw: String = row.get(0)?;
                Ok(raw)
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(serde_json::from_str(&row?)?);
            }
            out
        };

        conn.execute("DELETE FROM commands WHERE hostname = ?1", params![hostname])?;

        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (CommandQueue, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut store = Store::new(dir.path().join("octopus.db")).unwrap();
        store.initialize().unwrap();
        (CommandQueue::new(Arc::new(Mutex::new(store))), dir)
    }

    #[tokio::test]
    async fn test_push_and_drain_preserves_order() {
        let (queue, _dir) = setup().await;
        queue.push("w1", &serde_json::json!({"action": "restart"})).await.unwrap();
        queue.push("w1", &serde_json::json!({"action": "shutdown"})).await.unwrap();

        let drained = queue.drain("w1").await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0]["action"], "restart");
        assert_eq!(drained[1]["action"], "shutdown");
    }

    #[tokio::test]
    async fn test_drain_empties_queue() {
        let (queue, _dir) = setup().await;
        queue.push("w1", &serde_json::json!({"action": "info"})).await.unwrap();
        queue.drain("w1").await.unwrap();
        assert!(queue.drain("w1").await.unwrap().is_empty());
    }
}
