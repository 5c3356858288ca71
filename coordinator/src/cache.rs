//! User profile and broadcast cache
//!
//! Stores arbitrary JSON values under a namespaced key with an optional
//! expiry, mirroring the teacher's `ConfigManager` cached-config pattern but
//! backed by a table instead of an in-memory map so entries survive restart.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::store::Store;

const DEFAULT_TTL_SECONDS: f64 = 3600.0;

pub struct CacheStore {
    store: Arc<Mutex<Store>>,
}

impl CacheStore {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }

    /// Stores `value` under `namespace`/`key`, expiring after `ttl_seconds`
    /// (defaults to one hour when `None`).
    pub async fn put(
        &self,
        namespace: &str,
        key: &str,
        value: &Value,
        ttl_seconds: Option<f64>,
    ) -> Result<()> {
        let now = shared::utils::current_timestamp();
        let expires_at = now + ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS);
        let serialized = serde_json::to_string(value)?;

        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        let updated = conn.execute(
            "UPDATE cache_entries SET value = ?1, expires_at = ?2 WHERE namespace = ?3 AND key = ?4",
            params![serialized, expires_at, namespace, key],
        )?;

        if updated == 0 {
            conn.execute(
                "INSERT INTO cache_entries (namespace, key, value, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![namespace, key, serialized, expires_at],
            )?;
        }

        Ok(())
    }

    /// Fetches a cached value, returning `None` if absent or expired.
    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let now = shared::utils::current_timestamp();
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;

        let row: Option<(String, Option<f64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM cache_entries WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((value, Some(expires_at))) if expires_at < now => {
                conn.execute(
                    "DELETE FROM cache_entries WHERE namespace = ?1 AND key = ?2",
                    params![namespace, key],
                )?;
                let _ = value;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Removes a single entry. Returns `true` if a row was deleted.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        let deleted = conn.execute(
            "DELETE FROM cache_entries WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (CacheStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut store = Store::new(dir.path().join("octopus.db")).unwrap();
        store.initialize().unwrap();
        (CacheStore::new(Arc::new(Mutex::new(store))), dir)
    }

    #[tokio::test]
    async fn test_put_and_get_round_trip() {
        let (cache, _dir) = setup().await;
        cache
            .put("user:alice", "profile", &serde_json::json!({"k": "v"}), None)
            .await
            .unwrap();

        let value = cache.get("user:alice", "profile").await.unwrap();
        assert_eq!(value, Some(serde_json::json!({"k": "v"})));
    }

    #[tokio::test]
    async fn test_expired_entry_returns_none() {
        let (cache, _dir) = setup().await;
        cache
            .put("broadcast", "k", &serde_json::json!(1), Some(-1.0))
            .await
            .unwrap();

        assert_eq!(cache.get("broadcast", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_removes_entry() {
        let (cache, _dir) = setup().await;
        cache
            .put("broadcast", "k", &serde_json::json!(1), None)
            .await
            .unwrap();
        assert!(cache.delete("broadcast", "k").await.unwrap());
        assert_eq!(cache.get("broadcast", "k").await.unwrap(), None);
    }
}
