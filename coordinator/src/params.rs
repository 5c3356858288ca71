//! User parameters
//!
//! Keyed configuration values owned by a username. Values flagged
//! `is_sensitive` are obfuscated at rest with a process-local symmetric key —
//! an opacity boundary, not a security boundary, matching the spec's
//! explicit caveat.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use shared::{ParamValue, UserParameter};
use std::sync::{Arc, OnceLock};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;

use crate::store::Store;

static OBFUSCATION_KEY: OnceLock<[u8; 32]> = OnceLock::new();

fn obfuscation_key() -> &'static [u8; 32] {
    OBFUSCATION_KEY.get_or_init(|| {
        let mut key = [0u8; 32];
        let random: [u8; 32] = rand::random();
        key.copy_from_slice(&random);
        key
    })
}

fn xor_with_key(data: &[u8]) -> Vec<u8> {
    let key = obfuscation_key();
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect()
}

fn obfuscate(value: &str) -> String {
    let xored = xor_with_key(value.as_bytes());
    xored.iter().map(|b| format!("{:02x}", b)).collect()
}

fn deobfuscate(stored: &str) -> Result<String> {
    let bytes: Result<Vec<u8>, _> = (0..stored.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&stored[i..i + 2], 16))
        .collect();
    let bytes = bytes.map_err(|e| anyhow::anyhow!("malformed obfuscated value: {}", e))?;
    let plain = xor_with_key(&bytes);
    Ok(String::from_utf8(plain)?)
}

/// Authorization check: `requester` may read `username`'s parameters only if
/// they are the same user or `requester` is listed in `admin_users`. Name
/// comparisons run in constant time, the same defense the teacher applied to
/// its API key check.
pub fn authorize(requester: &str, username: &str, admin_users: &[String]) -> bool {
    constant_time_eq(requester, username)
        || admin_users.iter().any(|a| constant_time_eq(a, requester))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

pub struct UserParameterStore {
    store: Arc<Mutex<Store>>,
}

impl UserParameterStore {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }

    pub async fn set(&self, username: &str, name: &str, value: &ParamValue, is_sensitive: bool) -> Result<()> {
        let serialized = serde_json::to_string(value)?;
        let stored_value = if is_sensitive {
            obfuscate(&serialized)
        } else {
            serialized
        };

        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        let updated = conn.execute(
            "UPDATE user_params SET value = ?1, is_sensitive = ?2 WHERE username = ?3 AND name = ?4",
            params![stored_value, is_sensitive as i64, username, name],
        )?;

        if updated == 0 {
            conn.execute(
                "INSERT INTO user_params (username, name, value, is_sensitive) VALUES (?1, ?2, ?3, ?4)",
                params![username, name, stored_value, is_sensitive as i64],
            )?;
        }

        Ok(())
    }

    pub async fn get(&self, username: &str, name: &str) -> Result<Option<UserParameter>> {
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;

        let row: Option<(String, bool)> = conn
            .query_row(
                "SELECT value, is_sensitive FROM user_params WHERE username = ?1 AND name = ?2",
                params![username, name],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
            )
            .optional()?;

        let Some((stored_value, is_sensitive)) = row else {
            return Ok(None);
        };

        let plain = if is_sensitive {
            deobfuscate(&stored_value)?
        } else {
            stored_value
        };
        let value: ParamValue = serde_json::from_str(&plain)?;

        Ok(Some(UserParameter {
            username: username.to_string(),
            name: name.to_string(),
            value,
            is_sensitive,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (UserParameterStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut store = Store::new(dir.path().join("octopus.db")).unwrap();
        store.initialize().unwrap();
        (UserParameterStore::new(Arc::new(Mutex::new(store))), dir)
    }

    #[tokio::test]
    async fn test_set_and_get_plain_value() {
        let (params, _dir) = setup().await;
        params
            .set("alice", "timeout", &ParamValue::Int(30), false)
            .await
            .unwrap();

        let fetched = params.get("alice", "timeout").await.unwrap().unwrap();
        assert_eq!(fetched.value, ParamValue::Int(30));
        assert!(!fetched.is_sensitive);
    }

    #[tokio::test]
    async fn test_sensitive_value_round_trips_through_obfuscation() {
        let (params, _dir) = setup().await;
        params
            .set("alice", "api_token", &ParamValue::Str("secret-token".to_string()), true)
            .await
            .unwrap();

        let fetched = params.get("alice", "api_token").await.unwrap().unwrap();
        assert_eq!(fetched.value, ParamValue::Str("secret-token".to_string()));
        assert!(fetched.is_sensitive);
    }

    #[test]
    fn test_authorize_allows_self_and_admin() {
        let admins = vec!["root".to_string()];
        assert!(authorize("alice", "alice", &admins));
        assert!(authorize("root", "alice", &admins));
        assert!(!authorize("bob", "alice", &admins));
    }
}
