//! Coordinator HTTP client
//!
//! Wraps a shared `reqwest::Client` with the small set of calls a worker
//! makes against the coordinator: syncing assigned tasks, posting execution
//! results, heartbeating, and draining the command queue.

use anyhow::{Context, Result};
use shared::api::{
    endpoints, headers, ClientTasksResponse, CommandsResponse, ExecutionResultRequest,
    HeartbeatRequest, HeartbeatResponse,
};
use shared::{ExecutionStatus, Task};
use tracing::{debug, warn};

/// Talks to a single coordinator over HTTP, retrying transient failures with
/// exponential backoff.
#[derive(Clone)]
pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
    hostname: String,
    retry_base_delay_ms: u64,
    retry_max_delay_ms: u64,
}

impl CoordinatorClient {
    pub fn new(
        base_url: String,
        hostname: String,
        timeout_seconds: u64,
        retry_base_delay_ms: u64,
        retry_max_delay_ms: u64,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to create coordinator HTTP client")?;

        Ok(Self {
            http,
            base_url,
            hostname,
            retry_base_delay_ms,
            retry_max_delay_ms,
        })
    }

    /// Fetches the tasks currently assigned to this worker.
    pub async fn fetch_assigned_tasks(&self) -> Result<Vec<Task>> {
        let url = format!(
            "{}/client-tasks/{}",
            self.base_url.trim_end_matches('/'),
            self.hostname
        );

        let response = self
            .with_retry(|| self.http.get(&url).send())
            .await
            .with_context(|| format!("Failed to fetch assigned tasks from {}", url))?;

        let parsed: ClientTasksResponse = response
            .json()
            .await
            .context("Failed to parse client-tasks response")?;

        Ok(parsed.tasks)
    }

    /// Reports the outcome of an execution back to the coordinator. Pass the
    /// same `execution_id` for a firing's initial `running` post and its
    /// later terminal post so the coordinator updates one row instead of
    /// appending a second.
    pub async fn post_execution_result(
        &self,
        execution_id: &str,
        task_id: &str,
        status: ExecutionStatus,
        result: &str,
    ) -> Result<()> {
        let url = format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            endpoints::EXECUTION_RESULTS
        );

        let request = ExecutionResultRequest {
            execution_id: execution_id.to_string(),
            task_id: task_id.to_string(),
            worker: self.hostname.clone(),
            status,
            result: result.to_string(),
        };

        self.with_retry(|| self.http.post(&url).json(&request).send())
            .await
            .with_context(|| format!("Failed to post execution result to {}", url))?;

        Ok(())
    }

    /// Sends a heartbeat, marking this worker online for the coordinator's
    /// liveness classification.
    pub async fn send_heartbeat(&self) -> Result<HeartbeatResponse> {
        let url = format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            endpoints::HEARTBEAT
        );

        let request = HeartbeatRequest {
            hostname: self.hostname.clone(),
        };

        let response = self
            .with_retry(|| self.http.post(&url).json(&request).send())
            .await
            .with_context(|| format!("Failed to send heartbeat to {}", url))?;

        response
            .json()
            .await
            .context("Failed to parse heartbeat response")
    }

    /// Drains any commands queued for this worker.
    pub async fn drain_commands(&self) -> Result<Vec<serde_json::Value>> {
        let url = format!(
            "{}/commands/{}",
            self.base_url.trim_end_matches('/'),
            self.hostname
        );

        let response = self
            .with_retry(|| self.http.get(&url).send())
            .await
            .with_context(|| format!("Failed to drain commands from {}", url))?;

        let parsed: CommandsResponse = response
            .json()
            .await
            .context("Failed to parse commands response")?;

        Ok(parsed.commands.into_iter().map(|c| c.payload).collect())
    }

    /// Applies a status/result patch to a task record after a firing
    /// completes. The coordinator's status-guard rule may suppress the
    /// status change for a recurring task mid-window.
    pub async fn update_task(&self, task_id: &str, status: &str, result: &str) -> Result<()> {
        let url = format!(
            "{}/tasks/{}",
            self.base_url.trim_end_matches('/'),
            task_id
        );

        let patch = serde_json::json!({ "status": status, "result": result });

        self.with_retry(|| self.http.put(&url).json(&patch).send())
            .await
            .with_context(|| format!("Failed to update task {} at {}", task_id, url))?;

        Ok(())
    }

    /// Writes `value` under `key` in the coordinator's shared cache, used by
    /// plugin `cache` data operations (§4.6).
    pub async fn set_cache(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl_seconds: Option<u64>,
    ) -> Result<()> {
        let url = format!(
            "{}/api/cache/broadcast/{}",
            self.base_url.trim_end_matches('/'),
            key
        );

        let request = shared::api::BroadcastCacheRequest { value, ttl_seconds };

        self.with_retry(|| self.http.post(&url).json(&request).send())
            .await
            .with_context(|| format!("Failed to write cache key '{}' to {}", key, url))?;

        Ok(())
    }

    /// Fetches and obfuscation-decodes a user parameter owned by `username`,
    /// authenticated as `requester`.
    pub async fn get_user_profile(&self, username: &str) -> Result<serde_json::Value> {
        let url = format!(
            "{}/api/cache/user/{}/profile",
            self.base_url.trim_end_matches('/'),
            username
        );

        let response = self
            .with_retry(|| {
                self.http
                    .get(&url)
                    .header(headers::USERNAME, username)
                    .send()
            })
            .await
            .with_context(|| format!("Failed to fetch user profile from {}", url))?;

        response
            .json()
            .await
            .context("Failed to parse user profile response")
    }

    /// Retries a fallible request a bounded number of times with exponential
    /// backoff, matching the coordinator-unreachable handling the teacher
    /// used for its queued-metrics retry loop.
    async fn with_retry<F, Fut>(&self, make_request: F) -> Result<reqwest::Response>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = reqwest::Result<reqwest::Response>>,
    {
        const MAX_ATTEMPTS: u32 = 5;

        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            match make_request().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!(
                        "coordinator returned {}: {}",
                        status,
                        body
                    ));
                }
                Err(e) => last_err = Some(anyhow::anyhow!(e)),
            }

            if attempt + 1 < MAX_ATTEMPTS {
                let delay_ms = shared::utils::calculate_backoff_delay(
                    attempt,
                    self.retry_base_delay_ms,
                    self.retry_max_delay_ms,
                );
                debug!(attempt, delay_ms, "Retrying coordinator request");
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
        }

        let err = last_err.unwrap_or_else(|| anyhow::anyhow!("request failed with no response"));
        warn!("Coordinator request exhausted retries: {}", err);
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = CoordinatorClient::new(
            "http://127.0.0.1:8080".to_string(),
            "worker-01".to_string(),
            30,
            5000,
            60000,
        );
        assert!(client.is_ok());
    }
}
