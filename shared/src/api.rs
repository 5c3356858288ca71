//! API types and structures for coordinator/worker communication
//!
//! This module defines the request and response types used by the REST API
//! endpoints between the worker and the coordinator.

use crate::model::{Command, Execution, ExecutionStatus, Owner, Task, UserParameter};
use serde::{Deserialize, Serialize};

/// Generic API request wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest<T> {
    pub data: T,
    pub timestamp_utc: String,
}

/// Generic API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error_message: String) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(error_message),
        }
    }
}

/// Request body for POST /tasks — register a new task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterTaskRequest {
    pub name: String,
    pub kind: crate::model::TaskKind,
    pub owner: Owner,
    pub plugin: String,
    pub action: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub end_of_window: Option<f64>,
}

/// Response body for POST /tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterTaskResponse {
    pub task: Task,
}

/// Response body for GET /client-tasks/<hostname> — active tasks assigned to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTasksResponse {
    pub tasks: Vec<Task>,
}

/// Request body for POST /api/execution-results
///
/// `execution_id` is computed once by the worker at the start of a firing
/// (`shared::utils::make_execution_id`) and reused for both the initial
/// `running` post and the terminal post that follows it, so the coordinator
/// upserts a single row instead of appending a second one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResultRequest {
    pub execution_id: String,
    pub task_id: String,
    pub worker: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub result: String,
}

/// Response body for GET /api/executions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionsResponse {
    pub executions: Vec<Execution>,
    pub total: u64,
}

/// Query parameters accepted by GET /api/executions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionsQuery {
    pub task_id: Option<String>,
    pub worker: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_page_size")]
    pub limit: u64,
}

fn default_page_size() -> u64 {
    100
}

/// Request body for POST /heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub hostname: String,
}

/// Response body for POST /heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub acknowledged_at: f64,
}

/// Response body for GET /commands/<hostname>
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsResponse {
    pub commands: Vec<Command>,
}

/// Request body for POST /api/cache/user/<name>/profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheProfileRequest {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// Request body for POST /api/cache/broadcast and /api/cache/broadcast/<key>
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastCacheRequest {
    pub value: serde_json::Value,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// Response body for a cache read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryResponse {
    pub key: String,
    pub value: serde_json::Value,
}

/// Request body for user-parameter get/set endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserParameterRequest {
    pub requester: String,
    pub username: String,
    pub name: String,
}

/// Response body carrying a single user parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserParameterResponse {
    pub parameter: UserParameter,
}

/// Response body for POST /api/tasks/assign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignResponse {
    pub total: u64,
    pub unassigned_before: u64,
    pub assigned_after: u64,
    pub active_workers: u64,
}

/// Returned instead of `AssignResponse` when the assignment pass is skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AssignOutcome {
    Assigned(AssignResponse),
    Locked,
    RateLimited { retry_after_seconds: f64 },
}

/// HTTP headers used for authentication and metadata
pub mod headers {
    pub const USERNAME: &str = "X-Username";
    pub const CLIENT_ID: &str = "X-Client-Id";
    pub const CONTENT_TYPE: &str = "Content-Type";
}

/// API endpoint paths
pub mod endpoints {
    pub const TASKS: &str = "/tasks";
    pub const CLIENT_TASKS: &str = "/client-tasks/{hostname}";
    pub const EXECUTION_RESULTS: &str = "/api/execution-results";
    pub const EXECUTIONS: &str = "/api/executions";
    pub const HEARTBEAT: &str = "/heartbeat";
    pub const COMMANDS: &str = "/commands/{hostname}";
    pub const CACHE_USER_PROFILE: &str = "/api/cache/user/{name}/profile";
    pub const CACHE_BROADCAST: &str = "/api/cache/broadcast";
    pub const CACHE_BROADCAST_KEY: &str = "/api/cache/broadcast/{key}";
    pub const TASKS_ASSIGN: &str = "/api/tasks/assign";
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod api_tests;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_helpers() {
        let success_response = ApiResponse::success("test data");
        assert_eq!(success_response.status, "success");
        assert_eq!(success_response.data, Some("test data"));
        assert_eq!(success_response.error, None);

        let error_response: ApiResponse<()> = ApiResponse::error("test error".to_string());
        assert_eq!(error_response.status, "error");
        assert_eq!(error_response.data, None);
        assert_eq!(error_response.error, Some("test error".to_string()));
    }

    #[test]
    fn test_register_task_request_round_trip() {
        let req = RegisterTaskRequest {
            name: "nightly-backup".to_string(),
            kind: crate::model::TaskKind::Schedule,
            owner: Owner::Anyone,
            plugin: "backup".to_string(),
            action: "run".to_string(),
            args: vec![],
            kwargs: serde_json::Map::new(),
            interval_seconds: Some(3600),
            end_of_window: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        let round_tripped: RegisterTaskRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(round_tripped.name, "nightly-backup");
        assert_eq!(round_tripped.owner, Owner::Anyone);
    }

    #[test]
    fn test_assign_outcome_tagging() {
        let locked = AssignOutcome::Locked;
        let json = serde_json::to_string(&locked).unwrap();
        assert_eq!(json, "{\"status\":\"locked\"}");
    }
}
