//! REST API implementation for the Octopus coordinator
//!
//! This module provides the HTTP endpoints that workers and operators use to
//! communicate with the coordinator: task CRUD, execution reporting, worker
//! heartbeats, the per-worker command queue, and the cache/user-parameter
//! surfaces.

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use rusqlite::{params, OptionalExtension};
use shared::{
    api::{
        endpoints, headers, AssignOutcome, AssignResponse, BroadcastCacheRequest,
        CacheEntryResponse, CacheProfileRequest, ClientTasksResponse, CommandsResponse,
        ExecutionResultRequest, ExecutionsQuery, ExecutionsResponse, HeartbeatRequest,
        HeartbeatResponse, RegisterTaskRequest, RegisterTaskResponse, UserParameterRequest,
        UserParameterResponse,
    },
    config::CoordinatorConfig,
    ExecutionStatus, Task, TaskStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::assignment::{AssignmentEngine, PassOutcome};
use crate::cache::CacheStore;
use crate::commands::CommandQueue;
use crate::ledger::ExecutionLedger;
use crate::params::{self, UserParameterStore};
use crate::registry::WorkerRegistry;
use crate::store::Store;

/// Application state shared across all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CoordinatorConfig>,
    pub store: Arc<Mutex<Store>>,
    pub registry: Arc<WorkerRegistry>,
    pub assignment: Arc<AssignmentEngine>,
    pub ledger: Arc<ExecutionLedger>,
    pub cache: Arc<CacheStore>,
    pub commands: Arc<CommandQueue>,
    pub user_params: Arc<UserParameterStore>,
}

impl AppState {
    pub fn new(config: CoordinatorConfig, store: Arc<Mutex<Store>>) -> Self {
        let registry = Arc::new(WorkerRegistry::new(
            store.clone(),
            config.idle_after_seconds,
            config.offline_after_seconds,
        ));
        let assignment = Arc::new(AssignmentEngine::new(store.clone(), registry.clone()));
        let ledger = Arc::new(ExecutionLedger::new(store.clone()));
        let cache = Arc::new(CacheStore::new(store.clone()));
        let commands = Arc::new(CommandQueue::new(store.clone()));
        let user_params = Arc::new(UserParameterStore::new(store.clone()));

        Self {
            config: Arc::new(config),
            store,
            registry,
            assignment,
            ledger,
            cache,
            commands,
            user_params,
        }
    }
}

/// Creates the main API router and defines all the application's routes.
pub fn create_router(state: AppState) -> Router {
    let body_limit_bytes = state.config.http_body_limit_mb * 1024 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route(endpoints::TASKS, post(create_task).get(list_tasks))
        .route("/tasks/{id}", put(update_task).delete(delete_task))
        .route(endpoints::CLIENT_TASKS, get(client_tasks))
        .route(endpoints::EXECUTION_RESULTS, post(post_execution_result))
        .route(endpoints::EXECUTIONS, get(list_executions))
        .route(endpoints::HEARTBEAT, post(heartbeat))
        .route(
            endpoints::COMMANDS,
            get(drain_commands).post(enqueue_command),
        )
        .route(
            endpoints::CACHE_USER_PROFILE,
            get(get_user_profile).post(set_user_profile),
        )
        .route(endpoints::CACHE_BROADCAST, get(list_broadcast_cache))
        .route(endpoints::CACHE_BROADCAST_KEY, post(set_broadcast_cache))
        .route(endpoints::TASKS_ASSIGN, post(trigger_assignment))
        .route("/api/user-params/{username}/{name}", get(get_user_param).post(set_user_param))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "octopus-coordinator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// POST /tasks
async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<RegisterTaskRequest>,
) -> Result<Json<RegisterTaskResponse>, ApiError> {
    let now = shared::utils::current_timestamp();
    let id = format!("task_{}", shared::utils::current_timestamp_millis());

    let task = Task {
        id: id.clone(),
        name: request.name,
        kind: request.kind,
        owner: request.owner,
        plugin: request.plugin,
        action: request.action,
        args: request.args,
        kwargs: request.kwargs,
        interval_seconds: request.interval_seconds,
        end_of_window: request.end_of_window,
        status: TaskStatus::Created,
        result: String::new(),
        created_at: now,
        updated_at: now,
    };

    let owner_str = serde_json::to_value(&task.owner)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .as_str()
        .unwrap_or("ANYONE")
        .to_string();
    let args_json = serde_json::to_string(&task.args).map_err(|e| ApiError::Internal(e.to_string()))?;
    let kwargs_json = serde_json::to_string(&task.kwargs).map_err(|e| ApiError::Internal(e.to_string()))?;

    let mut store = state.store.lock().await;
    let conn = store.get_connection().map_err(|e| ApiError::Store(e.to_string()))?;
    conn.execute(
        "INSERT INTO tasks (id, name, kind, owner, plugin, action, args, kwargs, interval_seconds,
                             end_of_window, status, result, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            task.id,
            task.name,
            kind_str(task.kind),
            owner_str,
            task.plugin,
            task.action,
            args_json,
            kwargs_json,
            task.interval_seconds,
            task.end_of_window,
            TaskStatus::Created.as_str(),
            task.result,
            task.created_at,
            task.updated_at,
        ],
    )
    .map_err(|e| ApiError::Store(e.to_string()))?;

    info!(task_id = %id, "Created task");
    Ok(Json(RegisterTaskResponse { task }))
}

/// GET /tasks
async fn list_tasks(State(state): State<AppState>) -> Result<Json<HashMap<String, Task>>, ApiError> {
    // An assignment pass runs opportunistically on every task-list read.
    if let Err(e) = state.assignment.run_pass(false).await {
        warn!(error = %e, "Opportunistic assignment pass failed");
    }

    let tasks = fetch_tasks(&state, None).await?;
    Ok(Json(tasks.into_iter().map(|t| (t.id.clone(), t)).collect()))
}

/// GET /client-tasks/{hostname}
async fn client_tasks(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
) -> Result<Json<ClientTasksResponse>, ApiError> {
    let tasks = fetch_tasks(&state, Some(&hostname)).await?;
    let assigned: Vec<Task> = tasks
        .into_iter()
        .filter(|t| t.status == TaskStatus::Active)
        .collect();

    Ok(Json(ClientTasksResponse { tasks: assigned }))
}

async fn fetch_tasks(state: &AppState, executor_filter: Option<&str>) -> Result<Vec<Task>, ApiError> {
    let mut store = state.store.lock().await;
    let conn = store.get_connection().map_err(|e| ApiError::Store(e.to_string()))?;

    let sql = "SELECT id, name, kind, owner, plugin, action, args, kwargs, interval_seconds,
                       end_of_window, status, result, created_at, updated_at FROM tasks ORDER BY created_at ASC";
    let mut stmt = conn.prepare(sql).map_err(|e| ApiError::Store(e.to_string()))?;
    let rows = stmt
        .query_map([], row_to_task)
        .map_err(|e| ApiError::Store(e.to_string()))?;

    let mut tasks = Vec::new();
    for row in rows {
        let task = row.map_err(|e| ApiError::Store(e.to_string()))?;
        match executor_filter {
            Some(hostname) => {
                let owner_str = serde_json::to_value(&task.owner).ok().and_then(|v| v.as_str().map(str::to_string));
                let matches = owner_str.as_deref() == Some("ALL")
                    || owner_str.as_deref() == Some(hostname);
                if matches {
                    tasks.push(task);
                }
            }
            None => tasks.push(task),
        }
    }

    Ok(tasks)
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let kind_str: String = row.get(2)?;
    let owner_str: String = row.get(3)?;
    let args_str: String = row.get(6)?;
    let kwargs_str: String = row.get(7)?;
    let status_str: String = row.get(10)?;

    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: if kind_str == "schedule" {
            shared::TaskKind::Schedule
        } else {
            shared::TaskKind::Adhoc
        },
        owner: serde_json::from_value(serde_json::Value::String(owner_str)).unwrap_or(shared::Owner::Anyone),
        plugin: row.get(4)?,
        action: row.get(5)?,
        args: serde_json::from_str(&args_str).unwrap_or_default(),
        kwargs: serde_json::from_str(&kwargs_str).unwrap_or_default(),
        interval_seconds: row.get(8)?,
        end_of_window: row.get(9)?,
        status: match status_str.as_str() {
            "active" => TaskStatus::Active,
            "done" => TaskStatus::Done,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Created,
        },
        result: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn kind_str(kind: shared::TaskKind) -> &'static str {
    match kind {
        shared::TaskKind::Adhoc => "adhoc",
        shared::TaskKind::Schedule => "schedule",
    }
}

/// PUT /tasks/{id}
///
/// Applies the status-guard rule: a patch that would prematurely finalize a
/// recurring task mid-window has its status field dropped before writing.
async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = shared::utils::current_timestamp();
    let mut store = state.store.lock().await;
    let conn = store.get_connection().map_err(|e| ApiError::Store(e.to_string()))?;

    let existing: Option<(String, Option<f64>)> = conn
        .query_row(
            "SELECT kind, end_of_window FROM tasks WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| ApiError::Store(e.to_string()))?;

    let Some((kind, end_of_window)) = existing else {
        return Err(ApiError::NotFound(format!("task {} not found", id)));
    };

    let mut status_patch = patch.get("status").and_then(|v| v.as_str()).map(str::to_string);
    if kind == "schedule" {
        if let (Some(status), Some(eow)) = (&status_patch, end_of_window) {
            if matches!(status.as_str(), "done" | "failed") && now < eow {
                info!(task_id = %id, "Status-guard suppressed premature terminal transition for recurring task");
                status_patch = None;
            }
        }
    }

    if let Some(status) = status_patch {
        conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, now, id],
        )
        .map_err(|e| ApiError::Store(e.to_string()))?;
    }

    if let Some(result) = patch.get("result").and_then(|v| v.as_str()) {
        conn.execute(
            "UPDATE tasks SET result = ?1, updated_at = ?2 WHERE id = ?3",
            params![result, now, id],
        )
        .map_err(|e| ApiError::Store(e.to_string()))?;
    }

    Ok(Json(serde_json::json!({ "success": true })))
}

/// DELETE /tasks/{id}
async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut store = state.store.lock().await;
    let conn = store.get_connection().map_err(|e| ApiError::Store(e.to_string()))?;

    conn.execute("DELETE FROM executions WHERE task_id = ?1", params![id])
        .map_err(|e| ApiError::Store(e.to_string()))?;
    let deleted = conn
        .execute("DELETE FROM tasks WHERE id = ?1", params![id])
        .map_err(|e| ApiError::Store(e.to_string()))?;

    if deleted == 0 {
        return Err(ApiError::NotFound(format!("task {} not found", id)));
    }

    info!(task_id = %id, "Deleted task, cascading to executions");
    Ok(Json(serde_json::json!({ "success": true })))
}

/// POST /api/execution-results
async fn post_execution_result(
    State(state): State<AppState>,
    Json(request): Json<ExecutionResultRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .ledger
        .append(
            &request.execution_id,
            &request.task_id,
            &request.worker,
            request.status,
            &request.result,
        )
        .await
        .map_err(|e| ApiError::Store(e.to_string()))?;

    Ok(Json(serde_json::json!({})))
}

/// GET /api/executions
async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionsQuery>,
) -> Result<Json<ExecutionsResponse>, ApiError> {
    let status = query
        .status
        .as_deref()
        .and_then(ExecutionStatus::parse_tolerant);

    let (executions, total) = state
        .ledger
        .list(
            query.task_id.as_deref(),
            query.worker.as_deref(),
            status,
            query.offset,
            query.limit,
        )
        .await
        .map_err(|e| ApiError::Store(e.to_string()))?;

    Ok(Json(ExecutionsResponse { executions, total }))
}

/// POST /heartbeat
async fn heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    shared::utils::validate_hostname(&request.hostname)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    state
        .registry
        .record_heartbeat(&request.hostname)
        .await
        .map_err(|e| ApiError::Store(e.to_string()))?;

    debug!(hostname = %request.hostname, "Recorded heartbeat");
    Ok(Json(HeartbeatResponse {
        acknowledged_at: shared::utils::current_timestamp(),
    }))
}

/// GET /commands/{hostname}
async fn drain_commands(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
) -> Result<Json<CommandsResponse>, ApiError> {
    let payloads = state
        .commands
        .drain(&hostname)
        .await
        .map_err(|e| ApiError::Store(e.to_string()))?;

    let now = shared::utils::current_timestamp();
    let commands = payloads
        .into_iter()
        .enumerate()
        .map(|(i, payload)| shared::Command {
            id: i as i64,
            hostname: hostname.clone(),
            payload,
            created_at: now,
        })
        .collect();

    Ok(Json(CommandsResponse { commands }))
}

/// POST /commands/{hostname}
async fn enqueue_command(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .commands
        .push(&hostname, &payload)
        .await
        .map_err(|e| ApiError::Store(e.to_string()))?;

    Ok(Json(serde_json::json!({ "status": "queued" })))
}

/// GET /api/cache/user/{name}/profile
async fn get_user_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let requester = header_str(&headers, headers::USERNAME)?;
    if requester != name {
        warn!(requester, target = %name, "Profile access denied: requester mismatch");
        return Err(ApiError::Forbidden("profile owner mismatch".to_string()));
    }

    let value = state
        .cache
        .get(&format!("user:{}", name), "profile")
        .await
        .map_err(|e| ApiError::Store(e.to_string()))?
        .unwrap_or_else(|| serde_json::json!({}));

    Ok(Json(value))
}

/// POST /api/cache/user/{name}/profile
async fn set_user_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CacheProfileRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let requester = header_str(&headers, headers::USERNAME)?;
    if requester != name {
        warn!(requester, target = %name, "Profile write denied: requester mismatch");
        return Err(ApiError::Forbidden("profile owner mismatch".to_string()));
    }

    state
        .cache
        .put(
            &format!("user:{}", name),
            "profile",
            &request.value,
            request.ttl_seconds.map(|t| t as f64),
        )
        .await
        .map_err(|e| ApiError::Store(e.to_string()))?;

    Ok(Json(serde_json::json!({})))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::Unauthorized)
}

/// GET /api/cache/broadcast
async fn list_broadcast_cache(
    State(state): State<AppState>,
) -> Result<Json<HashMap<String, serde_json::Value>>, ApiError> {
    let mut store = state.store.lock().await;
    let conn = store.get_connection().map_err(|e| ApiError::Store(e.to_string()))?;
    let now = shared::utils::current_timestamp();

    let mut stmt = conn
        .prepare("SELECT key, value FROM cache_entries WHERE namespace = 'broadcast' AND (expires_at IS NULL OR expires_at >= ?1)")
        .map_err(|e| ApiError::Store(e.to_string()))?;
    let rows = stmt
        .query_map(params![now], |row| {
            let key: String = row.get(0)?;
            let raw: String = row.get(1)?;
            Ok((key, raw))
        })
        .map_err(|e| ApiError::Store(e.to_string()))?;

    let mut map = HashMap::new();
    for row in rows {
        let (key, raw) = row.map_err(|e| ApiError::Store(e.to_string()))?;
        if let Ok(value) = serde_json::from_str(&raw) {
            map.insert(key, value);
        }
    }

    Ok(Json(map))
}

/// POST /api/cache/broadcast/{key}
async fn set_broadcast_cache(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<BroadcastCacheRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .cache
        .put("broadcast", &key, &request.value, request.ttl_seconds.map(|t| t as f64))
        .await
        .map_err(|e| ApiError::Store(e.to_string()))?;

    Ok(Json(serde_json::json!({})))
}

/// POST /api/tasks/assign
async fn trigger_assignment(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<AssignOutcome>, ApiError> {
    let force = body.get("force").and_then(|v| v.as_bool()).unwrap_or(false);

    let outcome = state
        .assignment
        .run_pass(force)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let response = match outcome {
        PassOutcome::Ran(stats) => AssignOutcome::Assigned(AssignResponse {
            total: stats.total as u64,
            unassigned_before: stats.unassigned_before as u64,
            assigned_after: stats.assigned_after as u64,
            active_workers: stats.active_workers as u64,
        }),
        PassOutcome::Locked => AssignOutcome::Locked,
        PassOutcome::RateLimited { retry_after_seconds } => {
            AssignOutcome::RateLimited { retry_after_seconds }
        }
    };

    Ok(Json(response))
}

/// GET /api/user-params/{username}/{name}
async fn get_user_param(
    State(state): State<AppState>,
    Path((username, name)): Path<(String, String)>,
    Query(query): Query<UserParameterQuery>,
) -> Result<Json<UserParameterResponse>, ApiError> {
    if !params::authorize(&query.requester, &username, &state.config.admin_users) {
        return Err(ApiError::Forbidden(
            "requester is not the owner or an admin".to_string(),
        ));
    }

    let parameter = state
        .user_params
        .get(&username, &name)
        .await
        .map_err(|e| ApiError::Store(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("parameter {}/{} not found", username, name)))?;

    Ok(Json(UserParameterResponse { parameter }))
}

#[derive(Debug, serde::Deserialize)]
struct UserParameterQuery {
    requester: String,
}

/// POST /api/user-params/{username}/{name}
async fn set_user_param(
    State(state): State<AppState>,
    Path((username, name)): Path<(String, String)>,
    Json(request): Json<SetUserParamRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !params::authorize(&request.requester, &username, &state.config.admin_users) {
        return Err(ApiError::Forbidden(
            "requester is not the owner or an admin".to_string(),
        ));
    }

    state
        .user_params
        .set(&username, &name, &request.value, request.is_sensitive)
        .await
        .map_err(|e| ApiError::Store(e.to_string()))?;

    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, serde::Deserialize)]
struct SetUserParamRequest {
    requester: String,
    value: shared::ParamValue,
    #[serde(default)]
    is_sensitive: bool,
}

/// Custom error types for the coordinator API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal server error: {0}")]
    Internal(String),
    #[error("Store error: {0}")]
    Store(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "Forbidden"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
            ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Store Error"),
        };

        if status.is_server_error() {
            error!(error = %self, "API request failed");
        }

        let body = Json(serde_json::json!({
            "error": error_message,
            "details": self.to_string()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod api_tests;
