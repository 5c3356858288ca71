//! Core data model for the Octopus task orchestration system
//!
//! These types mirror the schema described by the task/execution/worker/
//! command/user-parameter data model: timestamps are seconds-since-epoch
//! floating point values, matching what the Store persists.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Who a task is assigned to.
///
/// Serializes as a plain string at the wire/storage boundary: a concrete
/// hostname, or one of the sentinels `ANYONE` / `ALL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    /// Assigned to one specific worker hostname.
    Worker(String),
    /// Assigned to exactly one worker, chosen uniformly at random among
    /// the online workers at assignment time.
    Anyone,
    /// Assigned to every online worker.
    All,
}

impl Owner {
    pub fn as_str(&self) -> &str {
        match self {
            Owner::Worker(hostname) => hostname.as_str(),
            Owner::Anyone => "ANYONE",
            Owner::All => "ALL",
        }
    }
}

impl Serialize for Owner {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Owner {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OwnerVisitor;

        impl Visitor<'_> for OwnerVisitor {
            type Value = Owner;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a worker hostname, \"ANYONE\", or \"ALL\"")
            }

            fn visit_str<E>(self, value: &str) -> Result<Owner, E>
            where
                E: de::Error,
            {
                Ok(match value {
                    "ANYONE" => Owner::Anyone,
                    "ALL" => Owner::All,
                    hostname => Owner::Worker(hostname.to_string()),
                })
            }
        }

        deserializer.deserialize_str(OwnerVisitor)
    }
}

/// Whether a task fires once or on a recurring schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Adhoc,
    Schedule,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Active,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Active => "active",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

/// A unit of work registered with the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub kind: TaskKind,
    pub owner: Owner,
    /// Plugin name to invoke.
    pub plugin: String,
    /// Action exposed by the plugin's action table.
    pub action: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    /// Interval in seconds between firings, only meaningful for `Schedule` tasks.
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    /// Optional end of the recurring window; once passed the task is terminal.
    #[serde(default)]
    pub end_of_window: Option<f64>,
    pub status: TaskStatus,
    /// Last-known result string; advisory only, the Execution Ledger is authoritative.
    #[serde(default)]
    pub result: String,
    pub created_at: f64,
    pub updated_at: f64,
}

/// Outcome of a single plugin invocation, tolerant of legacy status synonyms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Parse a status string, accepting legacy synonyms the original
    /// implementation wrote (`completed`, `done`, `error`).
    pub fn parse_tolerant(raw: &str) -> Option<Self> {
        match raw {
            "running" | "pending" => Some(ExecutionStatus::Running),
            "success" | "completed" | "done" => Some(ExecutionStatus::Success),
            "failed" | "error" => Some(ExecutionStatus::Failed),
            "cancelled" | "canceled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// A single firing of a task on a worker.
///
/// `execution_id` follows the `<task_id>_<worker>_<ms>` format used by the
/// source system's execution ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub execution_id: String,
    pub task_id: String,
    pub worker: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub result: String,
    pub created_at: f64,
    pub updated_at: f64,
}

/// Liveness classification derived from time since last heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Idle,
    Offline,
}

/// A registered worker process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    pub hostname: String,
    pub last_heartbeat: f64,
    pub registered_at: f64,
}

/// A queued command awaiting delivery to a specific worker, FIFO per hostname.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub id: i64,
    pub hostname: String,
    pub payload: serde_json::Value,
    pub created_at: f64,
}

/// The value held by a user parameter; the wire/storage representation is
/// tagged so the Store can round-trip the original scalar type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Json(serde_json::Value),
}

/// A per-user key/value parameter, optionally obfuscated at rest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserParameter {
    pub username: String,
    pub name: String,
    pub value: ParamValue,
    #[serde(default)]
    pub is_sensitive: bool,
}
