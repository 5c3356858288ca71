//! Shared data structures and utilities for the Octopus task orchestration system
//!
//! This crate contains common types, configuration structures, and utilities
//! used by both the coordinator and worker components.

pub mod api;
pub mod config;
pub mod defaults;
pub mod model;
pub mod utils;

// Re-export commonly used types for convenience
pub use api::{ApiRequest, ApiResponse};
pub use config::{CoordinatorConfig, WorkerConfig};
pub use model::{
    Command, Execution, ExecutionStatus, Owner, ParamValue, Task, TaskKind, TaskStatus,
    UserParameter, Worker, WorkerStatus,
};
pub use utils::calculate_checksum;

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the orchestration system
#[derive(Debug, thiserror::Error)]
pub enum OctopusError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Assignment error: {0}")]
    Assignment(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_imports() {
        // Smoke test to ensure all modules can be imported together.
    }
}
