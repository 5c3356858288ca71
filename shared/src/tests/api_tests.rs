//! Tests for API types and structures

use crate::api::{ApiResponse, AssignOutcome, RegisterTaskRequest};
use crate::model::{Owner, TaskKind};

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
        kind: TaskKind::Schedule,
        owner: Owner::All,
        plugin: "backup".to_string(),
        action: "run".to_string(),
        args: vec![],
        kwargs: serde_json::Map::new(),
        interval_seconds: Some(3600),
        end_of_window: None,
    };
    let json = serde_json::to_string(&req).unwrap();
    let round_tripped: RegisterTaskRequest = serde_json::from_str(&json).unwrap();
    assert_eq!(round_tripped.owner, Owner::All);
    assert_eq!(round_tripped.interval_seconds, Some(3600));
}

#[test]
fn test_assign_outcome_rate_limited_serialization() {
    let outcome = AssignOutcome::RateLimited {
        retry_after_seconds: 1.5,
    };
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["status"], "rate_limited");
    assert_eq!(json["retry_after_seconds"], 1.5);
}
