use chrono::Utc;

use session_relay::models::session::{
    KillRequest, SessionSummary, SubmissionState, SubmitRequest,
};
use session_relay::models::task::{Task, TaskStatus};
use session_relay::AppError;

#[test]
fn submit_request_decodes_camel_case() {
    let request: SubmitRequest = serde_json::from_str(
        r#"{"message":"hi","workingDirectory":"/r","sessionId":"s-1","taskId":"t-1"}"#,
    )
    .expect("decodes");
    assert_eq!(request.working_directory, "/r");
    assert_eq!(request.requested_session(), Some("s-1"));
    assert_eq!(request.requested_task(), Some("t-1"));
    assert!(request.validate().is_ok());
}

#[test]
fn blank_ids_count_as_absent() {
    let request = SubmitRequest {
        message: "hi".into(),
        working_directory: "/r".into(),
        session_id: Some("  ".into()),
        task_id: Some(String::new()),
    };
    assert_eq!(request.requested_session(), None);
    assert_eq!(request.requested_task(), None);
}

#[test]
fn validation_names_the_missing_field() {
    let missing_message = SubmitRequest {
        working_directory: "/r".into(),
        ..SubmitRequest::default()
    };
    assert_eq!(
        missing_message.validate(),
        Err(AppError::Validation("message is required".into()))
    );

    let relative = SubmitRequest {
        message: "hi".into(),
        working_directory: "repo".into(),
        ..SubmitRequest::default()
    };
    assert!(matches!(
        relative.validate(),
        Err(AppError::Validation(msg)) if msg.contains("absolute")
    ));
}

#[test]
fn kill_request_session_is_optional() {
    let all: KillRequest = serde_json::from_str("{}").expect("decodes");
    assert_eq!(all.session_id, None);
    let one: KillRequest = serde_json::from_str(r#"{"sessionId":"s-1"}"#).expect("decodes");
    assert_eq!(one.session_id.as_deref(), Some("s-1"));
}

#[test]
fn summary_serializes_camel_case() {
    let summary = SessionSummary {
        session_id: "s-1".into(),
        working_directory: "/r".into(),
        last_access_time: Utc::now(),
        submission_state: SubmissionState::Submitting,
        last_event_time: None,
        stuck: true,
    };
    let json = serde_json::to_value(&summary).expect("encode");
    assert_eq!(json["sessionId"], "s-1");
    assert_eq!(json["submissionState"], "submitting");
    assert_eq!(json["stuck"], true);
    assert!(json.get("lastEventTime").is_none());
}

#[test]
fn task_status_only_moves_forward() {
    let mut task = Task::new(None, "/r".into());
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.can_transition_to(TaskStatus::Running));
    assert!(!task.can_transition_to(TaskStatus::Completed));

    task.status = TaskStatus::Running;
    assert!(task.can_transition_to(TaskStatus::Completed));
    assert!(task.can_transition_to(TaskStatus::Failed));

    task.status = TaskStatus::Completed;
    assert!(!task.can_transition_to(TaskStatus::Failed));
    assert!(!task.can_transition_to(TaskStatus::Running));
}

#[test]
fn task_round_trips_through_json_with_camel_case() {
    let mut task = Task::new(Some("t-1".into()), "/r".into());
    task.token_count = 7;
    let json = serde_json::to_value(&task).expect("encode");
    assert_eq!(json["repoPath"], "/r");
    assert_eq!(json["tokenCount"], 7);
    assert_eq!(json["status"], "pending");
    let back: Task = serde_json::from_value(json).expect("decode");
    assert_eq!(back, task);
}

#[test]
fn only_unfinished_tasks_accept_messages() {
    let mut task = Task::new(Some("t-1".into()), "/r".into());
    for status in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Failed] {
        task.status = status;
        assert!(task.ensure_accepts_messages().is_ok());
    }
    task.status = TaskStatus::Completed;
    assert_eq!(
        task.ensure_accepts_messages(),
        Err(AppError::Validation(
            "task t-1 is completed and cannot accept new messages".into()
        ))
    );
}
