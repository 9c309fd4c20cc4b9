//! End-to-end orchestrator flows over the scripted engine.

use std::time::{Duration, Instant};

use session_relay::models::event::UpdateEvent;
use session_relay::models::session::{SubmissionState, SubmitRequest};
use session_relay::models::task::TaskStatus;
use session_relay::AppError;

use super::test_helpers::{
    collect_events, done, eventually, test_orchestrator, test_settings, text, tool_completed,
    tool_started, Step,
};

fn request(message: &str, dir: &str) -> SubmitRequest {
    SubmitRequest {
        message: message.into(),
        working_directory: dir.into(),
        ..SubmitRequest::default()
    }
}

fn last_text(event: &UpdateEvent) -> Option<&str> {
    match event {
        UpdateEvent::Error { text } => Some(text),
        _ => None,
    }
}

#[tokio::test]
async fn submit_streams_session_first_and_done_last() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![
        text("file_a.rs "),
        tool_started("c1"),
        tool_completed("c1"),
        text("file_b.rs"),
        done(),
    ]);

    let stream = orchestrator
        .submit(request("list files", "/r"))
        .await
        .expect("submit");
    let session_id = stream.session_id.clone();
    let task_id = stream.task_id.clone();
    assert!(stream.is_new);

    let events = collect_events(stream).await;
    assert_eq!(
        events.first(),
        Some(&UpdateEvent::Session {
            session_id: session_id.clone()
        })
    );
    assert_eq!(events.last(), Some(&UpdateEvent::Done));

    let task = orchestrator.task(&task_id).await.expect("task stored");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.session_id.as_deref(), Some(session_id.as_str()));
    assert_eq!(task.messages.len(), 2);
    let assistant = &task.messages[1];
    assert_eq!(assistant.content, "file_a.rs file_b.rs");
    assert!(!assistant.is_streaming());
    let record = &assistant.metadata.tool_calls["c1"];
    assert!(record.result.is_some());
    assert!(record.end_time.is_some());
}

#[tokio::test]
async fn exhausted_stream_is_closed_with_done() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![text("partial")]);

    let stream = orchestrator.submit(request("go", "/r")).await.expect("submit");
    let task_id = stream.task_id.clone();
    let events = collect_events(stream).await;

    assert_eq!(events.last(), Some(&UpdateEvent::Done));
    let task = orchestrator.task(&task_id).await.expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.messages[1].content, "partial");
}

#[tokio::test]
async fn second_request_supersedes_in_flight_submission() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![text("working"), Step::Hang]);
    engine.push_script(vec![text("fresh"), done()]);

    let mut first = orchestrator.submit(request("one", "/r")).await.expect("first");
    let session_id = first.session_id.clone();
    let first_task = first.task_id.clone();
    // `session` is pushed only after the relay has attached its sink.
    let frame = first.frames.recv().await.expect("session frame");
    assert!(frame.contains(r#""type":"session""#));

    let started = Instant::now();
    let mut again = request("two", "/r");
    again.session_id = Some(session_id.clone());
    let second = orchestrator.submit(again).await.expect("second");
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(second.session_id, session_id);
    assert!(!second.is_new);

    let first_events = collect_events(first).await;
    assert_eq!(
        first_events.last().and_then(last_text),
        Some("superseded by a new request")
    );
    assert!(engine.cancels() >= 1);

    let second_events = collect_events(second).await;
    assert_eq!(second_events.last(), Some(&UpdateEvent::Done));

    for _ in 0..200 {
        let task = orchestrator.task(&first_task).await.expect("task");
        if task.status == TaskStatus::Failed {
            assert_eq!(task.error.as_deref(), Some("superseded by a new request"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("superseded task never failed");
}

#[tokio::test]
async fn busy_engine_clears_session() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.set_busy(true);

    let mut req = request("go", "/r");
    req.session_id = Some("s-stuck".into());
    let err = orchestrator.submit(req).await.expect_err("conflict");

    assert!(matches!(err, AppError::SessionCleared(_)));
    assert!(orchestrator.registry().get("s-stuck").is_none());
    assert!(orchestrator.sessions().is_empty());
}

#[tokio::test]
async fn silent_engine_is_failed_as_hung() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![text("start"), Step::Hang]);

    let stream = orchestrator.submit(request("go", "/r")).await.expect("submit");
    let task_id = stream.task_id.clone();
    let events = collect_events(stream).await;

    let message = events.last().and_then(last_text).expect("error event");
    assert!(message.starts_with("stream hung"), "{message}");
    assert!(engine.cancels() >= 1);

    let task = orchestrator.task(&task_id).await.expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some(message));
    assert_eq!(task.messages[1].content, "start");
}

#[tokio::test]
async fn hard_timeout_ends_an_active_stream() {
    let mut settings = test_settings();
    settings.heartbeat.hard_timeout = Duration::from_millis(300);
    let (orchestrator, engine, _store) = test_orchestrator(settings);
    let mut script = Vec::new();
    for _ in 0..40 {
        script.push(text("."));
        script.push(Step::Pause(Duration::from_millis(30)));
    }
    engine.push_script(script);

    let stream = orchestrator.submit(request("go", "/r")).await.expect("submit");
    let events = collect_events(stream).await;

    let message = events.last().and_then(last_text).expect("error event");
    assert!(message.starts_with("stream timed out"), "{message}");
}

#[tokio::test]
async fn kill_terminates_attached_stream() {
    let (orchestrator, engine, store) = test_orchestrator(test_settings());
    engine.push_script(vec![Step::Hang]);

    let mut stream = orchestrator.submit(request("go", "/r")).await.expect("submit");
    let session_id = stream.session_id.clone();
    let task_id = stream.task_id.clone();
    stream.frames.recv().await.expect("session frame");

    let killed = orchestrator.kill(Some(&session_id)).expect("kill");
    assert_eq!(killed, vec![session_id.clone()]);

    let events = collect_events(stream).await;
    assert_eq!(
        events.last().and_then(last_text),
        Some("session killed by request")
    );
    assert!(orchestrator
        .sessions()
        .iter()
        .all(|s| s.session_id != session_id));

    eventually(|| {
        store
            .writes()
            .iter()
            .any(|t| t.id == task_id && t.status == TaskStatus::Failed)
    })
    .await;
}

#[tokio::test]
async fn kill_unknown_session_is_not_found() {
    let (orchestrator, _engine, _store) = test_orchestrator(test_settings());
    let err = orchestrator.kill(Some("nope")).expect_err("missing");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn kill_all_returns_every_session() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![done()]);
    engine.push_script(vec![done()]);
    let a = orchestrator.submit(request("a", "/a")).await.expect("a");
    let b = orchestrator.submit(request("b", "/b")).await.expect("b");
    let mut expected = vec![a.session_id.clone(), b.session_id.clone()];
    expected.sort();
    collect_events(a).await;
    collect_events(b).await;

    assert_eq!(orchestrator.kill(None).expect("kill all"), expected);
    assert!(orchestrator.sessions().is_empty());
}

#[tokio::test]
async fn session_is_reused_only_for_the_same_directory() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    for _ in 0..3 {
        engine.push_script(vec![done()]);
    }

    let first = orchestrator.submit(request("a", "/r")).await.expect("first");
    let session_id = first.session_id.clone();
    collect_events(first).await;
    let session = orchestrator.registry().get(&session_id).expect("live");
    eventually(|| !session.is_submitting()).await;

    let mut same = request("b", "/r");
    same.session_id = Some(session_id.clone());
    let reused = orchestrator.submit(same).await.expect("reuse");
    assert_eq!(reused.session_id, session_id);
    assert!(!reused.is_new);
    collect_events(reused).await;
    eventually(|| !session.is_submitting()).await;

    let mut other = request("c", "/elsewhere");
    other.session_id = Some(session_id.clone());
    let moved = orchestrator.submit(other).await.expect("other dir");
    assert_ne!(moved.session_id, session_id);
    assert!(moved.is_new);
    collect_events(moved).await;

    let original = orchestrator.registry().get(&session_id).expect("still live");
    assert_eq!(original.working_directory().to_str(), Some("/r"));
}

#[tokio::test]
async fn unknown_session_id_is_adopted() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![done()]);

    let mut req = request("go", "/r");
    req.session_id = Some("client-chosen".into());
    let stream = orchestrator.submit(req).await.expect("submit");
    assert_eq!(stream.session_id, "client-chosen");
    assert!(stream.is_new);
    collect_events(stream).await;
}

#[tokio::test]
async fn checkpoints_only_grow_the_assistant_message() {
    let (orchestrator, engine, store) = test_orchestrator(test_settings());
    let mut script: Vec<Step> = (0..25).map(|_| text("x")).collect();
    script.push(done());
    engine.push_script(script);

    let stream = orchestrator.submit(request("go", "/r")).await.expect("submit");
    let task_id = stream.task_id.clone();
    collect_events(stream).await;

    let contents: Vec<String> = store
        .writes()
        .into_iter()
        .filter(|t| t.id == task_id)
        .map(|t| t.messages[1].content.clone())
        .collect();
    // Opening write, every 10 events, then the forced write on `done`.
    assert_eq!(contents.len(), 4);
    for pair in contents.windows(2) {
        assert!(pair[1].starts_with(&pair[0]));
    }
    assert_eq!(contents.last().map(String::len), Some(25));
}

#[tokio::test]
async fn undecodable_event_does_not_end_the_stream() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![
        text("a"),
        Step::Fail(AppError::Serialization("bad line".into())),
        text("b"),
        done(),
    ]);

    let stream = orchestrator.submit(request("go", "/r")).await.expect("submit");
    let task_id = stream.task_id.clone();
    let events = collect_events(stream).await;

    assert!(events.iter().any(|e| matches!(
        e,
        UpdateEvent::Error { text } if text == "event could not be delivered: bad line"
    )));
    assert_eq!(events.last(), Some(&UpdateEvent::Done));
    let task = orchestrator.task(&task_id).await.expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.messages[1].content, "ab");
}

#[tokio::test]
async fn transport_fault_fails_the_task() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![
        text("a"),
        Step::Fail(AppError::Engine("pipe closed".into())),
    ]);

    let stream = orchestrator.submit(request("go", "/r")).await.expect("submit");
    let task_id = stream.task_id.clone();
    let events = collect_events(stream).await;

    assert_eq!(
        events.last().and_then(last_text),
        Some("connection lost: pipe closed")
    );
    let task = orchestrator.task(&task_id).await.expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("connection lost: pipe closed"));
}

#[tokio::test]
async fn missing_credential_refuses_submission() {
    let mut settings = test_settings();
    settings.missing_credential = Some("engine credential is not set".into());
    let (orchestrator, engine, _store) = test_orchestrator(settings);

    let err = orchestrator
        .submit(request("go", "/r"))
        .await
        .expect_err("refused");
    assert!(matches!(err, AppError::Config(_)));
    assert_eq!(engine.submissions(), 0);
    assert!(orchestrator.sessions().is_empty());
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let (orchestrator, _engine, _store) = test_orchestrator(test_settings());

    for req in [
        request("", "/r"),
        request("go", ""),
        request("go", "relative/path"),
    ] {
        let err = orchestrator.submit(req).await.expect_err("invalid");
        assert!(matches!(err, AppError::Validation(_)), "{err}");
    }
}

#[tokio::test]
async fn completed_task_rejects_new_messages() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![done()]);

    let stream = orchestrator.submit(request("go", "/r")).await.expect("submit");
    let task_id = stream.task_id.clone();
    collect_events(stream).await;

    let mut again = request("more", "/r");
    again.task_id = Some(task_id);
    let err = orchestrator.submit(again).await.expect_err("rejected");
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn failed_task_can_be_retried() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![Step::Fail(AppError::Engine("gone".into()))]);
    engine.push_script(vec![text("ok"), done()]);

    let stream = orchestrator.submit(request("go", "/r")).await.expect("submit");
    let session_id = stream.session_id.clone();
    let task_id = stream.task_id.clone();
    collect_events(stream).await;
    let session = orchestrator.registry().get(&session_id).expect("live");
    eventually(|| !session.is_submitting()).await;

    let mut retry = request("again", "/r");
    retry.task_id = Some(task_id.clone());
    retry.session_id = Some(session_id);
    let stream = orchestrator.submit(retry).await.expect("retry");
    assert_eq!(stream.task_id, task_id);
    collect_events(stream).await;

    let task = orchestrator.task(&task_id).await.expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.error, None);
    assert_eq!(task.messages.len(), 4);
    assert!(task.messages.iter().all(|m| !m.is_streaming()));
}

#[tokio::test]
async fn launch_failure_is_recorded_on_the_task() {
    let (orchestrator, engine, store) = test_orchestrator(test_settings());
    engine.set_busy(true);

    let err = orchestrator
        .submit(request("go", "/r"))
        .await
        .expect_err("cleared");
    assert!(matches!(err, AppError::SessionCleared(_)));

    let last = store.writes().pop().expect("task written");
    assert_eq!(last.status, TaskStatus::Failed);
    assert!(last.error.is_some());
}

#[tokio::test]
async fn listing_reports_submitting_sessions() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![Step::Hang]);

    let mut stream = orchestrator.submit(request("go", "/r")).await.expect("submit");
    stream.frames.recv().await.expect("session frame");
    tokio::time::sleep(Duration::from_millis(80)).await;

    let sessions = orchestrator.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].submission_state, SubmissionState::Submitting);
    assert!(sessions[0].stuck);

    orchestrator.kill(None).expect("kill");
}

#[tokio::test]
async fn shutdown_stops_every_stream() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![Step::Hang]);

    let mut stream = orchestrator.submit(request("go", "/r")).await.expect("submit");
    stream.frames.recv().await.expect("session frame");

    orchestrator.shutdown(Duration::from_secs(1)).await;
    let events = collect_events(stream).await;
    assert_eq!(
        events.last().and_then(last_text),
        Some("server shutting down")
    );
    assert!(orchestrator.sessions().is_empty());
}

#[tokio::test]
async fn superseding_a_stuck_engine_clears_the_session() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![text("working"), Step::Hang]);

    let mut first = orchestrator.submit(request("one", "/r")).await.expect("first");
    let session_id = first.session_id.clone();
    first.frames.recv().await.expect("session frame");

    engine.set_busy(true);
    let mut again = request("two", "/r");
    again.session_id = Some(session_id.clone());
    let err = orchestrator.submit(again).await.expect_err("cleared");
    assert!(matches!(err, AppError::SessionCleared(_)), "{err}");

    let first_events = collect_events(first).await;
    assert_eq!(
        first_events.last().and_then(last_text),
        Some("superseded by a new request")
    );
    assert!(orchestrator.registry().get(&session_id).is_none());
    assert!(orchestrator
        .sessions()
        .iter()
        .all(|s| s.session_id != session_id));
}

#[tokio::test]
async fn task_written_by_another_session_is_refused() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![
        text("A1"),
        Step::Pause(Duration::from_millis(150)),
        text("A2"),
        done(),
    ]);
    engine.push_script(vec![text("B1"), done()]);

    let mut owner = request("first", "/r");
    owner.task_id = Some("t-shared".into());
    let mut first = orchestrator.submit(owner).await.expect("first");
    let owner_session = first.session_id.clone();
    first.frames.recv().await.expect("session frame");

    let mut intruder = request("second", "/r");
    intruder.task_id = Some("t-shared".into());
    let err = orchestrator.submit(intruder).await.expect_err("refused");
    assert!(matches!(err, AppError::SessionBusy(_)), "{err}");

    // Same session id, different directory: a fresh session would be
    // created, so it is refused and removed again.
    let mut moved = request("third", "/elsewhere");
    moved.session_id = Some(owner_session.clone());
    moved.task_id = Some("t-shared".into());
    let err = orchestrator.submit(moved).await.expect_err("refused");
    assert!(matches!(err, AppError::SessionBusy(_)), "{err}");

    assert_eq!(engine.submissions(), 1);
    assert_eq!(orchestrator.sessions().len(), 1);

    let events = collect_events(first).await;
    assert_eq!(events.last(), Some(&UpdateEvent::Done));
    let task = orchestrator.task("t-shared").await.expect("task");
    let contents: Vec<&str> = task.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "A1A2"]);
    assert_eq!(task.session_id.as_deref(), Some(owner_session.as_str()));
}

#[tokio::test]
async fn same_session_takes_over_its_running_task() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![text("A1"), Step::Hang]);
    engine.push_script(vec![text("B1"), done()]);

    let mut owner = request("one", "/r");
    owner.task_id = Some("t-1".into());
    let mut first = orchestrator.submit(owner).await.expect("first");
    let session_id = first.session_id.clone();
    first.frames.recv().await.expect("session frame");
    first.frames.recv().await.expect("first text");

    let mut again = request("two", "/r");
    again.session_id = Some(session_id);
    again.task_id = Some("t-1".into());
    let second = orchestrator.submit(again).await.expect("takeover");

    collect_events(first).await;
    let events = collect_events(second).await;
    assert_eq!(events.last(), Some(&UpdateEvent::Done));

    let task = orchestrator.task("t-1").await.expect("task");
    let contents: Vec<&str> = task.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["one", "A1", "two", "B1"]);
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.messages.iter().all(|m| !m.is_streaming()));
}

#[tokio::test]
async fn rejected_task_leaves_the_live_stream_alone() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    engine.push_script(vec![done()]);
    engine.push_script(vec![Step::Hang]);

    let finished = orchestrator.submit(request("old", "/r")).await.expect("old");
    let completed_task = finished.task_id.clone();
    let finished_session = finished.session_id.clone();
    collect_events(finished).await;
    orchestrator.kill(Some(&finished_session)).expect("kill");

    let mut live = orchestrator.submit(request("live", "/r")).await.expect("live");
    let session_id = live.session_id.clone();
    live.frames.recv().await.expect("session frame");

    let mut on_live = request("more", "/r");
    on_live.session_id = Some(session_id.clone());
    on_live.task_id = Some(completed_task.clone());
    let err = orchestrator.submit(on_live).await.expect_err("rejected");
    assert!(matches!(err, AppError::Validation(_)), "{err}");

    let mut anonymous = request("more", "/r");
    anonymous.task_id = Some(completed_task);
    let err = orchestrator.submit(anonymous).await.expect_err("rejected");
    assert!(matches!(err, AppError::Validation(_)), "{err}");

    assert_eq!(engine.cancels(), 0);
    assert!(live.frames.try_recv().is_err());
    let sessions = orchestrator.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, session_id);
    assert_eq!(sessions[0].submission_state, SubmissionState::Submitting);

    orchestrator.kill(None).expect("kill");
}

#[tokio::test]
async fn undecodable_events_count_as_activity() {
    let (orchestrator, engine, _store) = test_orchestrator(test_settings());
    let mut script = vec![text("a")];
    // Roughly twice the 250ms inactivity limit of garbled output.
    for _ in 0..5 {
        script.push(Step::Pause(Duration::from_millis(100)));
        script.push(Step::Fail(AppError::Serialization("bad line".into())));
    }
    script.push(text("b"));
    script.push(done());
    engine.push_script(script);

    let stream = orchestrator.submit(request("go", "/r")).await.expect("submit");
    let task_id = stream.task_id.clone();
    let events = collect_events(stream).await;

    assert_eq!(events.last(), Some(&UpdateEvent::Done));
    assert_eq!(engine.cancels(), 0);
    let task = orchestrator.task(&task_id).await.expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.messages[1].content, "ab");
}
