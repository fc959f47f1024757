//! End-to-end worker pool scenarios with scripted stub runners.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::{
    StubFactory, StubStep, TestBackend, backend, backend_with, crash_script, happy_script,
    wait_until,
};
use pokecode::core::{Job, JobData, JobStatus, MessageType, Provider};
use pokecode::services::EnqueueJob;
use pokecode::worker::{WorkerConfig, WorkerPool};

fn worker_for(
    b: &TestBackend,
    factory: Arc<StubFactory>,
    shutdown: CancellationToken,
) -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(
        Arc::clone(&b.sessions),
        Arc::clone(&b.messages),
        Arc::clone(&b.queue),
        factory,
        WorkerConfig {
            concurrency: 2,
            polling_interval: Duration::from_millis(25),
        },
        shutdown,
    ))
}

async fn post_prompt(b: &TestBackend, session_id: Uuid, provider: Provider) -> Job {
    b.messages
        .save_user_message(session_id, "hello")
        .await
        .unwrap();
    b.queue
        .enqueue(EnqueueJob {
            session_id,
            provider,
            prompt_id: Uuid::new_v4().to_string(),
            data: JobData {
                project_path: PathBuf::from("/tmp/app"),
                prompt: "hello".to_owned(),
                model: Some("sonnet".to_owned()),
                allowed_tools: None,
            },
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_happy_path_prompt() {
    let b = backend().await;
    let session = b.create_session(Provider::ClaudeCode).await;
    let mut sub = b.bus.subscribe(session.id);

    let job = post_prompt(&b, session.id, session.provider).await;

    let shutdown = CancellationToken::new();
    let worker = worker_for(&b, StubFactory::new(vec![happy_script("prov-1")]), shutdown);
    worker.spawn();

    let store = Arc::clone(&b.store);
    wait_until(Duration::from_secs(10), || {
        let store = Arc::clone(&store);
        async move { store.get_job(job.id).await.unwrap().status == JobStatus::Completed }
    })
    .await;

    let session = b.store.get_session(session.id).await.unwrap();
    assert_eq!(session.message_count, 4); // user + system + assistant + result
    assert_eq!(session.token_count, 10);
    assert!(!session.is_working);
    assert_eq!(session.current_job_id, None);
    assert_eq!(session.last_job_status.as_deref(), Some("completed"));
    assert_eq!(session.provider_session_id.as_deref(), Some("prov-1"));

    // Live subscribers saw the transcript in append order, then the done
    // event.
    let kinds: Vec<String> = {
        let mut kinds = Vec::new();
        while kinds.last().map(String::as_str) != Some("session-done") {
            let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .expect("event stream stalled")
                .expect("bus closed early");
            kinds.push(event.kind().to_owned());
        }
        kinds
    };
    assert_eq!(
        kinds,
        vec![
            "message-appended", // user
            "message-appended", // system init
            "message-appended", // assistant
            "message-appended", // result
            "session-done",
        ]
    );

    worker.shutdown().await;
}

#[tokio::test]
async fn test_conflict_on_double_enqueue() {
    let b = backend().await;
    let session = b.create_session(Provider::ClaudeCode).await;

    let shutdown = CancellationToken::new();
    let script = vec![StubStep::Emit(serde_json::json!({
        "type": "assistant",
        "session_id": "prov-2",
        "content": [{"type": "text", "text": "working..."}]
    })), StubStep::HangUntilAbort];
    let worker = worker_for(&b, StubFactory::new(vec![script]), shutdown);
    worker.spawn();

    let job = post_prompt(&b, session.id, session.provider).await;

    let sessions = Arc::clone(&b.sessions);
    let session_id = session.id;
    wait_until(Duration::from_secs(5), || {
        let sessions = Arc::clone(&sessions);
        async move { sessions.get_session(session_id).await.unwrap().is_working }
    })
    .await;

    let worker_probe = Arc::clone(&worker);
    let prompt_id = job.prompt_id.clone();
    wait_until(Duration::from_secs(5), move || {
        let worker = Arc::clone(&worker_probe);
        let prompt_id = prompt_id.clone();
        async move { worker.is_running(&prompt_id) }
    })
    .await;

    // Second prompt while the first is mid-flight.
    let err = b
        .queue
        .enqueue(EnqueueJob {
            session_id: session.id,
            provider: session.provider,
            prompt_id: Uuid::new_v4().to_string(),
            data: JobData {
                project_path: PathBuf::from("/tmp/app"),
                prompt: "again".to_owned(),
                model: None,
                allowed_tools: None,
            },
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");

    b.queue.cancel_session_jobs(session.id).await.unwrap();
    worker.shutdown().await;
}

#[tokio::test]
async fn test_user_cancellation_mid_flight() {
    let b = backend().await;
    let session = b.create_session(Provider::ClaudeCode).await;
    let mut sub = b.bus.subscribe(session.id);

    let shutdown = CancellationToken::new();
    let script = vec![StubStep::Emit(serde_json::json!({
        "type": "assistant",
        "session_id": "prov-3",
        "content": [{"type": "text", "text": "starting work"}]
    })), StubStep::HangUntilAbort];
    let worker = worker_for(&b, StubFactory::new(vec![script]), shutdown);
    worker.spawn();

    let job = post_prompt(&b, session.id, session.provider).await;

    let sessions = Arc::clone(&b.sessions);
    let session_id = session.id;
    wait_until(Duration::from_secs(5), || {
        let sessions = Arc::clone(&sessions);
        async move { sessions.get_session(session_id).await.unwrap().is_working }
    })
    .await;

    b.queue.cancel_session_jobs(session.id).await.unwrap();

    // The cancellation checker fires within 2 s and the worker settles.
    let store = Arc::clone(&b.store);
    wait_until(Duration::from_secs(10), || {
        let store = Arc::clone(&store);
        async move {
            let session = store.get_session(session_id).await.unwrap();
            !session.is_working && session.last_job_status.as_deref() == Some("cancelled")
        }
    })
    .await;

    assert_eq!(
        b.store.get_job(job.id).await.unwrap().status,
        JobStatus::Cancelled
    );

    // The final appended message carries the cancellation text.
    let envelopes = b.messages.get_raw_messages(session.id).await.unwrap();
    let last = envelopes.last().unwrap();
    assert!(
        last.to_string().contains("Operation was cancelled by user"),
        "missing cancellation message in {last}"
    );

    // The live stream ends with session-done(cancelled).
    let mut last_kind = String::new();
    let mut done_payload = serde_json::Value::Null;
    while last_kind != "session-done" {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("event stream stalled")
            .expect("bus closed early");
        last_kind = event.kind().to_owned();
        done_payload = event.payload();
    }
    assert_eq!(done_payload["status"], "cancelled");

    worker.shutdown().await;
}

#[tokio::test]
async fn test_runner_crash_retries_then_succeeds() {
    let b = backend_with(250, 2).await;
    let session = b.create_session(Provider::ClaudeCode).await;

    let shutdown = CancellationToken::new();
    let worker = worker_for(
        &b,
        StubFactory::new(vec![crash_script(), happy_script("prov-4")]),
        shutdown,
    );
    worker.spawn();

    let job = post_prompt(&b, session.id, session.provider).await;

    let store = Arc::clone(&b.store);
    wait_until(Duration::from_secs(10), || {
        let store = Arc::clone(&store);
        async move { store.get_job(job.id).await.unwrap().status == JobStatus::Completed }
    })
    .await;

    let settled = b.store.get_job(job.id).await.unwrap();
    assert_eq!(settled.attempts, 2);

    // Exactly one error message from the crashed attempt, plus the full
    // successful transcript.
    let page = b
        .messages
        .get_messages(pokecode::services::GetMessagesParams {
            session_id: session.id,
            after: None,
            limit: Some(100),
        })
        .await
        .unwrap();
    let error_count = page
        .messages
        .iter()
        .filter(|m| m.message_type == MessageType::Error)
        .count();
    assert_eq!(error_count, 1);
    let result_count = page
        .messages
        .iter()
        .filter(|m| m.message_type == MessageType::Result)
        .count();
    assert_eq!(result_count, 1);

    let session = b.store.get_session(session.id).await.unwrap();
    assert!(!session.is_working);
    assert_eq!(session.last_job_status.as_deref(), Some("completed"));

    worker.shutdown().await;
}

#[tokio::test]
async fn test_single_attempt_crash_fails_job() {
    let b = backend_with(60_000, 1).await;
    let session = b.create_session(Provider::CodexCli).await;
    let mut sub = b.bus.subscribe(session.id);

    let shutdown = CancellationToken::new();
    let worker = worker_for(&b, StubFactory::new(vec![crash_script()]), shutdown);
    worker.spawn();

    let job = post_prompt(&b, session.id, session.provider).await;

    let store = Arc::clone(&b.store);
    wait_until(Duration::from_secs(10), || {
        let store = Arc::clone(&store);
        async move { store.get_job(job.id).await.unwrap().status == JobStatus::Failed }
    })
    .await;

    let settled = b.store.get_job(job.id).await.unwrap();
    assert_eq!(settled.attempts, 1);
    assert!(settled.error.as_deref().unwrap().contains("exit status"));

    let session_row = b.store.get_session(session.id).await.unwrap();
    assert_eq!(session_row.last_job_status.as_deref(), Some("failed"));

    let mut done_payload = serde_json::Value::Null;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("event stream stalled")
            .expect("bus closed early");
        if event.kind() == "session-done" {
            done_payload = event.payload();
            break;
        }
    }
    assert_eq!(done_payload["status"], "failed");

    worker.shutdown().await;
}
