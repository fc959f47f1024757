//! Shared test utilities for integration tests.
#![allow(dead_code)]

use serde_json::{Value, json};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use pokecode::bus::EventBus;
use pokecode::core::{Provider, ServiceError, ServiceResult, Session};
use pokecode::runners::{AgentRunner, RunnerFactory, RunnerItem, RunnerRequest, RunnerStream};
use pokecode::services::{MessageService, QueueService, SessionService};
use pokecode::store::Store;

/// Everything a test needs to drive the backend without HTTP.
pub struct TestBackend {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub sessions: Arc<SessionService>,
    pub messages: Arc<MessageService>,
    pub queue: Arc<QueueService>,
    /// Temp dir doubling as the session project path.
    pub project_dir: tempfile::TempDir,
}

/// Backend with default queue tuning (60 s lease, one attempt).
pub async fn backend() -> TestBackend {
    backend_with(60_000, 1).await
}

/// Backend with explicit lease TTL and attempt cap.
pub async fn backend_with(lease_ttl_ms: u64, max_attempts: i64) -> TestBackend {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let bus = Arc::new(EventBus::new(256));
    let sessions = Arc::new(SessionService::new(Arc::clone(&store)));
    let messages = Arc::new(MessageService::new(Arc::clone(&store), Arc::clone(&bus), true));
    let queue = Arc::new(QueueService::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        lease_ttl_ms,
        max_attempts,
    ));
    TestBackend {
        store,
        bus,
        sessions,
        messages,
        queue,
        project_dir: tempfile::tempdir().unwrap(),
    }
}

impl TestBackend {
    /// Create a session rooted at the test project dir.
    pub async fn create_session(&self, provider: Provider) -> Session {
        self.sessions
            .create_session(self.project_dir.path().to_path_buf(), provider)
            .await
            .unwrap()
    }
}

/// One step in a scripted stub run.
#[derive(Debug, Clone)]
pub enum StubStep {
    /// Yield an envelope.
    Emit(Value),
    /// Sleep before the next step.
    Wait(Duration),
    /// Block until the runner is aborted, then end the stream.
    HangUntilAbort,
}

/// A scripted runner standing in for a real agent process.
#[derive(Debug)]
pub struct StubRunner {
    steps: Vec<StubStep>,
    provider: Provider,
    cancel: CancellationToken,
}

#[async_trait]
impl AgentRunner for StubRunner {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn execute(&self, _request: RunnerRequest) -> ServiceResult<RunnerStream> {
        let (tx, rx) = mpsc::channel(16);
        let steps = self.steps.clone();
        let provider = self.provider;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            for step in steps {
                match step {
                    StubStep::Emit(message) => {
                        let provider_session_id = message
                            .get("session_id")
                            .and_then(Value::as_str)
                            .map(str::to_owned);
                        let item = RunnerItem {
                            message,
                            provider_session_id,
                            provider,
                        };
                        if tx.send(item).await.is_err() {
                            return;
                        }
                    }
                    StubStep::Wait(duration) => tokio::time::sleep(duration).await,
                    StubStep::HangUntilAbort => {
                        cancel.cancelled().await;
                        return;
                    }
                }
                if cancel.is_cancelled() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    fn abort(&self) {
        self.cancel.cancel();
    }
}

/// Factory handing out one scripted run per lease, in order.
pub struct StubFactory {
    scripts: Mutex<VecDeque<Vec<StubStep>>>,
}

impl StubFactory {
    pub fn new(scripts: Vec<Vec<StubStep>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
        })
    }
}

impl RunnerFactory for StubFactory {
    fn create(&self, provider: Provider) -> ServiceResult<Arc<dyn AgentRunner>> {
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ServiceError::TransientRunner {
                message: "stub factory exhausted".to_owned(),
            })?;
        Ok(Arc::new(StubRunner {
            steps,
            provider,
            cancel: CancellationToken::new(),
        }))
    }
}

/// A minimal successful transcript: init, one text reply, success result.
pub fn happy_script(provider_session: &str) -> Vec<StubStep> {
    vec![
        StubStep::Emit(json!({
            "type": "system",
            "subtype": "init",
            "session_id": provider_session,
            "cwd": "/tmp/app",
            "tools": ["Bash"],
            "model": "sonnet"
        })),
        StubStep::Emit(json!({
            "type": "assistant",
            "session_id": provider_session,
            "message": {
                "content": [{"type": "text", "text": "hi"}],
                "usage": {"input_tokens": 7, "output_tokens": 3}
            }
        })),
        StubStep::Emit(json!({
            "type": "result",
            "subtype": "success",
            "session_id": provider_session,
            "duration_ms": 10,
            "is_error": false,
            "num_turns": 1
        })),
    ]
}

/// A crashed run: the synthetic error envelope a real runner emits on a
/// non-zero exit.
pub fn crash_script() -> Vec<StubStep> {
    vec![StubStep::Emit(json!({
        "type": "error",
        "message": "agent exited with exit status: 1",
        "stderr": "fatal: something broke"
    }))]
}

/// Poll until `predicate` returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
