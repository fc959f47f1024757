use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::process::{ChildSpec, spawn_streaming};
use super::{AgentRunner, RunnerRequest, RunnerStream};
use crate::core::{Provider, ServiceResult};

/// Runner for the Claude Code CLI.
///
/// Spawns `claude -p <prompt> --output-format stream-json --verbose` in the
/// session's project directory and streams the NDJSON output.
#[derive(Debug)]
pub struct ClaudeCodeRunner {
    executable: PathBuf,
    graceful_shutdown: Duration,
    cancel: CancellationToken,
}

impl ClaudeCodeRunner {
    /// Create a runner around the configured executable.
    #[must_use]
    pub fn new(executable: PathBuf, graceful_shutdown: Duration) -> Self {
        Self {
            executable,
            graceful_shutdown,
            cancel: CancellationToken::new(),
        }
    }

    /// Build the argument vector for one request.
    fn build_args(request: &RunnerRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_owned(),
            request.prompt.clone(),
            "--output-format".to_owned(),
            "stream-json".to_owned(),
            "--verbose".to_owned(),
        ];
        if let Some(model) = &request.model {
            args.push("--model".to_owned());
            args.push(model.clone());
        }
        if let Some(tools) = &request.allowed_tools {
            if !tools.is_empty() {
                args.push("--allowedTools".to_owned());
                args.push(tools.join(","));
            }
        }
        if let Some(resume) = &request.resume_session_id {
            args.push("--resume".to_owned());
            args.push(resume.clone());
        }
        args
    }
}

#[async_trait]
impl AgentRunner for ClaudeCodeRunner {
    fn provider(&self) -> Provider {
        Provider::ClaudeCode
    }

    async fn execute(&self, request: RunnerRequest) -> ServiceResult<RunnerStream> {
        tracing::info!(
            session_id = %request.session_id,
            project_path = %request.project_path.display(),
            model = request.model.as_deref(),
            "starting claude-code run"
        );
        spawn_streaming(
            ChildSpec {
                program: self.executable.clone(),
                args: Self::build_args(&request),
                cwd: request.project_path.clone(),
                provider: Provider::ClaudeCode,
                graceful_shutdown: self.graceful_shutdown,
            },
            self.cancel.clone(),
        )
    }

    fn abort(&self) {
        self.cancel.cancel();
    }
}
