use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::process::{ChildSpec, spawn_streaming};
use super::{AgentRunner, RunnerRequest, RunnerStream};
use crate::core::{Provider, ServiceResult};

/// Runner for the Codex CLI.
///
/// Spawns `codex exec --json` in the session's project directory. Codex
/// emits the same NDJSON envelope shape the parser normalizes.
#[derive(Debug)]
pub struct CodexRunner {
    executable: PathBuf,
    graceful_shutdown: Duration,
    cancel: CancellationToken,
}

impl CodexRunner {
    /// Create a runner around the configured executable.
    #[must_use]
    pub fn new(executable: PathBuf, graceful_shutdown: Duration) -> Self {
        Self {
            executable,
            graceful_shutdown,
            cancel: CancellationToken::new(),
        }
    }

    fn build_args(request: &RunnerRequest) -> Vec<String> {
        let mut args = vec!["exec".to_owned(), "--json".to_owned()];
        if let Some(model) = &request.model {
            args.push("--model".to_owned());
            args.push(model.clone());
        }
        if let Some(resume) = &request.resume_session_id {
            args.push("--session-id".to_owned());
            args.push(resume.clone());
        }
        args.push(request.prompt.clone());
        args
    }
}

#[async_trait]
impl AgentRunner for CodexRunner {
    fn provider(&self) -> Provider {
        Provider::CodexCli
    }

    async fn execute(&self, request: RunnerRequest) -> ServiceResult<RunnerStream> {
        tracing::info!(
            session_id = %request.session_id,
            project_path = %request.project_path.display(),
            model = request.model.as_deref(),
            "starting codex run"
        );
        spawn_streaming(
            ChildSpec {
                program: self.executable.clone(),
                args: Self::build_args(&request),
                cwd: request.project_path.clone(),
                provider: Provider::CodexCli,
                graceful_shutdown: self.graceful_shutdown,
            },
            self.cancel.clone(),
        )
    }

    fn abort(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_build_args_prompt_last() {
        let request = RunnerRequest {
            session_id: Uuid::new_v4(),
            project_path: PathBuf::from("/tmp/app"),
            prompt: "refactor".to_owned(),
            model: Some("o4-mini".to_owned()),
            allowed_tools: None,
            resume_session_id: None,
        };
        let args = CodexRunner::build_args(&request);
        assert_eq!(args[0], "exec");
        assert_eq!(args[1], "--json");
        assert_eq!(args.last().unwrap(), "refactor");
        let model_at = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[model_at + 1], "o4-mini");
    }
}
