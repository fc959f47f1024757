//! Agent runners: adapters that own an external agent process and yield its
//! typed messages.
//!
//! A runner spawns its executable with the working directory set to the
//! session's project path, reads stdout as a stream of JSON envelopes, and
//! forwards each as a [`RunnerItem`] in arrival order. Runners never touch
//! the store or the event bus; the worker pool does.

/// Claude Code CLI runner.
pub mod claude_code;
/// Codex CLI runner.
pub mod codex;
mod process;

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::{Provider, ServiceError, ServiceResult};

pub use claude_code::ClaudeCodeRunner;
pub use codex::CodexRunner;

/// Everything a runner needs to drive one prompt.
#[derive(Debug, Clone)]
pub struct RunnerRequest {
    /// Owning session (for logging only).
    pub session_id: Uuid,
    /// Working directory for the agent process.
    pub project_path: PathBuf,
    /// The prompt text.
    pub prompt: String,
    /// Model flag passed through to the executable.
    pub model: Option<String>,
    /// Tools the agent may use without prompting.
    pub allowed_tools: Option<Vec<String>>,
    /// Provider session handle to resume, when known.
    pub resume_session_id: Option<String>,
}

/// One item yielded by a runner's stream.
#[derive(Debug, Clone)]
pub struct RunnerItem {
    /// The raw envelope as emitted by the agent.
    pub message: Value,
    /// Session handle extracted from the envelope, when present.
    pub provider_session_id: Option<String>,
    /// Provider that produced the item.
    pub provider: Provider,
}

/// Producer-paced sequence of runner items. The stream ends when the child
/// exits; a non-zero exit appends a final `error`-typed envelope first.
pub type RunnerStream = mpsc::Receiver<RunnerItem>;

/// Adapter owning one external agent process.
#[async_trait]
pub trait AgentRunner: Send + Sync + std::fmt::Debug {
    /// Which executable this runner drives.
    fn provider(&self) -> Provider;

    /// Spawn the agent and stream its messages. The returned receiver is
    /// lazy and cancellable; dropping it aborts the child.
    async fn execute(&self, request: RunnerRequest) -> ServiceResult<RunnerStream>;

    /// Request cooperative shutdown of the child. Idempotent; effective even
    /// when called before `execute` returns.
    fn abort(&self);
}

/// Constructs the right runner for a provider. The worker pool depends on
/// this seam so tests can inject stub runners.
pub trait RunnerFactory: Send + Sync {
    /// Create a fresh runner for one job.
    ///
    /// # Errors
    ///
    /// Fails when the provider's executable is not configured or missing,
    /// with a message quoting the config option and path.
    fn create(&self, provider: Provider) -> ServiceResult<Arc<dyn AgentRunner>>;
}

/// Production factory spawning real agent executables.
#[derive(Debug, Clone)]
pub struct ProcessRunnerFactory {
    /// Absolute path to the Claude Code executable (`claudeCodePath`).
    pub claude_code_path: Option<PathBuf>,
    /// Absolute path to the Codex executable (`codexPath`).
    pub codex_path: Option<PathBuf>,
    /// Grace period between cooperative stop and forced kill.
    pub graceful_shutdown: Duration,
}

impl RunnerFactory for ProcessRunnerFactory {
    fn create(&self, provider: Provider) -> ServiceResult<Arc<dyn AgentRunner>> {
        match provider {
            Provider::ClaudeCode => {
                let executable = require_executable(
                    "claudeCodePath",
                    self.claude_code_path.as_deref(),
                )?;
                Ok(Arc::new(ClaudeCodeRunner::new(
                    executable,
                    self.graceful_shutdown,
                )))
            }
            Provider::CodexCli => {
                let executable =
                    require_executable("codexPath", self.codex_path.as_deref())?;
                Ok(Arc::new(CodexRunner::new(executable, self.graceful_shutdown)))
            }
        }
    }
}

fn require_executable(
    option: &'static str,
    configured: Option<&std::path::Path>,
) -> ServiceResult<PathBuf> {
    let Some(path) = configured else {
        return Err(ServiceError::TransientRunner {
            message: format!("{option} is not configured"),
        });
    };
    if !path.is_file() {
        return Err(ServiceError::TransientRunner {
            message: format!(
                "{option} does not point at an executable: {path}",
                path = path.display()
            ),
        });
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_reports_missing_configuration() {
        let factory = ProcessRunnerFactory {
            claude_code_path: None,
            codex_path: None,
            graceful_shutdown: Duration::from_secs(5),
        };
        let err = factory.create(Provider::ClaudeCode).unwrap_err();
        assert!(err.to_string().contains("claudeCodePath"));
    }

    #[test]
    fn test_factory_reports_missing_executable_path() {
        let factory = ProcessRunnerFactory {
            claude_code_path: Some(PathBuf::from("/no/such/claude")),
            codex_path: None,
            graceful_shutdown: Duration::from_secs(5),
        };
        let err = factory.create(Provider::ClaudeCode).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("claudeCodePath"));
        assert!(msg.contains("/no/such/claude"));
    }
}
