//! Shared child-process streaming for agent runners.
//!
//! The child's stdout is read line by line as NDJSON; each JSON line becomes
//! a [`RunnerItem`]. Stderr is collected into a bounded tail for error
//! reporting. Cancellation sends the cooperative stop signal first and
//! escalates to a hard kill after the grace period.

use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{RunnerItem, RunnerStream};
use crate::core::{Provider, ServiceError, ServiceResult};

/// Largest stderr tail carried on a synthetic error envelope.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Buffered items between the reader task and the worker.
const STREAM_BUFFER: usize = 32;

/// How one agent child should be spawned.
pub(super) struct ChildSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub provider: Provider,
    pub graceful_shutdown: Duration,
}

/// Spawn the child and stream its stdout envelopes.
pub(super) fn spawn_streaming(
    spec: ChildSpec,
    cancel: CancellationToken,
) -> ServiceResult<RunnerStream> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| ServiceError::TransientRunner {
        message: format!(
            "failed to spawn {program}: {e}",
            program = spec.program.display()
        ),
    })?;

    let stdout = child.stdout.take().ok_or_else(|| ServiceError::Internal(
        anyhow::anyhow!("child stdout was not piped"),
    ))?;
    let stderr = child.stderr.take().ok_or_else(|| ServiceError::Internal(
        anyhow::anyhow!("child stderr was not piped"),
    ))?;

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        drive_child(child, stdout, stderr, spec, tx, cancel).await;
    });
    Ok(rx)
}

async fn drive_child(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    spec: ChildSpec,
    tx: mpsc::Sender<RunnerItem>,
    cancel: CancellationToken,
) {
    let stderr_task = tokio::spawn(read_stderr_tail(stderr));
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                terminate(&mut child, spec.graceful_shutdown).await;
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let Ok(message) = serde_json::from_str::<Value>(trimmed) else {
                        tracing::debug!(
                            provider = %spec.provider,
                            "skipping non-JSON agent output line"
                        );
                        continue;
                    };
                    let provider_session_id = message
                        .get("session_id")
                        .and_then(Value::as_str)
                        .map(str::to_owned);
                    let item = RunnerItem {
                        message,
                        provider_session_id,
                        provider: spec.provider,
                    };
                    // The worker paces consumption; a dropped receiver means
                    // the job is gone, so stop the child.
                    if tx.send(item).await.is_err() {
                        terminate(&mut child, spec.graceful_shutdown).await;
                        let _ = stderr_task.await;
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(provider = %spec.provider, error = %e, "agent stdout read failed");
                    break;
                }
            }
        }
    }

    let status = tokio::select! {
        () = cancel.cancelled() => {
            terminate(&mut child, spec.graceful_shutdown).await;
            child.wait().await
        }
        status = child.wait() => status,
    };
    let tail = stderr_task.await.unwrap_or_default();

    // A cancelled run ends without a synthetic error; the worker appends its
    // own cancellation record.
    if cancel.is_cancelled() {
        return;
    }

    let failure = match status {
        Ok(status) if status.success() => None,
        Ok(status) => Some(format!("agent exited with {status}")),
        Err(e) => Some(format!("failed to await agent exit: {e}")),
    };
    if let Some(description) = failure {
        tracing::warn!(provider = %spec.provider, %description, "agent run failed");
        let item = RunnerItem {
            message: serde_json::json!({
                "type": "error",
                "message": description,
                "stderr": tail,
            }),
            provider_session_id: None,
            provider: spec.provider,
        };
        let _ = tx.send(item).await;
    }
}

/// Collect stderr, keeping only the last [`STDERR_TAIL_BYTES`].
async fn read_stderr_tail(stderr: tokio::process::ChildStderr) -> String {
    let mut reader = BufReader::new(stderr);
    let mut tail: Vec<u8> = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    let start = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..start);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

/// Cooperative stop, then a hard kill after the grace period.
async fn terminate(child: &mut Child, graceful: Duration) {
    send_interrupt(child);
    if tokio::time::timeout(graceful, child.wait()).await.is_err() {
        tracing::warn!("agent ignored cooperative stop, killing");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(unix)]
fn send_interrupt(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Ok(pid) = i32::try_from(pid) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGINT);
        }
    }
}

#[cfg(not(unix))]
fn send_interrupt(_child: &Child) {
    // No cooperative signal off Unix; the grace timeout escalates to kill.
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_spec(script: &str) -> ChildSpec {
        ChildSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_owned(), script.to_owned()],
            cwd: std::env::temp_dir(),
            provider: Provider::ClaudeCode,
            graceful_shutdown: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_streams_json_lines_in_order() {
        let spec = sh_spec(
            r#"printf '%s\n' '{"type":"system","subtype":"init","session_id":"s1"}' '{"type":"result","subtype":"success","session_id":"s1"}'"#,
        );
        let mut rx = spawn_streaming(spec, CancellationToken::new()).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.message["type"], "system");
        assert_eq!(first.provider_session_id.as_deref(), Some("s1"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.message["type"], "result");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_non_json_lines_are_skipped() {
        let spec = sh_spec(r#"printf '%s\n' 'warming up' '{"type":"result"}'"#);
        let mut rx = spawn_streaming(spec, CancellationToken::new()).unwrap();
        let item = rx.recv().await.unwrap();
        assert_eq!(item.message["type"], "result");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_nonzero_exit_yields_error_item() {
        let spec = sh_spec(r#"echo 'something broke' >&2; exit 3"#);
        let mut rx = spawn_streaming(spec, CancellationToken::new()).unwrap();
        let item = rx.recv().await.unwrap();
        assert_eq!(item.message["type"], "error");
        assert!(
            item.message["stderr"]
                .as_str()
                .unwrap()
                .contains("something broke")
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_stops_child_without_error_item() {
        let cancel = CancellationToken::new();
        let spec = sh_spec("sleep 30");
        let mut rx = spawn_streaming(spec, cancel.clone()).unwrap();

        cancel.cancel();
        let started = std::time::Instant::now();
        assert!(rx.recv().await.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_program_is_transient_error() {
        let spec = ChildSpec {
            program: PathBuf::from("/no/such/agent"),
            args: vec![],
            cwd: std::env::temp_dir(),
            provider: Provider::CodexCli,
            graceful_shutdown: Duration::from_millis(100),
        };
        let err = spawn_streaming(spec, CancellationToken::new()).unwrap_err();
        assert!(matches!(err, ServiceError::TransientRunner { .. }));
    }
}
