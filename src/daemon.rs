//! Daemon runtime files and ops plumbing: pid file with an advisory lock,
//! a JSON descriptor for `status`, and signal-based `stop`.

use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;

/// Contents of `~/.pokecode/daemon.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonDescriptor {
    /// Server process id.
    pub pid: u32,
    /// Bound host.
    pub host: String,
    /// Bound port.
    pub port: u16,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Crate version.
    pub version: String,
}

/// Holds the exclusive pid-file lock for the lifetime of the server.
#[derive(Debug)]
pub struct PidLock {
    file: File,
    pid_path: PathBuf,
    descriptor_path: PathBuf,
}

impl PidLock {
    /// Acquire the pid lock and write the runtime files.
    ///
    /// # Errors
    ///
    /// Fails when another instance already holds the lock or the state
    /// directory cannot be written.
    pub fn acquire(config: &Config) -> anyhow::Result<Self> {
        let pid_path = Config::pid_path();
        if let Some(parent) = pid_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&pid_path)
            .with_context(|| format!("failed to open {}", pid_path.display()))?;
        FileExt::try_lock_exclusive(&file)
            .context("another pokecode instance is already running")?;

        let pid = std::process::id();
        writeln!(file, "{pid}")?;
        file.flush()?;

        let descriptor = DaemonDescriptor {
            pid,
            host: config.host.clone(),
            port: config.port,
            started_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        };
        let descriptor_path = Config::daemon_descriptor_path();
        std::fs::write(&descriptor_path, serde_json::to_string_pretty(&descriptor)?)
            .with_context(|| format!("failed to write {}", descriptor_path.display()))?;

        Ok(Self {
            file,
            pid_path,
            descriptor_path,
        })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.pid_path);
        let _ = std::fs::remove_file(&self.descriptor_path);
    }
}

/// Read the daemon descriptor, if one exists.
///
/// # Errors
///
/// Fails when the descriptor exists but cannot be parsed.
pub fn read_descriptor() -> anyhow::Result<Option<DaemonDescriptor>> {
    let path = Config::daemon_descriptor_path();
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Some(serde_json::from_str(&text).with_context(|| {
        format!("invalid daemon descriptor at {}", path.display())
    })?))
}

/// Whether the recorded process is still alive.
#[must_use]
pub fn is_running(descriptor: &DaemonDescriptor) -> bool {
    process_alive(descriptor.pid)
}

/// Signal the recorded daemon to stop and wait for it to exit.
///
/// # Errors
///
/// Fails when no daemon is recorded or it does not exit within the timeout.
pub fn stop(timeout: Duration) -> anyhow::Result<()> {
    let Some(descriptor) = read_descriptor()? else {
        anyhow::bail!("no running daemon recorded");
    };
    if !process_alive(descriptor.pid) {
        // Stale descriptor from an unclean shutdown.
        let _ = std::fs::remove_file(Config::daemon_descriptor_path());
        let _ = std::fs::remove_file(Config::pid_path());
        anyhow::bail!("daemon (pid {pid}) is not running", pid = descriptor.pid);
    }

    send_terminate(descriptor.pid)?;
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if !process_alive(descriptor.pid) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    anyhow::bail!(
        "daemon (pid {pid}) did not exit within {timeout:?}",
        pid = descriptor.pid
    )
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> anyhow::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).context("pid out of range")?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).context("failed to signal daemon")?;
    Ok(())
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> anyhow::Result<()> {
    anyhow::bail!("stop is only supported on unix")
}
