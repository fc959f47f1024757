//! Configuration loading.
//!
//! Options live in `~/.pokecode/config.json`; a small, enumerated set of
//! environment variables (`POKECODE_PORT`, `POKECODE_HOST`,
//! `POKECODE_LOG_LEVEL`, `POKECODE_DATABASE_PATH`) overrides the file.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Directory name under the home directory holding all persisted state.
const BASE_DIR_NAME: &str = ".pokecode";

/// Base state directory (`~/.pokecode`).
#[must_use]
pub fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(BASE_DIR_NAME)
}

/// Effective configuration (file + env overrides + defaults).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,
    /// HTTP bind address.
    pub host: String,
    /// Default tracing filter level.
    pub log_level: String,
    /// SQLite file location.
    pub database_path: PathBuf,
    /// Enable write-ahead logging.
    #[serde(rename = "databaseWAL")]
    pub database_wal: bool,
    /// SQLite page cache, in pages.
    pub database_cache_size: i64,
    /// Absolute path to the Claude Code executable. Required for the
    /// `claude-code` provider.
    pub claude_code_path: Option<PathBuf>,
    /// Absolute path to the Codex executable. Required for the `codex-cli`
    /// provider.
    pub codex_path: Option<PathBuf>,
    /// Project roots surfaced to clients.
    pub repositories: Vec<PathBuf>,
    /// Worker pool size.
    pub worker_concurrency: usize,
    /// Idle poll interval, ms.
    pub worker_polling_interval: u64,
    /// Days to retain terminal jobs.
    pub job_retention: i64,
    /// Retry cap per job.
    pub max_job_attempts: i64,
    /// Processing lease, ms.
    #[serde(rename = "leaseTTL")]
    pub lease_ttl: u64,
    /// Grace period between cooperative agent stop and forced kill, ms.
    pub graceful_shutdown_ms: u64,
    /// Per-subscriber event buffer.
    pub sse_buffer_events: usize,
    /// Whether `system` envelopes are persisted (and counted).
    pub persist_system_messages: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            host: "0.0.0.0".to_owned(),
            log_level: "info".to_owned(),
            database_path: base_dir().join("pokecode.db"),
            database_wal: true,
            database_cache_size: 1_000_000,
            claude_code_path: None,
            codex_path: None,
            repositories: Vec::new(),
            worker_concurrency: 5,
            worker_polling_interval: 1000,
            job_retention: 30,
            max_job_attempts: 1,
            lease_ttl: 60_000,
            graceful_shutdown_ms: 5000,
            sse_buffer_events: 256,
            persist_system_messages: true,
        }
    }
}

impl Config {
    /// Default config file path (`~/.pokecode/config.json`).
    #[must_use]
    pub fn default_path() -> PathBuf {
        base_dir().join("config.json")
    }

    /// Log file path (`~/.pokecode/pokecode.log`).
    #[must_use]
    pub fn log_path() -> PathBuf {
        base_dir().join("pokecode.log")
    }

    /// Pid file path (`~/.pokecode/pokecode.pid`).
    #[must_use]
    pub fn pid_path() -> PathBuf {
        base_dir().join("pokecode.pid")
    }

    /// Daemon descriptor path (`~/.pokecode/daemon.json`).
    #[must_use]
    pub fn daemon_descriptor_path() -> PathBuf {
        base_dir().join("daemon.json")
    }

    /// Load from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be parsed.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from `path`, falling back to defaults when absent, then apply
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be parsed.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("invalid config at {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("POKECODE_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(host) = std::env::var("POKECODE_HOST") {
            self.host = host;
        }
        if let Ok(level) = std::env::var("POKECODE_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(path) = std::env::var("POKECODE_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.worker_concurrency, 5);
        assert_eq!(config.max_job_attempts, 1);
        assert_eq!(config.lease_ttl, 60_000);
        assert_eq!(config.sse_buffer_events, 256);
        assert!(config.persist_system_messages);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load_from(Path::new("/no/such/config.json")).unwrap();
        assert_eq!(config.port, 3001);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"port": 4100, "leaseTTL": 5000, "claudeCodePath": "/usr/local/bin/claude"}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.port, 4100);
        assert_eq!(config.lease_ttl, 5000);
        assert_eq!(
            config.claude_code_path.as_deref(),
            Some(Path::new("/usr/local/bin/claude"))
        );
        // Untouched options keep their defaults.
        assert_eq!(config.worker_concurrency, 5);
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
