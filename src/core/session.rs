use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Which external agent executable drives a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    /// Claude Code CLI.
    #[default]
    ClaudeCode,

    /// Codex CLI.
    CodexCli,
}

impl Provider {
    /// Tag persisted in the database and exposed on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::CodexCli => "codex-cli",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude-code" => Ok(Self::ClaudeCode),
            "codex-cli" => Ok(Self::CodexCli),
            _ => anyhow::bail!("unknown provider: {s}"),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session recency state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Recently used.
    #[default]
    Active,

    /// Aged out of recent use; still fully queryable.
    Inactive,
}

impl SessionState {
    /// Tag persisted in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            _ => anyhow::bail!("unknown session state: {s}"),
        }
    }
}

/// A logical conversation bound to one project path and one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique identifier.
    pub id: Uuid,

    /// External agent executable driving this session.
    pub provider: Provider,

    /// Absolute path to the workspace the agent runs in.
    pub project_path: PathBuf,

    /// Human-readable label derived from the project path basename.
    pub name: String,

    /// The agent's on-disk state directory, once discovered.
    pub claude_directory_path: Option<PathBuf>,

    /// The agent's internal session handle, back-filled from the first
    /// envelope that carries one. Write-once; later mismatches are logged
    /// and ignored.
    pub provider_session_id: Option<String>,

    /// Recency state.
    pub state: SessionState,

    /// Free-form client context.
    pub context: Option<String>,

    /// Free-form client metadata.
    pub metadata: Option<serde_json::Value>,

    /// True iff a pending or processing job exists for this session.
    pub is_working: bool,

    /// Id of the active job when `is_working` is true.
    pub current_job_id: Option<Uuid>,

    /// Terminal status of the most recently finished job.
    pub last_job_status: Option<String>,

    /// Count of rows in `session_messages` for this session.
    pub message_count: i64,

    /// Accumulated token usage across all parsed agent messages.
    pub token_count: i64,

    /// When the session was created.
    pub created_at: DateTime<Utc>,

    /// When the session was last mutated.
    pub updated_at: DateTime<Utc>,

    /// When the session was last read on behalf of a client.
    pub last_accessed_at: DateTime<Utc>,

    /// Timestamp of the most recent user message; `None` if none yet.
    pub last_message_sent_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a new session rooted at `project_path`.
    #[must_use]
    pub fn new(project_path: PathBuf, provider: Provider) -> Self {
        let now = Utc::now();
        let name = derive_name(&project_path);
        let claude_directory_path = match provider {
            Provider::ClaudeCode => Some(claude_project_dir(&project_path)),
            Provider::CodexCli => None,
        };
        Self {
            id: Uuid::new_v4(),
            provider,
            project_path,
            name,
            claude_directory_path,
            provider_session_id: None,
            state: SessionState::Active,
            context: None,
            metadata: None,
            is_working: false,
            current_job_id: None,
            last_job_status: None,
            message_count: 0,
            token_count: 0,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            last_message_sent_at: None,
        }
    }
}

/// Derive the human-readable session name from the project path basename.
#[must_use]
pub fn derive_name(project_path: &Path) -> String {
    project_path
        .file_name()
        .map_or_else(|| project_path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// Claude Code's on-disk state directory for a project
/// (`~/.claude/projects/<slug>/`, where the slug is the project path with
/// separators and dots replaced by dashes).
#[must_use]
pub fn claude_project_dir(project_path: &Path) -> PathBuf {
    let slug = project_path
        .to_string_lossy()
        .replace(['/', '\\', '.'], "-");
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("projects")
        .join(slug)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_provider_round_trip() {
        for p in [Provider::ClaudeCode, Provider::CodexCli] {
            assert_eq!(Provider::from_str(p.as_str()).unwrap(), p);
        }
    }

    #[test]
    fn test_provider_serde_tags() {
        assert_eq!(
            serde_json::to_string(&Provider::ClaudeCode).unwrap(),
            "\"claude-code\""
        );
        assert_eq!(
            serde_json::to_string(&Provider::CodexCli).unwrap(),
            "\"codex-cli\""
        );
    }

    #[test]
    fn test_new_session_defaults() {
        let session = Session::new(PathBuf::from("/tmp/my-app"), Provider::ClaudeCode);
        assert_eq!(session.name, "my-app");
        assert_eq!(session.state, SessionState::Active);
        assert!(!session.is_working);
        assert_eq!(session.message_count, 0);
        assert_eq!(session.token_count, 0);
        assert!(session.last_message_sent_at.is_none());
    }

    #[test]
    fn test_derive_name_from_basename() {
        assert_eq!(derive_name(Path::new("/home/user/project")), "project");
        assert_eq!(derive_name(Path::new("/")), "/");
    }

    #[test]
    fn test_claude_project_dir_slug() {
        let dir = claude_project_dir(Path::new("/tmp/my.app"));
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, "-tmp-my-app");
        assert!(dir.to_string_lossy().contains(".claude"));
    }

    #[test]
    fn test_claude_sessions_record_state_dir() {
        let session = Session::new(PathBuf::from("/tmp/app"), Provider::ClaudeCode);
        assert!(session.claude_directory_path.is_some());
        let session = Session::new(PathBuf::from("/tmp/app"), Provider::CodexCli);
        assert!(session.claude_directory_path.is_none());
    }
}
