// Error taxonomy shared across the orchestration core.
//
// Every component-level failure carries a stable code (for machine routing)
// plus enough context to render a useful message: conflicting files for
// merges, the timed-out method for protocol requests, exit codes for crashes.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ForemanError>;

#[derive(Debug, Error)]
pub enum ForemanError {
    /// The agent binary is missing or could not be started.
    #[error("failed to spawn agent binary '{binary}': {reason}")]
    Spawn { binary: String, reason: String },

    /// A request was issued before connect() resolved or after disconnect.
    #[error("protocol client is not connected")]
    NotConnected,

    /// The client is shutting down; all in-flight requests are rejected.
    #[error("protocol client is disconnecting")]
    Disconnecting,

    /// No response arrived for a request within the configured deadline.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    RequestTimeout { method: String, timeout_ms: u64 },

    /// The agent subprocess exited while requests were still pending.
    #[error("agent process exited{}", match code {
        Some(c) => format!(" with code {}", c),
        None => String::new(),
    })]
    AgentExited { code: Option<i32> },

    /// The agent returned a JSON-RPC error response.
    #[error("protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// The target path is not a git repository.
    #[error("not a git repository: {path}")]
    NotARepository { path: PathBuf },

    /// The working tree has uncommitted changes.
    #[error("working tree is dirty: {path}")]
    DirtyTree { path: PathBuf },

    /// A merge produced conflicts; the file list is carried for guidance.
    #[error("merging '{source_branch}' into '{target}' produced {} conflicting file(s)", files.len())]
    MergeConflict {
        source_branch: String,
        target: String,
        files: Vec<String>,
    },

    /// A git command failed for a reason other than conflicts.
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    /// The execution plan is malformed (duplicate ids, unknown dependencies).
    #[error("invalid execution plan: {reason}")]
    InvalidPlan { reason: String },

    /// The state store could not be read or written.
    #[error("state store error: {message}")]
    State { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ForemanError {
    /// Stable machine-readable code for each error class.
    pub fn code(&self) -> &'static str {
        match self {
            ForemanError::Spawn { .. } => "spawn_failed",
            ForemanError::NotConnected => "not_connected",
            ForemanError::Disconnecting => "disconnecting",
            ForemanError::RequestTimeout { .. } => "request_timeout",
            ForemanError::AgentExited { .. } => "agent_exited",
            ForemanError::Protocol { .. } => "protocol_error",
            ForemanError::NotARepository { .. } => "not_a_repository",
            ForemanError::DirtyTree { .. } => "dirty_tree",
            ForemanError::MergeConflict { .. } => "merge_conflict",
            ForemanError::Git { .. } => "git_failed",
            ForemanError::InvalidPlan { .. } => "invalid_plan",
            ForemanError::State { .. } => "state_error",
            ForemanError::Io(_) => "io_error",
            ForemanError::Json(_) => "json_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = ForemanError::MergeConflict {
            source_branch: "agent/t1".to_string(),
            target: "main".to_string(),
            files: vec!["src/lib.rs".to_string()],
        };
        assert_eq!(err.code(), "merge_conflict");

        let err = ForemanError::RequestTimeout {
            method: "session/prompt".to_string(),
            timeout_ms: 5000,
        };
        assert_eq!(err.code(), "request_timeout");
    }

    #[test]
    fn test_conflict_message_carries_file_count() {
        let err = ForemanError::MergeConflict {
            source_branch: "agent/t1".to_string(),
            target: "main".to_string(),
            files: vec!["a.rs".to_string(), "b.rs".to_string()],
        };
        assert!(err.to_string().contains("2 conflicting file(s)"));
        // The renamed field keeps the conflicting branch out of the error
        // source chain; Display still names it.
        assert!(err.to_string().contains("agent/t1"));
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn test_agent_exited_with_and_without_code() {
        let with = ForemanError::AgentExited { code: Some(137) };
        assert!(with.to_string().contains("137"));

        let without = ForemanError::AgentExited { code: None };
        assert_eq!(without.to_string(), "agent process exited");
    }
}
