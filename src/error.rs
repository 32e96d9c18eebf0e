use std::path::PathBuf;

use thiserror::Error;

pub type DubResult<T> = Result<T, DubError>;

#[derive(Debug, Error)]
pub enum DubError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid document `{artifact}`: {message}")]
    InvalidDocument { artifact: String, message: String },

    #[error("missing command `{command}` on PATH")]
    CommandMissing { command: String },

    #[error("command failed: `{command}` (status: {status}){stderr_suffix}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr_suffix: String,
    },

    #[error("command timed out after {timeout_ms}ms: `{command}`")]
    CommandTimedOut { command: String, timeout_ms: u64 },

    #[error("transient failure from {service}: {message}")]
    Transient { service: String, message: String },

    #[error("permanent failure from {service} (http {status}): {message}")]
    Permanent {
        service: String,
        status: u16,
        message: String,
    },

    #[error("{service} poll deadline exceeded after {deadline_ms}ms")]
    PollTimeout { service: String, deadline_ms: u64 },

    #[error("missing expected artifact `{key}` at `{path}`")]
    MissingArtifact { key: String, path: PathBuf },

    #[error("workspace is locked by another run: {0}")]
    WorkspaceLocked(PathBuf),

    #[error("pipeline cancelled: {0}")]
    Cancelled(String),

    #[error("phase `{phase}` failed while {activity} (artifact `{artifact}`): {message}")]
    PhaseFailed {
        phase: String,
        activity: String,
        artifact: String,
        message: String,
    },
}

impl DubError {
    #[must_use]
    pub fn from_command_failure(command: String, status: i32, stderr: String) -> Self {
        let trimmed = stderr.trim();
        let stderr_suffix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("; stderr: {trimmed}")
        };
        Self::CommandFailed {
            command,
            status,
            stderr_suffix,
        }
    }

    /// Whether a retry inside the same phase is allowed for this error.
    ///
    /// Only transient external failures qualify; everything else is either
    /// fatal for the phase or fatal for the run.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Stable, unique, machine-readable error code for every variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "RD-IO",
            Self::Json(_) => "RD-JSON",
            Self::Config(_) => "RD-CONFIG",
            Self::InvalidDocument { .. } => "RD-INVALID-DOCUMENT",
            Self::CommandMissing { .. } => "RD-CMD-MISSING",
            Self::CommandFailed { .. } => "RD-CMD-FAILED",
            Self::CommandTimedOut { .. } => "RD-CMD-TIMEOUT",
            Self::Transient { .. } => "RD-TRANSIENT",
            Self::Permanent { .. } => "RD-PERMANENT",
            Self::PollTimeout { .. } => "RD-POLL-TIMEOUT",
            Self::MissingArtifact { .. } => "RD-MISSING-ARTIFACT",
            Self::WorkspaceLocked(_) => "RD-WORKSPACE-LOCKED",
            Self::Cancelled(_) => "RD-CANCELLED",
            Self::PhaseFailed { .. } => "RD-PHASE-FAILED",
        }
    }
}
