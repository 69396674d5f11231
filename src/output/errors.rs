// Error types for batch execution

use std::path::PathBuf;

use thiserror::Error;

use crate::store::ExecutionId;

pub type Result<T> = std::result::Result<T, BatchError>;

/// All error types in fleetbatch
#[derive(Debug, Error)]
pub enum BatchError {
    /// Malformed request, rejected before anything is stored
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Unknown host or group while expanding a target
    #[error("Could not resolve targets: {0}")]
    Resolution(String),

    /// Target expanded to no hosts at all
    #[error("Target resolved to an empty host list")]
    EmptyTarget,

    /// SSH handshake, authentication or transport failure
    #[error("SSH connection to {host} failed: {message}")]
    Connection {
        host: String,
        message: String,
        suggestion: Option<String>,
    },

    /// Remote command did not finish within its wall-clock budget
    #[error("Command on {host} timed out after {timeout_secs}s")]
    CommandTimeout { host: String, timeout_secs: u64 },

    /// Remote command finished with a non-zero status
    #[error("Command on {host} exited with status {exit_code}")]
    NonZeroExit { host: String, exit_code: i32 },

    #[error("Execution was cancelled")]
    Cancelled,

    #[error("Execution {0} not found")]
    NotFound(ExecutionId),

    #[error("Execution store error: {0}")]
    Store(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BatchError {
    pub fn connection(host: impl Into<String>, message: impl Into<String>) -> Self {
        BatchError::Connection {
            host: host.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Connection failures and timeouts may succeed on a later attempt.
    /// Non-zero exits are retried only when the caller opts in, which is
    /// decided by the retry policy rather than here.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BatchError::Connection { .. } | BatchError::CommandTimeout { .. }
        )
    }

    /// Hint for the operator, if one is known
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            BatchError::Connection { suggestion, .. } => suggestion.as_deref(),
            BatchError::CommandTimeout { .. } => {
                Some("Raise the per-host timeout or check that the command terminates")
            }
            BatchError::EmptyTarget => Some("Check the host ids or the group membership"),
            _ => None,
        }
    }
}
