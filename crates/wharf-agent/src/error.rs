//! Agent error types.
//!
//! Every operation failure is surfaced to the originating request as a
//! response envelope carrying one of the protocol error codes; the
//! connection itself is never torn down on operation error.

use thiserror::Error;

/// Result type alias for operation handlers.
pub type OpResult<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Unknown or malformed `operation.type`.
    #[error("{0}")]
    InvalidOperation(String),

    /// Filesystem syscall failure, missing required field, or unsupported
    /// sub-operation.
    #[error("{0}")]
    Filesystem(String),

    /// Unknown pid, missing process field, or spawn failure.
    #[error("{0}")]
    Process(String),

    /// Glob expansion or watcher init failure.
    #[error("{0}")]
    Watch(String),

    /// Token verification failed or token missing.
    #[error("{0}")]
    Auth(String),

    /// Anything a handler could not classify.
    #[error("{0}")]
    Internal(String),
}

impl AgentError {
    /// Protocol error code for the `error.code` response field.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::InvalidOperation(_) => "INVALID_OPERATION",
            AgentError::Filesystem(_) => "FILESYSTEM_OPERATION_FAILED",
            AgentError::Process(_) => "PROCESS_OPERATION_FAILED",
            AgentError::Watch(_) => "WATCH_OPERATION_FAILED",
            AgentError::Auth(_) => "auth_error",
            AgentError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn fs(err: impl std::fmt::Display) -> Self {
        AgentError::Filesystem(err.to_string())
    }

    pub fn process(err: impl std::fmt::Display) -> Self {
        AgentError::Process(err.to_string())
    }

    pub fn watch(err: impl std::fmt::Display) -> Self {
        AgentError::Watch(err.to_string())
    }
}
