//! Error taxonomy.
//!
//! Only [`SetupError`] is fatal to the process. Processing failures are
//! reported for the turn that caused them and cleanup failures are logged.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Failure talking to the session store.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{what} did not finish within {timeout:?}")]
    Timeout { what: String, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Status { status, .. } => *status == 404,
            _ => false,
        }
    }
}

/// Failure before the interactive loop starts.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tool registration failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("Session store error: {0}")]
    Service(#[from] ServiceError),
}

/// Tool registry failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A tool named '{0}' is already registered")]
    DuplicateName(String),

    #[error("No tool named '{0}'")]
    NotFound(String),
}

/// Failure while submitting and processing one turn.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Session store error: {0}")]
    Service(#[from] ServiceError),

    #[error("Run {run_id} ended with status {status}: {message}")]
    RunFailed {
        run_id: String,
        status: String,
        message: String,
    },

    #[error("Run {run_id} did not finish within {timeout:?}")]
    RunTimeout { run_id: String, timeout: Duration },
}

/// Failure while tearing the session down.
#[derive(Debug, Error)]
#[error("Failed to delete session {session_id}: {source}")]
pub struct CleanupError {
    pub session_id: String,
    #[source]
    pub source: ServiceError,
}

/// An approval policy did not decide in time. The call is denied.
#[derive(Debug, Error)]
#[error("Approval for tool call {tool_call_id} timed out after {timeout:?}")]
pub struct ApprovalTimeout {
    pub tool_call_id: String,
    pub timeout: Duration,
}
