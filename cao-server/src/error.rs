use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mux::MuxError;

/// Error kinds surfaced over the control plane as `{kind, message, terminal_id?}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    InvalidTransition,
    LaunchFailure,
    Timeout,
    DeadRecipient,
    MuxUnavailable,
    ScriptFailure,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid-request",
            ErrorKind::NotFound => "not-found",
            ErrorKind::InvalidTransition => "invalid-transition",
            ErrorKind::LaunchFailure => "launch-failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::DeadRecipient => "dead-recipient",
            ErrorKind::MuxUnavailable => "mux-unavailable",
            ErrorKind::ScriptFailure => "script-failure",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OrchestratorError {
    pub kind: ErrorKind,
    pub message: String,
    pub terminal_id: Option<String>,
}

impl OrchestratorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            terminal_id: None,
        }
    }

    pub fn with_terminal(mut self, terminal_id: impl Into<String>) -> Self {
        self.terminal_id = Some(terminal_id.into());
        self
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{what} not found"))
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<MuxError> for OrchestratorError {
    fn from(err: MuxError) -> Self {
        let kind = match &err {
            MuxError::Unavailable(_) | MuxError::ExecFailure(_) => ErrorKind::MuxUnavailable,
            MuxError::SessionExists(_) => ErrorKind::LaunchFailure,
            MuxError::SessionMissing(_) => ErrorKind::NotFound,
        };
        Self::new(kind, err.to_string())
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
