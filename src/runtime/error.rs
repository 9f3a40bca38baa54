//! Runtime and collaborator errors

use crate::state_machine::TransitionError;
use std::time::Duration;
use thiserror::Error;

/// Failure of an external collaborator call, with a classification
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct CallError {
    pub kind: CallErrorKind,
    pub message: String,
}

pub type NluError = CallError;
pub type ActionError = CallError;
pub type GenerationError = CallError;

impl CallError {
    pub fn new(kind: CallErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::Network, message)
    }

    pub fn timed_out(after: Duration) -> Self {
        Self::new(
            CallErrorKind::Timeout,
            format!("Timed out after {}ms", after.as_millis()),
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::NotFound, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::Rejected, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::InvalidResponse, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::Unknown, message)
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            404 => Self::not_found(format!("Not found: {body}")),
            400 | 422 => Self::rejected(format!("Rejected: {body}")),
            500..=599 => Self::network(format!("Server error {status}: {body}")),
            _ => Self::unknown(format!("HTTP {status}: {body}")),
        }
    }

    /// Map a transport-level reqwest failure
    pub fn from_request(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(CallErrorKind::Timeout, format!("Request timeout: {e}"))
        } else if e.is_connect() {
            Self::network(format!("Connection failed: {e}"))
        } else {
            Self::unknown(format!("Request failed: {e}"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallErrorKind {
    /// Connection problems and 5xx responses
    Network,
    Timeout,
    /// No such action or endpoint
    NotFound,
    /// The collaborator refused the request
    Rejected,
    /// Response body could not be decoded
    InvalidResponse,
    Unknown,
}

/// Errors surfaced to callers of the runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Session {0} is busy, try again shortly")]
    Busy(String),
    #[error("Session {0} is no longer running")]
    SessionClosed(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("State store error: {0}")]
    Store(String),
}
