//! Error types for the offload engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OffloadError {
    /// Required credentials or connection fields are missing. Raised before any
    /// network call is attempted.
    #[error("Destination not configured: {0}")]
    NotConfigured(String),

    /// The provider answered with a non-2xx status or a malformed body.
    #[error("Transfer failed (HTTP {status}): {message}")]
    Transfer { status: u16, message: String },

    /// Timeout, DNS, TLS or connection failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unknown destination id.
    #[error("Destination not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Another invocation holds the task lock.
    #[error("Task lock held by {0}")]
    Lock(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SFTP error: {0}")]
    Sftp(#[from] ssh2::Error),
}

impl OffloadError {
    pub fn transfer(status: u16, message: impl Into<String>) -> Self {
        OffloadError::Transfer {
            status,
            message: message.into(),
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            OffloadError::Transfer { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Errors that can never succeed on a later attempt for the same entry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, OffloadError::NotFound(_))
    }

    /// Failures worth repeating straight away: timeouts, throttling, 5xx and
    /// broken connections. Auth and client errors come back the same.
    pub fn is_retryable(&self) -> bool {
        match self {
            OffloadError::Transfer { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            OffloadError::Transport(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for OffloadError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => OffloadError::transfer(status.as_u16(), e.to_string()),
            None => OffloadError::Transport(e.to_string()),
        }
    }
}

impl From<quick_xml::DeError> for OffloadError {
    fn from(e: quick_xml::DeError) -> Self {
        OffloadError::transfer(0, format!("Malformed XML response: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, OffloadError>;
