//! Error taxonomy surfaced by the pool core

use std::fmt;
use std::path::PathBuf;

/// Errors surfaced by pool operations.
///
/// Cooldowns are the only retry mechanism: none of these trigger an
/// automatic re-execution of the caller's operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no account available for selection")]
    NoAvailableAccount,

    #[error("account {id} is unavailable:\n{summary}")]
    AccountUnavailable { id: String, summary: String },

    #[error("authentication failed for account {id}: {cause}")]
    AuthFailed { id: String, cause: String },

    #[error("usage fetch failed for account {id}: {cause}")]
    UsageFetchFailed { id: String, cause: String },

    #[error("credentials reload failed for {}: {cause}", .path.display())]
    ReloadFailed { path: PathBuf, cause: String },

    #[error("credentials parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// Transport errors pass through unchanged.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error raised by a caller-supplied operation or a usage fetch.
///
/// Carries the HTTP status when one was observed; classification falls back
/// to message scanning otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: body.into(),
        }
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for TransportError {}
