//! Error types for OAuth authentication operations

/// Errors from OAuth authentication operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("token parse error: {0}")]
    TokenParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("no stored tokens for account {0}, run the authorization flow first")]
    NoTokens(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
