//! Error taxonomy for the credential lifecycle.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Errors raised by the store, the flow controller and the scheduler.
///
/// None of these are fatal to the host process: exchange failures are retried
/// by the scheduler, persistence failures are retried on the next tick, and an
/// expired refresh token leads to re-authorization.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Callback was missing `code`/`state`, or the state did not match the
    /// pending nonce.
    #[error("invalid callback: {0}")]
    InvalidCallback(String),

    /// Network failure or provider rejection during a token exchange.
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// Reading or writing the credential file failed.
    #[error("credential persistence failed: {0}")]
    PersistenceFailed(String),

    /// The refresh token is past its validity window.
    #[error("refresh token expired")]
    RefreshTokenExpired,

    /// No credential record exists.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The token endpoint answered with something we cannot turn into a record.
    #[error("invalid token response: {0}")]
    InvalidTokenResponse(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        Self::TokenExchangeFailed(err.to_string())
    }
}

impl From<std::io::Error> for AuthError {
    fn from(err: std::io::Error) -> Self {
        Self::PersistenceFailed(err.to_string())
    }
}
