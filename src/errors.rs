use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    /// True when the caller has to send the user through sign-in again.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            AppError::Auth(_) | AppError::Upstream(UpstreamError::Unauthorized)
        )
    }
}

/// Token lifecycle failures. Stored on the `TokenRecord` as `last_error`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthError {
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Access token expired and no refresh token is available")]
    NoRefreshToken,
    #[error("Refreshing the access token failed")]
    RefreshFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("Provider rate limit reached")]
    RateLimited,
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Not found")]
    NotFound,
    #[error("Provider server error (status {0})")]
    ServerError(u16),
    #[error("Malformed provider response: {0}")]
    Malformed(String),
    #[error("Provider rejected the access token")]
    Unauthorized,
    #[error("Provider rejected the request (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Network error: {0}")]
    Network(String),
}

/// Per-part decode failure; logged and skipped, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Bad body encoding: {0}")]
    BadEncoding(String),
}
