// Error handling module
// Defines the error taxonomy shared by the session store and the dispatcher

use thiserror::Error;

use crate::auth::{BackendError, LoginMethod};

/// Errors surfaced by session and dispatch operations
#[derive(Error, Debug)]
pub enum AuthError {
    /// Secret backend I/O failed
    #[error("Secret backend error: {0}")]
    Backend(#[from] BackendError),

    /// Environment credential provider failed (distinct from "no credentials")
    #[error("Environment credentials unavailable: {0}")]
    Environment(String),

    /// No credentials for the active login method
    #[error("No authentication credentials available")]
    NoCredentials,

    /// Login method has no header scheme in the dispatcher
    #[error("Unsupported login method: {0}")]
    UnsupportedMethod(LoginMethod),

    /// Credentials for this method are never written to the secret backend
    #[error("Credentials for login method {0} cannot be persisted")]
    NotPersistable(LoginMethod),

    /// Stored session token has expired
    #[error("Access token expired")]
    TokenExpired,

    /// Token refresh failed
    #[error("Token refresh failed: {0}")]
    Refresh(String),

    /// Request was superseded or explicitly aborted
    #[error("Request aborted")]
    Aborted,

    /// Request could not be built (bad URL, credentials not valid as header values)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Network-level failure
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Request body or record could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AuthError {
    /// Errors that are expected parts of the auth lifecycle rather than faults
    pub fn is_expected(&self) -> bool {
        matches!(self, AuthError::TokenExpired | AuthError::Aborted)
    }
}

/// Result type alias for auth operations
pub type Result<T> = std::result::Result<T, AuthError>;
