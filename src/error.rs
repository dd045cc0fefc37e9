// Error handling module
// Defines the error types surfaced by the transport, credential store,
// refresh coordinator and API client

use thiserror::Error;

/// Network-level failure reported by an HTTP transport
///
/// Clonable so a single failed refresh can be handed to every waiting request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Request did not complete within the configured timeout
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection to the server could not be established
    #[error("connection failed: {0}")]
    Connect(String),

    /// Any other failure while sending the request or reading the body
    #[error("{kind}: {message}")]
    Other { kind: &'static str, message: String },
}

/// Credential store failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Backend storage failed (SQLite, poisoned lock, ...)
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Why a refresh operation could not produce a new access token
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshError {
    /// No refresh token is stored; no network call was made
    #[error("no refresh token available")]
    NoRefreshToken,

    /// Refresh endpoint answered with a non-2xx status
    #[error("refresh endpoint rejected the token: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Refresh endpoint answered 2xx without a usable access token
    #[error("malformed refresh response: {0}")]
    MalformedResponse(String),

    /// Refresh request never got a response
    #[error("refresh request failed: {0}")]
    Transport(#[from] TransportError),

    /// New tokens could not be read or persisted
    #[error("credential store error: {0}")]
    Store(#[from] StoreError),

    /// Request was rejected again after being replayed with a fresh token
    #[error("request rejected after token refresh")]
    ReplayRejected,

    /// Background refresh task ended without a result (panicked or aborted)
    #[error("refresh task did not complete: {0}")]
    Aborted(String),
}

/// Errors returned to callers of the API client
#[derive(Error, Debug)]
pub enum ApiError {
    /// Session is gone: refresh failed or the replayed request was rejected.
    /// Stored credentials have been cleared; the caller must log in again.
    #[error("Authentication required: {0}")]
    Unauthenticated(#[from] RefreshError),

    /// Server answered with a non-2xx status unrelated to token expiry
    #[error("API error: {status} - {message}")]
    RequestFailed { status: u16, message: String },

    /// Request never reached the server or the response was cut short
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Credential store could not be read or written
    #[error("Credential store error: {0}")]
    Store(#[from] StoreError),

    /// Request descriptor could not be turned into a request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Response body did not match the expected shape
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// True when the caller should send the user back to the login flow
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, ApiError::Unauthenticated(_))
    }

    /// HTTP status of a failed request, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::RequestFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
