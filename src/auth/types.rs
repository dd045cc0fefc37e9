// Authentication types

use serde::{Deserialize, Serialize};

/// Store key holding the access token
pub const ACCESS_TOKEN_KEY: &str = "access";

/// Store key holding the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh";

/// Access/refresh token pair issued by the login or refresh endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialPair {
    #[serde(rename = "access")]
    pub access_token: String,
    #[serde(rename = "refresh")]
    pub refresh_token: String,
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Refresh request body
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh: &'a str,
}

/// Refresh response body; the server may rotate the refresh token
#[derive(Deserialize)]
pub struct RefreshResponse {
    pub access: Option<String>,
    pub refresh: Option<String>,
}

/// Where a session stands from the client's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No tokens stored; only the login flow leaves this state
    NoSession,
    /// An access token is stored and assumed valid
    Authenticated,
    /// A refresh operation is in flight
    Refreshing,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::NoSession => "no session",
            SessionState::Authenticated => "authenticated",
            SessionState::Refreshing => "refreshing",
        };
        f.write_str(s)
    }
}
