// Login and logout
// Login goes straight to the transport: the login endpoint is never
// intercepted or refreshed.

use super::coordinator::RefreshCoordinator;
use super::refresh::json_post;
use super::store::TokenStorage;
use super::types::{CredentialPair, LoginRequest, SessionState};
use crate::error::ApiError;
use crate::transport::HttpTransport;

/// Exchange username/password for a credential pair and store it
pub async fn login(
    transport: &dyn HttpTransport,
    tokens: &TokenStorage,
    login_url: &str,
    username: &str,
    password: &str,
) -> Result<CredentialPair, ApiError> {
    tracing::info!(username = %username, "Logging in...");

    let request = json_post(login_url, &LoginRequest { username, password })
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

    let response = transport.send(request).await?;

    let status = response.status();
    if !status.is_success() {
        tracing::warn!(status = %status, "Login rejected");
        return Err(ApiError::RequestFailed {
            status: status.as_u16(),
            message: response.text(),
        });
    }

    let pair: CredentialPair = response
        .json()
        .map_err(|e| ApiError::Decode(format!("login response: {}", e)))?;

    if pair.access_token.is_empty() || pair.refresh_token.is_empty() {
        return Err(ApiError::Decode(
            "login response contains an empty token".to_string(),
        ));
    }

    tokens.save(&pair)?;
    tracing::info!("✅ Logged in");

    Ok(pair)
}

/// Forget the stored credentials
pub fn logout(tokens: &TokenStorage) -> Result<(), ApiError> {
    tokens.clear()?;
    tracing::info!("Logged out, credentials cleared");
    Ok(())
}

/// Current position in the session state machine
pub async fn session_state(
    tokens: &TokenStorage,
    coordinator: &RefreshCoordinator,
) -> Result<SessionState, ApiError> {
    if coordinator.is_refreshing().await {
        return Ok(SessionState::Refreshing);
    }

    if tokens.access_token()?.is_some() || tokens.refresh_token()?.is_some() {
        Ok(SessionState::Authenticated)
    } else {
        Ok(SessionState::NoSession)
    }
}
