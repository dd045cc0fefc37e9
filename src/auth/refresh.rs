// Token refresh network call

use bytes::Bytes;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Method;

use super::types::{RefreshRequest, RefreshResponse};
use crate::error::RefreshError;
use crate::transport::{HttpRequest, HttpTransport};

/// New tokens returned by a refresh endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Build a JSON POST request
pub(crate) fn json_post(url: &str, body: &impl serde::Serialize) -> Result<HttpRequest, serde_json::Error> {
    let payload = serde_json::to_vec(body)?;
    let mut request = HttpRequest::new(Method::POST, url);
    request
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    request.body = Some(Bytes::from(payload));
    Ok(request)
}

/// Exchange a refresh token at one endpoint
pub async fn refresh_at(
    transport: &dyn HttpTransport,
    url: &str,
    refresh_token: &str,
) -> Result<TokenData, RefreshError> {
    tracing::debug!(url = %url, "Sending refresh request");

    let request = json_post(
        url,
        &RefreshRequest {
            refresh: refresh_token,
        },
    )
    .map_err(|e| RefreshError::MalformedResponse(e.to_string()))?;

    let response = transport.send(request).await?;

    let status = response.status();
    if !status.is_success() {
        return Err(RefreshError::Rejected {
            status: status.as_u16(),
            message: response.text(),
        });
    }

    let data: RefreshResponse = response
        .json()
        .map_err(|e| RefreshError::MalformedResponse(e.to_string()))?;

    let access_token = data
        .access
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            RefreshError::MalformedResponse("response does not contain access".to_string())
        })?;

    Ok(TokenData {
        access_token,
        refresh_token: data.refresh.filter(|t| !t.is_empty()),
    })
}

/// Whether the next candidate endpoint is worth trying after `error`.
/// Only a missing or unreachable endpoint moves on; an endpoint that exists
/// and turned the token down has answered for all of them.
fn try_next_endpoint(error: &RefreshError) -> bool {
    match error {
        RefreshError::Rejected { status, .. } => matches!(status, 404 | 405 | 501),
        RefreshError::Transport(_) => true,
        _ => false,
    }
}

/// Try each refresh endpoint in order; the first that yields a token wins.
/// Fails with the last endpoint's error when none succeed.
pub async fn refresh_with_fallback(
    transport: &dyn HttpTransport,
    urls: &[String],
    refresh_token: &str,
) -> Result<TokenData, RefreshError> {
    let mut last_error = RefreshError::MalformedResponse("no refresh endpoint configured".to_string());

    for url in urls {
        match refresh_at(transport, url, refresh_token).await {
            Ok(token_data) => {
                tracing::info!(
                    url = %url,
                    rotated = token_data.refresh_token.is_some(),
                    "Access token refreshed"
                );
                return Ok(token_data);
            }
            Err(e) if try_next_endpoint(&e) => {
                tracing::warn!(url = %url, error = %e, "Refresh endpoint unavailable, trying next");
                last_error = e;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error)
}
