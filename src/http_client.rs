use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::{
    session, CredentialPair, CredentialStore, RefreshCoordinator, SessionState, SqliteStore,
    TokenStorage,
};
use crate::config::Config;
use crate::error::{ApiError, RefreshError, Result};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

/// Request descriptor: method and path relative to the API base
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `body` as the JSON payload
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to serialize body: {}", e)))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(payload));
        Ok(self)
    }
}

/// List endpoints answer either a paginated envelope or a bare array
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Plain(Vec<T>),
    Page { results: Vec<T> },
}

/// Authenticated API client
///
/// Attaches the stored access token to every request. On a 401 it asks the
/// refresh coordinator for a new token and replays the request once; when
/// that is impossible the stored credentials are cleared and
/// `ApiError::Unauthenticated` is returned.
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    tokens: TokenStorage,
    coordinator: Arc<RefreshCoordinator>,

    /// Server URL plus API base path
    api_base_url: String,

    /// API base path, used to recognise authentication endpoints
    api_base_path: String,

    login_url: String,

    /// Fetched by `verify_session`
    session_check_path: String,

    /// Login and refresh paths, normalized
    auth_paths: Vec<String>,
}

impl ApiClient {
    /// Create a client over an explicit transport and credential store
    pub fn new(
        config: &Config,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let tokens = TokenStorage::new(store);
        let coordinator = Arc::new(RefreshCoordinator::new(
            tokens.clone(),
            transport.clone(),
            config.refresh_urls(),
        ));

        let auth_paths = std::iter::once(&config.login_path)
            .chain(&config.refresh_paths)
            .map(|p| normalize_path(p))
            .collect();

        Self {
            transport,
            tokens,
            coordinator,
            api_base_url: config.api_base_url(),
            api_base_path: config.api_base_path.clone(),
            login_url: config.login_url(),
            session_check_path: config.session_check_path.clone(),
            auth_paths,
        }
    }

    /// Create a client with the reqwest transport and the SQLite credential store
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(
            config.http_max_connections,
            config.http_connect_timeout,
            config.http_request_timeout,
        )?;
        let store = SqliteStore::open(&config.credentials_db)?;

        Ok(Self::new(config, Arc::new(transport), Arc::new(store)))
    }

    /// Send a request, recovering from an expired access token at most once
    pub async fn request(&self, request: ApiRequest) -> Result<HttpResponse> {
        let url = self.resolve(&request.path)?;
        let auth_endpoint = self.is_auth_endpoint(&request.path);
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();

        let mut token = self.tokens.access_token()?;
        let mut retried = false;

        loop {
            let response = self
                .dispatch(&request, &url, token.as_deref(), &request_id)
                .await?;

            if response.status() != StatusCode::UNAUTHORIZED || auth_endpoint {
                return into_result(response, &request_id);
            }

            token = Some(self.recover(token.as_deref(), retried, &request_id).await?);
            retried = true;
        }
    }

    /// Outbound side: attach the bearer token (if any) and send
    async fn dispatch(
        &self,
        request: &ApiRequest,
        url: &str,
        token: Option<&str>,
        request_id: &str,
    ) -> Result<HttpResponse> {
        let mut headers = request.headers.clone();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::InvalidRequest("access token is not a valid header value".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        tracing::debug!(
            request_id = %request_id,
            method = %request.method,
            url = %url,
            authenticated = token.is_some(),
            "Sending HTTP request"
        );

        let outbound = HttpRequest {
            method: request.method.clone(),
            url: url.to_string(),
            headers,
            query: request.query.clone(),
            body: request.body.clone(),
        };

        Ok(self.transport.send(outbound).await?)
    }

    /// Inbound side of a 401: obtain a replacement token or end the session
    async fn recover(
        &self,
        failed_token: Option<&str>,
        retried: bool,
        request_id: &str,
    ) -> Result<String> {
        if retried {
            tracing::warn!(
                request_id = %request_id,
                "Request rejected again after token refresh, ending session"
            );
            return Err(self.end_session(RefreshError::ReplayRejected));
        }

        tracing::debug!(request_id = %request_id, "Received 401, refreshing access token");

        match self.coordinator.ensure_refreshed(failed_token).await {
            Ok(token) => Ok(token),
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "Session could not be refreshed");
                Err(self.end_session(e))
            }
        }
    }

    /// Clear stored credentials and build the `Unauthenticated` error
    fn end_session(&self, reason: RefreshError) -> ApiError {
        if let Err(e) = self.tokens.clear() {
            tracing::error!(error = %e, "Failed to clear stored credentials");
        }
        ApiError::Unauthenticated(reason)
    }

    /// GET `path` and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.request(ApiRequest::get(path)).await?;
        decode(&response)
    }

    /// Send `body` as JSON with `method` and decode the JSON answer
    pub async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let request = ApiRequest::new(method, path).json(body)?;
        let response = self.request(request).await?;
        decode(&response)
    }

    /// DELETE `path`, discarding the body
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.request(ApiRequest::delete(path)).await?;
        Ok(())
    }

    /// Fetch a list, unwrapping a `{"results": [...]}` page when present
    pub async fn list<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<Vec<T>> {
        let response = self.request(request).await?;
        let listing: Listing<T> = response
            .json()
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        Ok(match listing {
            Listing::Plain(items) => items,
            Listing::Page { results } => results,
        })
    }

    /// Log in with username and password; the issued pair replaces any stored one
    pub async fn login(&self, username: &str, password: &str) -> Result<CredentialPair> {
        session::login(
            self.transport.as_ref(),
            &self.tokens,
            &self.login_url,
            username,
            password,
        )
        .await
    }

    /// Forget stored credentials
    pub fn logout(&self) -> Result<()> {
        session::logout(&self.tokens)
    }

    /// Current session state
    pub async fn session_state(&self) -> Result<SessionState> {
        session::session_state(&self.tokens, &self.coordinator).await
    }

    /// Confirm the stored session with the server
    ///
    /// Fetches the session check path through the normal request path, so an
    /// expired access token is refreshed first. A dead session ends up cleared
    /// and is reported as `NoSession`; any other failure is returned as is and
    /// leaves the credentials alone.
    pub async fn verify_session(&self) -> Result<SessionState> {
        if self.session_state().await? == SessionState::NoSession {
            return Ok(SessionState::NoSession);
        }

        match self.request(ApiRequest::get(self.session_check_path.as_str())).await {
            Ok(_) => Ok(SessionState::Authenticated),
            Err(e) if e.is_unauthenticated() => {
                tracing::info!(error = %e, "Stored session is no longer valid");
                Ok(SessionState::NoSession)
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh coordinator shared by every request of this client
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Absolute URL for a path relative to the API base
    fn resolve(&self, path: &str) -> Result<String> {
        if path.contains("://") {
            return Err(ApiError::InvalidRequest(format!(
                "expected a path relative to the API base, got {}",
                path
            )));
        }

        if path.starts_with('/') {
            Ok(format!("{}{}", self.api_base_url, path))
        } else {
            Ok(format!("{}/{}", self.api_base_url, path))
        }
    }

    /// Whether `path` (relative to the API base) is the login or a refresh endpoint
    fn is_auth_endpoint(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or_default();
        let full = if path.starts_with('/') {
            format!("{}{}", self.api_base_path, path)
        } else {
            format!("{}/{}", self.api_base_path, path)
        };
        let full = normalize_path(&full);

        self.auth_paths.iter().any(|p| *p == full)
    }
}

/// Trailing slashes do not distinguish endpoints
fn normalize_path(path: &str) -> String {
    path.trim_end_matches('/').to_string()
}

/// 2xx passes through; anything else becomes `RequestFailed`
fn into_result(response: HttpResponse, request_id: &str) -> Result<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text();
    tracing::warn!(
        request_id = %request_id,
        status = status.as_u16(),
        response_body = %message,
        "HTTP request failed with error response"
    );

    Err(ApiError::RequestFailed {
        status: status.as_u16(),
        message,
    })
}

/// Decode a JSON body; empty bodies (204) decode from `null`
fn decode<T: DeserializeOwned>(response: &HttpResponse) -> Result<T> {
    if response.body.is_empty() || response.status() == StatusCode::NO_CONTENT {
        return serde_json::from_value(serde_json::Value::Null).map_err(|_| {
            ApiError::Decode(format!(
                "empty response ({}) cannot be decoded into the requested type",
                response.status().as_u16()
            ))
        });
    }

    response.json().map_err(|e| ApiError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryStore;
    use crate::error::TransportError;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::Mutex;

    /// Transport that answers from a fixed script and records every request
    struct ScriptedTransport {
        responses: Mutex<Vec<HttpResponse>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        fn new(mut responses: Vec<HttpResponse>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<HttpRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| TransportError::Connect("script exhausted".to_string()))
        }
    }

    fn client(transport: &Arc<ScriptedTransport>, store: &MemoryStore) -> ApiClient {
        ApiClient::new(
            &Config::for_server("http://portal.test"),
            transport.clone(),
            Arc::new(store.clone()),
        )
    }

    #[test]
    fn test_resolve() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let client = client(&transport, &MemoryStore::new());

        assert_eq!(
            client.resolve("/v1/student/students/").unwrap(),
            "http://portal.test/api/v1/student/students/"
        );
        assert_eq!(
            client.resolve("v1/hr/staff/").unwrap(),
            "http://portal.test/api/v1/hr/staff/"
        );
        tokio_test::assert_err!(client.resolve("http://elsewhere.test/api/"));
    }

    #[test]
    fn test_is_auth_endpoint() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let client = client(&transport, &MemoryStore::new());

        assert!(client.is_auth_endpoint("/token/"));
        assert!(client.is_auth_endpoint("/token/refresh/"));
        assert!(client.is_auth_endpoint("/token/refresh"));
        assert!(client.is_auth_endpoint("/token/refresh/?x=1"));
        assert!(!client.is_auth_endpoint("/v1/student/students/"));
        assert!(!client.is_auth_endpoint("/token/verify/"));
    }

    #[tokio::test]
    async fn test_bearer_attached_when_token_stored() {
        let transport = Arc::new(ScriptedTransport::new(vec![HttpResponse::new(
            StatusCode::OK,
            "[]",
        )]));
        let store = MemoryStore::with_pair("a1", "r1");

        client(&transport, &store)
            .request(ApiRequest::get("/v1/student/classrooms/"))
            .await
            .unwrap();

        let seen = transport.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].authorization(), Some("Bearer a1"));
    }

    #[tokio::test]
    async fn test_no_bearer_without_token() {
        let transport = Arc::new(ScriptedTransport::new(vec![HttpResponse::new(
            StatusCode::OK,
            "{}",
        )]));

        client(&transport, &MemoryStore::new())
            .request(ApiRequest::get("/v1/core/me/"))
            .await
            .unwrap();

        assert_eq!(transport.seen()[0].authorization(), None);
    }

    #[tokio::test]
    async fn test_refresh_and_replay() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            HttpResponse::new(StatusCode::UNAUTHORIZED, ""),
            HttpResponse::new(StatusCode::OK, r#"{"access":"a2"}"#),
            HttpResponse::new(StatusCode::OK, r#"{"ok":true}"#),
        ]));
        let store = MemoryStore::with_pair("a1", "r1");

        let value: serde_json::Value = client(&transport, &store)
            .get_json("/v1/student/students/")
            .await
            .unwrap();
        assert_eq!(value["ok"], true);

        let seen = transport.seen();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1].url, "http://portal.test/api/token/refresh/");
        assert_eq!(seen[1].authorization(), None);
        assert_eq!(seen[2].authorization(), Some("Bearer a2"));
        assert_eq!(store.get("access").unwrap().as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn test_replay_rejected_ends_session() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            HttpResponse::new(StatusCode::UNAUTHORIZED, ""),
            HttpResponse::new(StatusCode::OK, r#"{"access":"a2"}"#),
            HttpResponse::new(StatusCode::UNAUTHORIZED, ""),
        ]));
        let store = MemoryStore::with_pair("a1", "r1");

        let err = client(&transport, &store)
            .request(ApiRequest::get("/v1/finance/invoices/"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ApiError::Unauthenticated(RefreshError::ReplayRejected)
        ));
        assert_eq!(transport.seen().len(), 3);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_401_on_auth_endpoint_passes_through() {
        let transport = Arc::new(ScriptedTransport::new(vec![HttpResponse::new(
            StatusCode::UNAUTHORIZED,
            r#"{"detail":"No active account"}"#,
        )]));
        let store = MemoryStore::with_pair("a1", "r1");

        let err = client(&transport, &store)
            .request(ApiRequest::post("/token/"))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert_eq!(transport.seen().len(), 1);
        assert_eq!(store.get("refresh").unwrap().as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_other_errors_pass_through_without_refresh() {
        let transport = Arc::new(ScriptedTransport::new(vec![HttpResponse::new(
            StatusCode::FORBIDDEN,
            r#"{"detail":"forbidden"}"#,
        )]));
        let store = MemoryStore::with_pair("a1", "r1");

        let err = client(&transport, &store)
            .request(ApiRequest::get("/v1/hr/staff/"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::RequestFailed { status: 403, .. }));
        assert_eq!(transport.seen().len(), 1);
        assert_eq!(store.get("access").unwrap().as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_transport_error_passes_through() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let store = MemoryStore::with_pair("a1", "r1");

        let err = client(&transport, &store)
            .request(ApiRequest::get("/v1/hr/staff/"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Transport(_)));
        assert!(!store.is_empty());
    }

    #[tokio::test]
    async fn test_verify_session_without_credentials_sends_nothing() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));

        let state = client(&transport, &MemoryStore::new())
            .verify_session()
            .await
            .unwrap();

        assert_eq!(state, SessionState::NoSession);
        assert!(transport.seen().is_empty());
    }

    #[tokio::test]
    async fn test_verify_session_accepted() {
        let transport = Arc::new(ScriptedTransport::new(vec![HttpResponse::new(
            StatusCode::OK,
            r#"{"username":"admin"}"#,
        )]));
        let store = MemoryStore::with_pair("a1", "r1");

        let state = client(&transport, &store).verify_session().await.unwrap();

        assert_eq!(state, SessionState::Authenticated);
        assert_eq!(transport.seen()[0].url, "http://portal.test/api/core/me/");
    }

    #[tokio::test]
    async fn test_verify_session_dead_session_is_cleared() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            HttpResponse::new(StatusCode::UNAUTHORIZED, ""),
            HttpResponse::new(StatusCode::UNAUTHORIZED, r#"{"code":"token_not_valid"}"#),
        ]));
        let store = MemoryStore::with_pair("a1", "r-expired");

        let state = client(&transport, &store).verify_session().await.unwrap();

        assert_eq!(state, SessionState::NoSession);
        assert!(store.is_empty());
        // A rejected refresh token is not tried against the other candidates
        assert_eq!(transport.seen().len(), 2);
    }

    #[tokio::test]
    async fn test_verify_session_server_error_keeps_credentials() {
        let transport = Arc::new(ScriptedTransport::new(vec![HttpResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "",
        )]));
        let store = MemoryStore::with_pair("a1", "r1");

        let err = client(&transport, &store).verify_session().await.unwrap_err();

        assert_eq!(err.status(), Some(500));
        assert_eq!(store.get("refresh").unwrap().as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_list_unwraps_page_and_plain() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            HttpResponse::new(StatusCode::OK, r#"{"count":2,"results":[{"id":1},{"id":2}]}"#),
            HttpResponse::new(StatusCode::OK, r#"[{"id":3}]"#),
        ]));
        let client = client(&transport, &MemoryStore::with_pair("a1", "r1"));

        let page: Vec<serde_json::Value> = client
            .list(ApiRequest::get("/v1/student/students/").query("page", "1"))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);

        let plain: Vec<serde_json::Value> = client
            .list(ApiRequest::get("/v1/student/classrooms/"))
            .await
            .unwrap();
        assert_eq!(plain[0]["id"], 3);

        let seen = transport.seen();
        assert_eq!(seen[0].query, vec![("page".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn test_delete_with_no_content() {
        let transport = Arc::new(ScriptedTransport::new(vec![HttpResponse::new(
            StatusCode::NO_CONTENT,
            "",
        )]));
        let client = client(&transport, &MemoryStore::with_pair("a1", "r1"));

        client.delete("/v1/inventory/items/7/").await.unwrap();
        assert_eq!(transport.seen()[0].method, Method::DELETE);
    }

    #[tokio::test]
    async fn test_send_json_sets_content_type() {
        let transport = Arc::new(ScriptedTransport::new(vec![HttpResponse::new(
            StatusCode::CREATED,
            r#"{"id":10,"name":"Sunflowers"}"#,
        )]));
        let client = client(&transport, &MemoryStore::with_pair("a1", "r1"));

        let created: serde_json::Value = client
            .send_json(
                Method::POST,
                "/v1/student/classrooms/",
                &serde_json::json!({ "name": "Sunflowers" }),
            )
            .await
            .unwrap();
        assert_eq!(created["id"], 10);

        let seen = transport.seen();
        assert_eq!(
            seen[0].headers.get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    proptest! {
        #[test]
        fn resolved_urls_stay_under_api_base(segment in "[a-z0-9_-]{1,12}") {
            let transport = Arc::new(ScriptedTransport::new(vec![]));
            let client = client(&transport, &MemoryStore::new());

            let url = client.resolve(&format!("/v1/{}/", segment)).unwrap();
            prop_assert!(url.starts_with("http://portal.test/api/v1/"));
            prop_assert!(!url["http://".len()..].contains("//"));
        }

        #[test]
        fn business_paths_are_never_auth_endpoints(segment in "[a-z]{1,12}") {
            prop_assume!(segment != "token");
            let transport = Arc::new(ScriptedTransport::new(vec![]));
            let client = client(&transport, &MemoryStore::new());

            let versioned = format!("/v1/{}/", segment);
            let bare = format!("/{}/", segment);
            prop_assert!(!client.is_auth_endpoint(&versioned));
            prop_assert!(!client.is_auth_endpoint(&bare));
        }
    }
}
