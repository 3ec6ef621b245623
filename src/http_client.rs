use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, Request, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::auth::{
    is_token_expired, AuthCredentials, CredentialSource, LoginMethod, RefreshProvider,
    SessionEvent,
};
use crate::error::{AuthError, Result};

/// Header carrying the environment API key
pub const API_KEY_HEADER: &str = "api-key";

/// Header carrying the environment STS token
pub const STS_TOKEN_HEADER: &str = "x-authorization";

/// One logical request issued through the dispatcher
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub url: String,
    pub method: Method,
    /// Serialized as JSON when present
    pub body: Option<serde_json::Value>,
}

impl DispatchRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, url).with_body(body)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Fully buffered HTTP response
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl DispatchResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Result of a dispatch that did not fail
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Final response from the server, whatever its status
    Completed(DispatchResponse),

    /// Stored session expired and could not be refreshed, so nothing was
    /// sent; a [`SessionEvent::SilentLogout`] was emitted
    SessionInvalidated,
}

impl FetchOutcome {
    pub fn into_response(self) -> Option<DispatchResponse> {
        match self {
            FetchOutcome::Completed(response) => Some(response),
            FetchOutcome::SessionInvalidated => None,
        }
    }
}

/// Network layer used by the dispatcher
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: Request,
    ) -> std::result::Result<DispatchResponse, reqwest::Error>;
}

/// Transport backed by a pooled reqwest client
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: u64, request_timeout: u64) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        request: Request,
    ) -> std::result::Result<DispatchResponse, reqwest::Error> {
        let response = self.client.execute(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(DispatchResponse {
            status,
            headers,
            body,
        })
    }
}

/// Observable dispatcher state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    InFlight,
}

/// Cancellation slot for the one request a dispatcher owns
#[derive(Default)]
struct InFlightSlot {
    generation: u64,
    token: Option<CancellationToken>,
}

/// Clears the slot when its request reaches any terminal state, including
/// when the caller drops the future
struct InFlightGuard<'a> {
    dispatcher: &'a AuthDispatcher,
    generation: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.dispatcher.slot();
        // A newer request may already own the slot
        if slot.generation == self.generation {
            slot.token = None;
        }
    }
}

/// Authenticated request dispatcher
/// Issues at most one request at a time; starting a new one aborts the previous
pub struct AuthDispatcher {
    /// Network layer
    transport: Arc<dyn Transport>,

    /// Current credentials
    credentials: Arc<dyn CredentialSource>,

    /// Token refresh on 401 for refreshable methods
    refresher: Arc<dyn RefreshProvider>,

    /// Session-invalidation sink
    events: broadcast::Sender<SessionEvent>,

    /// Cancellation token of the in-flight request
    in_flight: Mutex<InFlightSlot>,
}

impl AuthDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        refresher: Arc<dyn RefreshProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);

        Self {
            transport,
            credentials,
            refresher,
            events,
            in_flight: Mutex::new(InFlightSlot::default()),
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> DispatchState {
        if self.slot().token.is_some() {
            DispatchState::InFlight
        } else {
            DispatchState::Idle
        }
    }

    fn slot(&self) -> MutexGuard<'_, InFlightSlot> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cancel any in-flight request and install a fresh token for a new one
    fn begin(&self) -> (u64, CancellationToken) {
        let mut slot = self.slot();
        if let Some(previous) = slot.token.take() {
            tracing::debug!(generation = slot.generation, "Aborting superseded request");
            previous.cancel();
        }

        slot.generation += 1;
        let token = CancellationToken::new();
        slot.token = Some(token.clone());
        (slot.generation, token)
    }

    /// Abort the in-flight request, if any
    pub fn abort(&self) {
        let mut slot = self.slot();
        if let Some(token) = slot.token.take() {
            tracing::debug!(generation = slot.generation, "Aborting in-flight request");
            token.cancel();
        }
    }

    /// Execute a request with the active credentials.
    ///
    /// - Supersedes (aborts) any request still in flight
    /// - Expired SSO token: refreshed before sending; if no token comes back,
    ///   emits [`SessionEvent::SilentLogout`] and returns
    ///   [`FetchOutcome::SessionInvalidated`] without sending the request
    /// - 401 on a refreshable method: refreshes and resends exactly once
    pub async fn fetch_with_auth(&self, request: DispatchRequest) -> Result<FetchOutcome> {
        let (generation, token) = self.begin();
        let _guard = InFlightGuard {
            dispatcher: self,
            generation,
        };

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            generation,
            "Dispatching authenticated request"
        );

        let result = self.dispatch(&request, &token).await;
        if let Err(ref e) = result {
            if e.is_expected() {
                tracing::debug!(url = %request.url, "Request ended: {}", e);
            } else {
                tracing::warn!(url = %request.url, error = %e, "Authenticated request failed");
            }
        }
        result
    }

    async fn dispatch(
        &self,
        request: &DispatchRequest,
        token: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let credentials = match cancellable(token, self.credentials.active_credentials()).await {
            Ok(Some(credentials)) => credentials,
            Ok(None) => return Err(AuthError::NoCredentials),
            Err(AuthError::TokenExpired) => return Ok(self.silent_logout()),
            Err(e) => return Err(e),
        };

        // At most one refresh per dispatch, spent either here or on a 401
        let mut refreshed = false;
        let credentials = if has_expired_access_token(&credentials) {
            tracing::info!("Stored access token has expired, refreshing before sending");
            refreshed = true;
            match self.refresh(token).await? {
                Some(access_token) => credentials.with_access_token(&access_token),
                None => return Ok(self.silent_logout()),
            }
        } else {
            credentials
        };

        let mut response = self.send(request, &credentials, token).await?;

        if response.status == StatusCode::UNAUTHORIZED
            && credentials.login_method().is_refreshable()
            && !refreshed
        {
            tracing::warn!("Received 401, refreshing token and retrying once...");

            match self.refresh(token).await? {
                Some(access_token) => {
                    let updated = credentials.with_access_token(&access_token);
                    response = self.send(request, &updated, token).await?;
                }
                None => tracing::debug!("No refreshed token available, returning original 401"),
            }
        }

        // Cancelled between the last response and here
        if token.is_cancelled() {
            return Err(AuthError::Aborted);
        }

        tracing::debug!(status = %response.status, "Received HTTP response");
        Ok(FetchOutcome::Completed(response))
    }

    /// Ask the refresher for a new access token. Failures other than an abort
    /// are logged and reported as no token.
    async fn refresh(&self, token: &CancellationToken) -> Result<Option<String>> {
        // The refresher observes the token itself so an abort never persists a new token
        match self.refresher.refreshed_token(token).await {
            Ok(refreshed) => Ok(refreshed),
            Err(AuthError::Aborted) => Err(AuthError::Aborted),
            Err(e) => {
                tracing::error!("Token refresh failed: {}", e);
                Ok(None)
            }
        }
    }

    fn silent_logout(&self) -> FetchOutcome {
        tracing::warn!("Session expired during credential resolution, signalling silent logout");
        // No subscribers is fine
        let _ = self.events.send(SessionEvent::SilentLogout);
        FetchOutcome::SessionInvalidated
    }

    async fn send(
        &self,
        request: &DispatchRequest,
        credentials: &AuthCredentials,
        token: &CancellationToken,
    ) -> Result<DispatchResponse> {
        let headers = build_headers(credentials)?;
        let req = build_request(request, headers)?;

        cancellable(token, async move {
            self.transport.execute(req).await.map_err(AuthError::from)
        })
        .await
    }
}

/// Race `fut` against the request's cancellation token
async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AuthError::Aborted),
        result = fut => result,
    }
}

/// Stored SSO token whose JWT `exp` has already passed
fn has_expired_access_token(credentials: &AuthCredentials) -> bool {
    match credentials {
        AuthCredentials::Sso(secrets) => is_token_expired(&secrets.access_token, Utc::now()),
        _ => false,
    }
}

fn sensitive_value(value: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(value).map_err(|_| {
        AuthError::InvalidRequest("credential is not a valid header value".to_string())
    })?;
    value.set_sensitive(true);
    Ok(value)
}

/// Build the per-method authentication headers
fn build_headers(credentials: &AuthCredentials) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    match credentials {
        AuthCredentials::Sso(secrets) => {
            headers.insert(
                AUTHORIZATION,
                sensitive_value(&format!("Bearer {}", secrets.access_token))?,
            );
        }
        AuthCredentials::Environment(secrets) => {
            headers.insert(
                HeaderName::from_static(API_KEY_HEADER),
                sensitive_value(&secrets.api_key)?,
            );
            headers.insert(
                HeaderName::from_static(STS_TOKEN_HEADER),
                sensitive_value(&secrets.sts_token)?,
            );
        }
        AuthCredentials::ApiKey(_) => {
            return Err(AuthError::UnsupportedMethod(LoginMethod::ApiKey));
        }
    }

    Ok(headers)
}

fn build_request(request: &DispatchRequest, headers: HeaderMap) -> Result<Request> {
    let url = Url::parse(&request.url)
        .map_err(|e| AuthError::InvalidRequest(format!("{}: {}", request.url, e)))?;

    let mut req = Request::new(request.method.clone(), url);
    *req.headers_mut() = headers;
    if let Some(ref body) = request.body {
        *req.body_mut() = Some(serde_json::to_vec(body)?.into());
    }
    Ok(req)
}
