//! Per-call orchestration.
//!
//! Every outbound call goes through [`RequestPipeline::send`]: credentials are
//! attached (refreshing first when the token is stale), the request is
//! dispatched with a hard timeout, and the outcome is classified. A 401 gets
//! one refresh-and-redispatch; transient failures go to the retry policy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use reqwest::{header, Method};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{
    token, CredentialRecord, CredentialStore, EndReason, KeyValueStore, RefreshCoordinator,
    SessionEvent, SessionEvents, StorageError, Token,
};
use crate::config::ClientConfig;

use super::error::PipelineError;
use super::retry::{RetryDecision, RetryPolicy};
use super::tracker::{AttemptRecord, RequestTracker};
use super::transport::{HttpTransport, Transport, TransportError, TransportRequest, REQUEST_ID_HEADER};

/// What a caller wants sent.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    /// False for health checks and the authentication endpoints themselves.
    pub requires_auth: bool,
    pub timeout: Option<Duration>,
    pub retry_budget: Option<u32>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
            requires_auth: true,
            timeout: None,
            retry_budget: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Send without credentials.
    pub fn public(mut self) -> Self {
        self.requires_auth = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = Some(budget.max(1));
        self
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: String,
    pub request_id: Uuid,
    /// Dispatches made, including retries and the post-refresh redispatch.
    pub attempts: u32,
    pub elapsed: Duration,
}

impl Response {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        serde_json::from_str(&self.body).map_err(|e| PipelineError::InvalidResponse(e.to_string()))
    }
}

/// The authenticated request pipeline.
/// Clone is cheap - all shared state lives behind `Arc`s.
#[derive(Clone)]
pub struct RequestPipeline {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    refresher: Arc<RefreshCoordinator>,
    tracker: Arc<RequestTracker>,
    events: SessionEvents,
    retry: RetryPolicy,
    config: Arc<ClientConfig>,
}

impl RequestPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        storage: Arc<dyn KeyValueStore>,
        config: ClientConfig,
    ) -> Self {
        let credentials = Arc::new(CredentialStore::open(storage));
        let events = SessionEvents::new();
        let refresher = Arc::new(RefreshCoordinator::new(
            transport.clone(),
            credentials.clone(),
            events.clone(),
            config.refresh_path.clone(),
            config.request_timeout(),
        ));

        Self {
            transport,
            credentials,
            refresher,
            tracker: Arc::new(RequestTracker::new()),
            events,
            retry: config.retry_policy(),
            config: Arc::new(config),
        }
    }

    /// Build a pipeline over HTTP with the configured storage backend.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(config.base_url.clone())?);
        let storage = config.open_storage()?;
        Ok(Self::new(transport, storage, config))
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Install a record produced by an external sign-in flow.
    pub fn establish(&self, record: CredentialRecord) -> Result<(), StorageError> {
        info!(user = ?record.user.username, "Session established");
        self.credentials.replace(record)
    }

    /// Send a request and return the successful response or a classified failure.
    pub async fn send(&self, spec: RequestSpec) -> Result<Response, PipelineError> {
        let attempt = AttemptRecord::new(spec.method.clone(), spec.path.clone(), spec.requires_auth);
        let duplicates = self.tracker.register(&attempt);
        if duplicates > 0 {
            debug!(method = %spec.method, path = %spec.path, duplicates, "Same request already in flight");
        }
        let tracked = Tracked {
            tracker: self.tracker.as_ref(),
            id: attempt.id,
            done: false,
        };

        let result = self.run(&spec, attempt.id).await;

        let elapsed = tracked.finish();
        let elapsed_ms = elapsed.as_millis() as u64;
        if elapsed > self.config.slow_request_threshold() {
            warn!(request_id = %attempt.id, method = %spec.method, path = %spec.path, elapsed_ms, "Slow request");
        }

        match result {
            Ok(mut response) => {
                debug!(request_id = %attempt.id, status = response.status, elapsed_ms, "Request completed");
                response.elapsed = elapsed;
                Ok(response)
            }
            Err(e) => {
                debug!(request_id = %attempt.id, path = %spec.path, error = %e, "Request failed");
                Err(e)
            }
        }
    }

    async fn run(&self, spec: &RequestSpec, request_id: Uuid) -> Result<Response, PipelineError> {
        let policy = RetryPolicy {
            budget: spec.retry_budget.unwrap_or(self.retry.budget),
            ..self.retry
        };
        let timeout = spec.timeout.unwrap_or_else(|| self.config.request_timeout());
        let refreshable = spec.requires_auth && !self.config.is_auth_path(&spec.path);

        let mut token = if spec.requires_auth {
            Some(self.authorize().await?)
        } else {
            None
        };
        let mut refreshed_after_401 = false;
        let mut attempt_count = 0u32;

        loop {
            attempt_count += 1;
            self.tracker.note_attempt(request_id, attempt_count);
            let request = self.build_request(spec, token.as_ref(), request_id, timeout);

            let outcome = tokio::time::timeout(timeout, self.transport.dispatch(request))
                .await
                .unwrap_or(Err(TransportError::Timeout(timeout)));

            let err = match outcome {
                Ok(response) if (200..300).contains(&response.status) => {
                    return Ok(Response {
                        status: response.status,
                        body: response.body,
                        request_id,
                        attempts: attempt_count,
                        elapsed: Duration::ZERO,
                    });
                }
                Ok(response) if response.status == 401 && refreshable => {
                    if refreshed_after_401 {
                        warn!(request_id = %request_id, path = %spec.path, "Refreshed token was rejected");
                        self.events.emit(SessionEvent::Ended(EndReason::Rejected));
                        return Err(PipelineError::SessionExpired);
                    }
                    refreshed_after_401 = true;
                    let stale = token.take().ok_or(PipelineError::Unauthenticated)?;
                    debug!(request_id = %request_id, path = %spec.path, "Got 401, refreshing token");
                    token = Some(self.refresh(&stale).await?);
                    continue;
                }
                Ok(response) => PipelineError::from_status(response.status, &response.body),
                Err(e) => PipelineError::from(e),
            };

            match policy.should_retry(&err, attempt_count) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        request_id = %request_id,
                        path = %spec.path,
                        attempt = attempt_count,
                        budget = policy.budget,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Stop => return Err(err),
            }
        }
    }

    /// Current token, refreshed first if it is expired or about to expire.
    async fn authorize(&self) -> Result<Token, PipelineError> {
        let Some(token) = self.credentials.token() else {
            self.events.emit(SessionEvent::Ended(EndReason::Unauthenticated));
            return Err(PipelineError::Unauthenticated);
        };
        if !token::needs_refresh(&token, Utc::now()) {
            return Ok(token);
        }
        debug!("Token expired or expiring soon, refreshing before dispatch");
        self.refresh(&token).await
    }

    async fn refresh(&self, stale: &Token) -> Result<Token, PipelineError> {
        self.refresher.refresh_replacing(stale).await.map_err(|e| {
            debug!(error = %e, "Refresh failed");
            PipelineError::SessionExpired
        })
    }

    fn build_request(
        &self,
        spec: &RequestSpec,
        token: Option<&Token>,
        request_id: Uuid,
        timeout: Duration,
    ) -> TransportRequest {
        let mut headers = spec.headers.clone();
        if let Some(token) = token {
            headers.push((
                header::AUTHORIZATION.as_str().to_string(),
                format!("Bearer {}", token.as_str()),
            ));
        }
        headers.push((REQUEST_ID_HEADER.to_string(), request_id.to_string()));

        TransportRequest {
            method: spec.method.clone(),
            path: spec.path.clone(),
            headers,
            body: spec.body.clone(),
            timeout,
        }
    }

    /// Unauthenticated liveness check with the short health timeout.
    pub async fn health(&self) -> Result<Response, PipelineError> {
        let spec = RequestSpec::get(self.config.health_path.clone())
            .public()
            .with_timeout(self.config.health_timeout());
        self.send(spec).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, PipelineError> {
        self.send(RequestSpec::get(path)).await?.json()
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, PipelineError> {
        let body = serde_json::to_value(body).map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;
        self.send(RequestSpec::post(path, body)).await?.json()
    }

    /// Best-effort logout.
    ///
    /// The server is told if possible, but local credentials are cleared no
    /// matter what it answers (a 404 from an older server is expected).
    pub async fn logout(&self) -> Result<(), StorageError> {
        if let Some(token) = self.credentials.token() {
            let spec = RequestSpec::post(self.config.logout_path.clone(), serde_json::json!({}));
            let timeout = self.config.request_timeout();
            let request = self.build_request(&spec, Some(&token), Uuid::new_v4(), timeout);

            match tokio::time::timeout(timeout, self.transport.dispatch(request)).await {
                Ok(Ok(response)) if (200..300).contains(&response.status) => {
                    debug!("Server acknowledged logout");
                }
                Ok(Ok(response)) if response.status == 404 => {
                    debug!("Logout endpoint not found, clearing local session anyway");
                }
                Ok(Ok(response)) => {
                    warn!(status = response.status, "Logout rejected by server, clearing local session anyway");
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Logout request failed, clearing local session anyway");
                }
                Err(_) => {
                    warn!("Logout request timed out, clearing local session anyway");
                }
            }
        }

        let cleared = self.credentials.clear();
        info!("Logged out");
        self.events.emit(SessionEvent::LoggedOut);
        cleared
    }
}

/// Deregisters a call from the tracker, also when the call future is dropped.
struct Tracked<'a> {
    tracker: &'a RequestTracker,
    id: Uuid,
    done: bool,
}

impl Tracked<'_> {
    fn finish(mut self) -> Duration {
        self.done = true;
        self.tracker.complete(self.id).unwrap_or_default()
    }
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.tracker.complete(self.id);
        }
    }
}
