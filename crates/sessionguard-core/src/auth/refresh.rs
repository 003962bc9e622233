//! Single-flight token refresh.
//!
//! At most one refresh call is outstanding at any time. Callers that need a
//! fresh token while one is in flight queue up and are released, in the order
//! they arrived, with the same token or the same failure.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::{header, Method};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::transport::{Transport, TransportError, TransportRequest, REQUEST_ID_HEADER};

use super::credentials::{CredentialRecord, CredentialStore, UserProfile};
use super::events::{EndReason, SessionEvent, SessionEvents};
use super::token::Token;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No stored token to refresh")]
    NoCredential,

    #[error("Refresh rejected with status {status}")]
    Rejected { status: u16 },

    #[error("Refresh response did not contain a token")]
    MissingToken,

    #[error("Refresh call failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("Refresh was abandoned before it finished")]
    Cancelled,
}

/// Servers name the new token differently; any of these fields may be present.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RefreshResponse {
    new_token: Option<String>,
    token: Option<String>,
    access_token: Option<String>,
    user: Option<UserProfile>,
}

impl RefreshResponse {
    /// First non-empty token field, preferring `newToken`.
    fn into_token(self) -> Option<Token> {
        [self.new_token, self.token, self.access_token]
            .into_iter()
            .flatten()
            .find(|raw| !raw.is_empty())
            .map(Token::new)
    }
}

type Waiter = oneshot::Sender<Result<Token, RefreshError>>;

#[derive(Default)]
struct RefreshState {
    in_progress: bool,
    waiters: VecDeque<Waiter>,
}

enum Role {
    Leader,
    Waiter(oneshot::Receiver<Result<Token, RefreshError>>),
    Superseded(Token),
}

pub struct RefreshCoordinator {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    events: SessionEvents,
    refresh_path: String,
    timeout: Duration,
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialStore>,
        events: SessionEvents,
        refresh_path: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            credentials,
            events,
            refresh_path: refresh_path.into(),
            timeout,
            state: Mutex::new(RefreshState::default()),
        }
    }

    /// True while a refresh call is outstanding.
    pub fn is_refreshing(&self) -> bool {
        self.state.lock().in_progress
    }

    /// Obtain a new token, joining the in-flight refresh if there is one.
    pub async fn ensure_fresh_token(&self) -> Result<Token, RefreshError> {
        self.refresh(None).await
    }

    /// Like [`ensure_fresh_token`](Self::ensure_fresh_token), but if the stored
    /// token is no longer `stale` (someone else already refreshed it) the
    /// stored token is returned without another refresh call.
    pub async fn refresh_replacing(&self, stale: &Token) -> Result<Token, RefreshError> {
        self.refresh(Some(stale)).await
    }

    async fn refresh(&self, stale: Option<&Token>) -> Result<Token, RefreshError> {
        loop {
            let role = {
                let mut state = self.state.lock();
                if state.in_progress {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    debug!(queued = state.waiters.len(), "Waiting on in-flight refresh");
                    Role::Waiter(rx)
                } else {
                    match (stale, self.credentials.token()) {
                        (Some(stale), Some(current)) if &current != stale => Role::Superseded(current),
                        _ => {
                            state.in_progress = true;
                            Role::Leader
                        }
                    }
                }
            };

            match role {
                Role::Superseded(token) => return Ok(token),
                Role::Waiter(rx) => match rx.await {
                    // The leader was dropped mid-flight; try to take over.
                    Ok(Err(RefreshError::Cancelled)) | Err(_) => continue,
                    Ok(outcome) => return outcome,
                },
                Role::Leader => return self.lead().await,
            }
        }
    }

    /// Perform the refresh call as the single leader and fan out the result.
    async fn lead(&self) -> Result<Token, RefreshError> {
        let mut flight = InFlight {
            coordinator: self,
            settled: false,
        };

        let outcome = match self.call_refresh_endpoint().await {
            Ok(record) => {
                let token = record.token.clone();
                if let Err(e) = self.credentials.replace(record) {
                    warn!(error = %e, "Refreshed token could not be persisted");
                }
                info!("Session token refreshed");
                self.events.emit(SessionEvent::Refreshed);
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, ending session");
                if let Err(clear_err) = self.credentials.clear() {
                    warn!(error = %clear_err, "Failed to clear stored credentials");
                }
                self.events.emit(SessionEvent::Ended(EndReason::RefreshFailed));
                Err(e)
            }
        };

        flight.settle(outcome.clone());
        outcome
    }

    async fn call_refresh_endpoint(&self) -> Result<CredentialRecord, RefreshError> {
        let current = self.credentials.token().ok_or(RefreshError::NoCredential)?;

        let request = TransportRequest {
            method: Method::POST,
            path: self.refresh_path.clone(),
            headers: vec![
                (
                    header::AUTHORIZATION.as_str().to_string(),
                    format!("Bearer {}", current.as_str()),
                ),
                (REQUEST_ID_HEADER.to_string(), Uuid::new_v4().to_string()),
            ],
            body: Some(serde_json::json!({ "token": current.as_str() })),
            timeout: self.timeout,
        };

        let response = tokio::time::timeout(self.timeout, self.transport.dispatch(request))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        if !(200..300).contains(&response.status) {
            return Err(RefreshError::Rejected {
                status: response.status,
            });
        }

        let parsed: RefreshResponse = serde_json::from_str(&response.body)
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        // Servers may omit the user on refresh; keep the one we have.
        let user = parsed.user.clone().or_else(|| self.credentials.user()).unwrap_or_default();
        let token = parsed.into_token().ok_or(RefreshError::MissingToken)?;

        Ok(CredentialRecord::new(token, user))
    }
}

/// Resets the refresh state and releases waiters exactly once, including
/// when the leading future is dropped before the refresh completes.
struct InFlight<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(&mut self, outcome: Result<Token, RefreshError>) {
        if self.settled {
            return;
        }
        self.settled = true;

        let waiters = {
            let mut state = self.coordinator.state.lock();
            state.in_progress = false;
            std::mem::take(&mut state.waiters)
        };
        debug!(waiters = waiters.len(), ok = outcome.is_ok(), "Releasing refresh waiters");
        for waiter in waiters {
            // A waiter that gave up has dropped its receiver
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Refresh abandoned mid-flight");
            self.settle(Err(RefreshError::Cancelled));
        }
    }
}
