//! Session lifecycle signals for collaborators (routing, UI).

use tokio::sync::broadcast;
use tracing::debug;

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// A call needed credentials and none were stored.
    Unauthenticated,
    /// The refresh call failed; stored credentials were cleared.
    RefreshFailed,
    /// The server rejected a freshly refreshed token.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A refresh replaced the stored token.
    Refreshed,
    /// The session can no longer be used; collaborators should re-authenticate.
    Ended(EndReason),
    /// Local credentials were cleared by an explicit logout.
    LoggedOut,
}

/// Broadcast handle. Clones share the same channel.
#[derive(Clone)]
pub struct SessionEvents {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Send to every current subscriber. Having none is fine.
    pub fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!(?event, "No session event subscribers");
        }
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}
