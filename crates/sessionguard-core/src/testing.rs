//! Scripted transport double for unit tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

use crate::api::transport::{Transport, TransportError, TransportRequest, TransportResponse};
use crate::auth::token::{encode_unsigned, Token};

#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, String),
    /// Connection dropped before any response.
    Drop,
    /// Never answers; only a timeout gets the caller out.
    Hang,
}

impl Reply {
    pub fn json(status: u16, body: Value) -> Self {
        Reply::Status(status, body.to_string())
    }

    pub fn ok() -> Self {
        Reply::Status(200, "{}".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub request: TransportRequest,
    pub at: Instant,
}

/// Answers each path from its own reply queue, falling back to `fallback`.
pub struct ScriptedTransport {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Duration,
    fallback: Reply,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
            fallback: Reply::ok(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_fallback(mut self, reply: Reply) -> Self {
        self.fallback = reply;
        self
    }

    pub fn push(&self, path: &str, reply: Reply) {
        self.replies
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.request.path == path)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn dispatch(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let path = request.path.clone();
        self.calls.lock().push(RecordedCall {
            request,
            at: Instant::now(),
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        // Popped after the latency so a cancelled call does not consume a reply
        let reply = self
            .replies
            .lock()
            .get_mut(&path)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            Reply::Status(status, body) => Ok(TransportResponse { status, body }),
            Reply::Drop => Err(TransportError::Network("connection reset".to_string())),
            Reply::Hang => {
                std::future::pending::<()>().await;
                Err(TransportError::Network("unreachable".to_string()))
            }
        }
    }
}

/// Token for `subject` expiring `secs` from now.
pub fn token_expiring_in(subject: &str, secs: i64) -> Token {
    let now = Utc::now().timestamp();
    encode_unsigned(subject, Some("member"), now - 60, now + secs)
}

/// Collects formatted log output from the current thread.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Route this thread's events here until the guard is dropped.
    pub fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        String::from_utf8_lossy(&self.buffer.lock())
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_string)
            .collect()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
