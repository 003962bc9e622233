//! Advisory bookkeeping of in-flight calls.
//!
//! Nothing here affects the outcome of a request. It exists for latency
//! observation and for noticing duplicate calls that are already in flight.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Method;
use tokio::time::Instant;
use uuid::Uuid;

/// One entry per call, from entering the pipeline until it terminates.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub id: Uuid,
    pub method: Method,
    pub path: String,
    pub attempt_count: u32,
    pub requires_auth: bool,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl AttemptRecord {
    pub fn new(method: Method, path: impl Into<String>, requires_auth: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            path: path.into(),
            attempt_count: 0,
            requires_auth,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Default)]
pub struct RequestTracker {
    in_flight: Mutex<HashMap<Uuid, AttemptRecord>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a call. Returns how many calls with the same method
    /// and path were already in flight.
    pub fn register(&self, attempt: &AttemptRecord) -> usize {
        let mut in_flight = self.in_flight.lock();
        let duplicates = in_flight
            .values()
            .filter(|r| r.method == attempt.method && r.path == attempt.path)
            .count();
        in_flight.insert(attempt.id, attempt.clone());
        duplicates
    }

    /// Record that another dispatch of the call is starting.
    pub fn note_attempt(&self, id: Uuid, attempt_count: u32) {
        if let Some(record) = self.in_flight.lock().get_mut(&id) {
            record.attempt_count = attempt_count;
        }
    }

    /// Stop tracking a call and return how long it was in flight.
    /// Unknown ids return `None`.
    pub fn complete(&self, id: Uuid) -> Option<Duration> {
        self.in_flight.lock().remove(&id).map(|r| r.elapsed())
    }

    pub fn in_flight(&self) -> Vec<AttemptRecord> {
        let mut records: Vec<_> = self.in_flight.lock().values().cloned().collect();
        records.sort_by_key(|r| r.started);
        records
    }

    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
