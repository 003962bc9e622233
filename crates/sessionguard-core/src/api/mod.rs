//! Request pipeline module.
//!
//! `RequestPipeline` is the only way calls leave the client. It wraps an
//! arbitrary `Transport` with credential attachment, refresh on 401, bounded
//! retries with backoff, and advisory in-flight tracking.

pub mod error;
pub mod pipeline;
pub mod retry;
pub mod tracker;
pub mod transport;

pub use error::PipelineError;
pub use pipeline::{RequestPipeline, RequestSpec, Response};
pub use retry::{RetryDecision, RetryPolicy};
pub use tracker::{AttemptRecord, RequestTracker};
pub use transport::{HttpTransport, Transport, TransportError, TransportRequest, TransportResponse};
