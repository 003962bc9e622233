//! Core library for sessionguard.
//!
//! Keeps one authenticated session alive across any number of concurrent
//! requests: tokens are refreshed ahead of expiry and on 401 (one refresh at a
//! time, shared by every caller that needs it), and transient failures are
//! retried with exponential backoff and jitter.

pub mod api;
pub mod auth;
pub mod config;

#[cfg(test)]
mod testing;

pub use api::{PipelineError, RequestPipeline, RequestSpec, Response};
pub use auth::{CredentialRecord, SessionEvent, Token, UserProfile};
pub use config::ClientConfig;
