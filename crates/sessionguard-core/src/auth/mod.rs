//! Credential lifecycle: token inspection, storage, and refresh.
//!
//! This module provides:
//! - `token`: claims decoding and expiry checks, no network access
//! - `CredentialStore`: the single token + user record, persisted as a pair
//! - `RefreshCoordinator`: single-flight refresh with queued waiters
//! - `SessionEvents`: session-ended signals for the rest of the client

pub mod credentials;
pub mod events;
pub mod refresh;
pub mod storage;
pub mod token;

pub use credentials::{CredentialRecord, CredentialStore, UserProfile};
pub use events::{EndReason, SessionEvent, SessionEvents};
pub use refresh::{RefreshCoordinator, RefreshError};
pub use storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore, StorageError};
pub use token::{Claims, DecodeError, Token};
