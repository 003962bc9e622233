use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::storage::{KeyValueStore, StorageError};
use super::token::Token;

const TOKEN_KEY: &str = "token";
const USER_KEY: &str = "user";

/// User record returned alongside a token. Fields the client does not model
/// are preserved in `extra` so they survive a save/load cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Token and user, always stored and replaced together.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialRecord {
    pub token: Token,
    pub user: UserProfile,
}

impl CredentialRecord {
    pub fn new(token: Token, user: UserProfile) -> Self {
        Self { token, user }
    }
}

/// Holder of the single active Credential Record.
///
/// The in-memory copy is authoritative for this process; storage is written
/// through so the session survives restarts.
pub struct CredentialStore {
    storage: Arc<dyn KeyValueStore>,
    current: RwLock<Option<CredentialRecord>>,
}

impl CredentialStore {
    /// Open the store, loading any record left by a previous run.
    pub fn open(storage: Arc<dyn KeyValueStore>) -> Self {
        let current = match Self::load(storage.as_ref()) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Failed to load stored credentials, starting signed out");
                None
            }
        };
        debug!(has_record = current.is_some(), "Credential store opened");
        Self {
            storage,
            current: RwLock::new(current),
        }
    }

    fn load(storage: &dyn KeyValueStore) -> Result<Option<CredentialRecord>, StorageError> {
        let Some(token) = storage.get(TOKEN_KEY)? else {
            return Ok(None);
        };
        let user = match storage.get(USER_KEY)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Stored user record is unreadable, using an empty profile");
                UserProfile::default()
            }),
            None => UserProfile::default(),
        };
        Ok(Some(CredentialRecord::new(Token::new(token), user)))
    }

    pub fn token(&self) -> Option<Token> {
        self.current.read().as_ref().map(|r| r.token.clone())
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.current.read().as_ref().map(|r| r.user.clone())
    }

    pub fn record(&self) -> Option<CredentialRecord> {
        self.current.read().clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.current.read().is_some()
    }

    /// Replace the whole record.
    ///
    /// Memory is updated first, so the session keeps working even if the
    /// write-through fails; the error is still returned for the caller to log.
    pub fn replace(&self, record: CredentialRecord) -> Result<(), StorageError> {
        let user_json = serde_json::to_string(&record.user)?;
        let token = record.token.as_str().to_string();
        *self.current.write() = Some(record);

        self.storage.set(TOKEN_KEY, &token)?;
        if let Err(e) = self.storage.set(USER_KEY, &user_json) {
            // Never leave a token on disk without its user
            if let Err(rollback) = self.storage.remove(TOKEN_KEY) {
                warn!(error = %rollback, "Failed to roll back stored token");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove token and user. Both removals are attempted even if one fails.
    pub fn clear(&self) -> Result<(), StorageError> {
        *self.current.write() = None;
        let token_result = self.storage.remove(TOKEN_KEY);
        let user_result = self.storage.remove(USER_KEY);
        token_result.and(user_result)
    }
}
