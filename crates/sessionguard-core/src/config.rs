//! Client configuration management.
//!
//! Configuration is stored at `~/.config/sessionguard/config.json`. Every
//! field has a default, so a missing file or a partial file both work.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::retry::{
    RetryPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_JITTER_MS,
    DEFAULT_RETRY_BUDGET,
};
use crate::auth::storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore};

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "sessionguard";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Hard timeout for ordinary calls.
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Health checks should fail fast.
const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 5_000;

/// Calls slower than this are logged.
const DEFAULT_SLOW_REQUEST_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub health_timeout_ms: u64,
    pub retry_budget: u32,
    pub backoff_base_ms: u64,
    pub backoff_jitter_ms: u64,
    pub backoff_cap_ms: u64,
    pub slow_request_ms: u64,
    pub refresh_path: String,
    pub logout_path: String,
    pub health_path: String,
    /// Paths that never trigger a token refresh (login, registration, ...).
    pub auth_paths: Vec<String>,
    pub storage: StorageBackend,
    /// Overrides the cache directory used by the file backend.
    pub storage_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            health_timeout_ms: DEFAULT_HEALTH_TIMEOUT_MS,
            retry_budget: DEFAULT_RETRY_BUDGET,
            backoff_base_ms: DEFAULT_BASE_DELAY_MS,
            backoff_jitter_ms: DEFAULT_MAX_JITTER_MS,
            backoff_cap_ms: DEFAULT_MAX_DELAY_MS,
            slow_request_ms: DEFAULT_SLOW_REQUEST_MS,
            refresh_path: "/auth/refresh".to_string(),
            logout_path: "/auth/logout".to_string(),
            health_path: "/health".to_string(),
            auth_paths: vec![
                "/auth/login".to_string(),
                "/auth/register".to_string(),
                "/auth/refresh".to_string(),
                "/auth/logout".to_string(),
            ],
            storage: StorageBackend::default(),
            storage_dir: None,
        }
    }
}

impl ClientConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::from_json(&contents)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("Failed to parse config file")
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.storage_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn slow_request_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_request_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            budget: self.retry_budget.max(1),
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_jitter: Duration::from_millis(self.backoff_jitter_ms),
            max_delay: Duration::from_millis(self.backoff_cap_ms),
        }
    }

    /// True for endpoints that must never trigger a refresh themselves.
    pub fn is_auth_path(&self, path: &str) -> bool {
        let path = path.split(&['?', '#'][..]).next().unwrap_or(path);
        path == self.refresh_path || path == self.logout_path || self.auth_paths.iter().any(|p| p == path)
    }

    /// Open the configured credential storage backend.
    pub fn open_storage(&self) -> Result<Arc<dyn KeyValueStore>> {
        Ok(match self.storage {
            StorageBackend::File => Arc::new(FileStore::new(self.cache_dir()?)),
            StorageBackend::Keyring => {
                if !KeyringStore::is_durable() {
                    warn!("No platform keychain on this system; the session will not survive a restart");
                }
                Arc::new(KeyringStore::new(APP_NAME))
            }
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        })
    }
}
