//! Application configuration management.
//!
//! Holds the API base URL, refresh timing, and which storage backend keeps
//! the session between runs. Everything has a default, so a missing file is
//! a valid configuration.
//!
//! Configuration is stored at `~/.config/sessionkeeper/config.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::api::{HttpAuthApi, RequestAuthorizer, UnauthenticatedPolicy, REQUEST_TIMEOUT_SECS};
use crate::auth::policy::DEFAULT_REFRESH_THRESHOLD_SECS;
use crate::auth::{
    EncryptedFileStorage, FileStorage, KeyringStorage, RefreshPolicy, SessionCoordinator, SessionOptions,
    SessionStorage, DEFAULT_NAMESPACE, DEFAULT_REFRESH_TIMEOUT_SECS,
};

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "sessionkeeper";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";

/// Overrides `base_url`
pub const ENV_API_URL: &str = "SESSIONKEEPER_API_URL";

/// Passphrase for the encrypted backend. Never written to the config file.
pub const ENV_PASSPHRASE: &str = "SESSIONKEEPER_PASSPHRASE";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Encrypted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub refresh_threshold_secs: i64,
    pub refresh_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub storage_namespace: String,
    pub storage_backend: StorageBackend,
    pub unauthenticated_policy: UnauthenticatedPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            refresh_threshold_secs: DEFAULT_REFRESH_THRESHOLD_SECS,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            storage_namespace: DEFAULT_NAMESPACE.to_string(),
            storage_backend: StorageBackend::default(),
            unauthenticated_policy: UnauthenticatedPolicy::default(),
        }
    }
}

impl Config {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents).with_context(|| format!("Invalid config in {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL).filter(|u| !u.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the session record for file-based backends, and the log file.
    pub fn cache_dir() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir().ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            policy: RefreshPolicy::from_secs(self.refresh_threshold_secs),
            refresh_timeout: Duration::from_secs(self.refresh_timeout_secs),
            ..SessionOptions::default()
        }
    }

    /// Build the configured storage backend rooted at `dir`.
    pub fn storage(&self, dir: &Path, passphrase: Option<String>) -> Result<Arc<dyn SessionStorage>> {
        let storage: Arc<dyn SessionStorage> = match self.storage_backend {
            StorageBackend::File => Arc::new(FileStorage::new(dir, &self.storage_namespace)),
            StorageBackend::Keyring => Arc::new(KeyringStorage::new(&self.storage_namespace)),
            StorageBackend::Encrypted => {
                let passphrase = passphrase
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("{} must be set for encrypted storage", ENV_PASSPHRASE))?;
                Arc::new(EncryptedFileStorage::new(dir, &self.storage_namespace, passphrase))
            }
        };
        Ok(storage)
    }

    pub fn http_client(&self) -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")
    }

    /// Wire the whole session stack against the default session directory.
    pub async fn connect(&self) -> Result<RequestAuthorizer> {
        let storage = self.storage(&Self::cache_dir()?, std::env::var(ENV_PASSPHRASE).ok())?;
        self.connect_with(storage).await
    }

    pub async fn connect_with(&self, storage: Arc<dyn SessionStorage>) -> Result<RequestAuthorizer> {
        let client = self.http_client()?;
        let api = Arc::new(HttpAuthApi::with_client(client.clone(), &self.base_url));
        let session = SessionCoordinator::init(storage, api, self.session_options()).await;
        Ok(RequestAuthorizer::new(
            client,
            &self.base_url,
            session,
            self.unauthenticated_policy,
        ))
    }
}
