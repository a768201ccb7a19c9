//! Worker configuration.

use std::path::Path;
use std::time::Duration;

use pwakit_common::{PwaKitError, RetryConfig};
use serde::{Deserialize, Serialize};
use url::Url;

/// What install does when part of the app shell cannot be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPolicy {
    /// Write the app shell only if every entry was fetched; otherwise write
    /// nothing and finish the install anyway.
    #[default]
    AllOrNothing,
    /// Write whatever was fetched and skip the rest.
    BestEffort,
    /// Any failure fails the install and the worker becomes redundant.
    Strict,
}

/// Which failed GET requests receive the offline document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineFallback {
    /// Every failed GET, whatever resource type it asked for.
    #[default]
    AnyRequest,
    /// Only top-level navigations; subresources get a network error.
    NavigationOnly,
}

/// Retry settings for app-shell fetches during install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallRetry {
    /// Total attempts per entry (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for any delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for InstallRetry {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

impl InstallRetry {
    pub fn to_retry_config(&self) -> RetryConfig {
        if self.max_attempts <= 1 {
            return RetryConfig::none();
        }
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..Default::default()
        }
    }
}

/// Fallback values for notification fields.
///
/// Foreground (`SHOW_NOTIFICATION`) and push notifications share icon,
/// badge and click target but differ in body text and tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    /// Title used when the payload has none.
    pub app_name: String,
    pub message_body: String,
    pub push_body: String,
    pub icon: String,
    pub badge: String,
    pub message_tag: String,
    pub push_tag: String,
    /// Click target when `data.url` is absent.
    pub url: String,
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            app_name: "Controle de Gastos PRO".to_string(),
            message_body: "Você tem um lembrete.".to_string(),
            push_body: "Você tem um novo lembrete.".to_string(),
            icon: "icons/icon-192.png".to_string(),
            badge: "icons/icon-192.png".to_string(),
            message_tag: "gastos-pro-manual".to_string(),
            push_tag: "gastos-pro-push".to_string(),
            url: "./index.html".to_string(),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Absolute URL every relative path resolves against.
    pub scope: String,

    /// Version token. Changing it makes the next activation drop every
    /// other cache.
    pub cache_name: String,

    /// Paths cached on install, in order.
    pub app_shell: Vec<String>,

    /// Document served when the network fails.
    pub offline_document: String,

    /// Activate right after install instead of waiting for clients to close.
    pub skip_waiting: bool,

    pub install_policy: InstallPolicy,

    pub install_retry: InstallRetry,

    pub offline_fallback: OfflineFallback,

    pub notifications: NotificationDefaults,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scope: "http://localhost/".to_string(),
            cache_name: "gastospro-cache-v1".to_string(),
            app_shell: vec![
                "./".to_string(),
                "./index.html".to_string(),
                "./manifest.json".to_string(),
                "./config.js".to_string(),
                "./icons/icon-192.png".to_string(),
                "./icons/icon-512.png".to_string(),
            ],
            offline_document: "./index.html".to_string(),
            skip_waiting: true,
            install_policy: InstallPolicy::default(),
            install_retry: InstallRetry::default(),
            offline_fallback: OfflineFallback::default(),
            notifications: NotificationDefaults::default(),
        }
    }
}

impl WorkerConfig {
    /// Default configuration rooted at `scope`.
    pub fn for_scope(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Default::default()
        }
    }

    /// Parse and validate a JSON configuration. Missing keys take defaults.
    pub fn from_json(json: &str) -> Result<Self, PwaKitError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PwaKitError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PwaKitError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check that the scope is absolute and every configured path resolves.
    pub fn validate(&self) -> Result<(), PwaKitError> {
        if self.cache_name.trim().is_empty() {
            return Err(PwaKitError::config("cache_name must not be empty"));
        }
        let scope = self.scope_url()?;
        if scope.cannot_be_a_base() {
            return Err(PwaKitError::config(format!(
                "scope {} cannot be used as a base URL",
                self.scope
            )));
        }
        for path in &self.app_shell {
            self.resolve(path)?;
        }
        self.resolve(&self.offline_document)?;
        self.resolve(&self.notifications.url)?;
        Ok(())
    }

    /// The scope as a URL.
    pub fn scope_url(&self) -> Result<Url, PwaKitError> {
        Url::parse(&self.scope)
            .map_err(|e| PwaKitError::config_with_source(format!("invalid scope {}", self.scope), e))
    }

    /// Resolve a possibly relative path against the scope.
    pub fn resolve(&self, path: &str) -> Result<Url, PwaKitError> {
        self.scope_url()?
            .join(path)
            .map_err(|e| PwaKitError::config_with_source(format!("cannot resolve {}", path), e))
    }

    /// App-shell URLs in manifest order, duplicates removed.
    pub fn app_shell_urls(&self) -> Result<Vec<Url>, PwaKitError> {
        let mut urls: Vec<Url> = Vec::with_capacity(self.app_shell.len());
        for path in &self.app_shell {
            let url = self.resolve(path)?;
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        Ok(urls)
    }

    /// URL of the offline document.
    pub fn offline_url(&self) -> Result<Url, PwaKitError> {
        self.resolve(&self.offline_document)
    }
}
