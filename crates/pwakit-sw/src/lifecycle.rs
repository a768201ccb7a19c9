//! Worker lifecycle: identity, state machine and the versioned cache manager.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use pwakit_common::retry_with_backoff;
use pwakit_net::{NetError, NetworkFetcher, Request, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{Cache, CacheStorage};
use crate::config::{InstallPolicy, WorkerConfig};
use crate::{Result, ServiceWorkerError};

// ==================== Types ====================

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ServiceWorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

impl ServiceWorkerState {
    /// Check whether `next` may follow this state.
    pub fn can_transition_to(self, next: ServiceWorkerState) -> bool {
        use ServiceWorkerState::*;
        match (self, next) {
            (Redundant, _) => false,
            (_, Redundant) => true,
            (Parsed, Installing)
            | (Installing, Installed)
            | (Installed, Activating)
            | (Activating, Activated) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        }
    }
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==================== Service Worker ====================

/// Lifecycle record of one worker instance.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Version token this instance reads and writes.
    pub cache_name: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: DateTime<Utc>,
}

impl ServiceWorker {
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            cache_name: cache_name.into(),
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Utc::now(),
        }
    }

    /// Move to `state`, rejecting transitions the lifecycle does not allow.
    pub fn set_state(&mut self, state: ServiceWorkerState) -> Result<()> {
        if !self.state.can_transition_to(state) {
            return Err(ServiceWorkerError::StateError(format!(
                "{} cannot go from {} to {}",
                self.id, self.state, state
            )));
        }
        debug!(worker = %self.id, from = %self.state, to = %state, "Worker state change");
        self.state = state;
        self.state_changed_at = Utc::now();
        Ok(())
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Cache Manager ====================

/// Outcome of populating the app shell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstallReport {
    /// Version token that was populated.
    pub cache_name: String,
    /// URLs now stored in the cache.
    pub cached: Vec<Url>,
    /// URLs that could not be fetched or stored, with the reason.
    pub failed: Vec<(Url, String)>,
}

impl InstallReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns the versioned cache: populates it on install, prunes on activation.
pub struct CacheManager {
    config: Arc<WorkerConfig>,
    storage: CacheStorage,
    fetcher: Arc<dyn NetworkFetcher>,
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("cache_name", &self.config.cache_name)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    pub fn new(
        config: Arc<WorkerConfig>,
        storage: CacheStorage,
        fetcher: Arc<dyn NetworkFetcher>,
    ) -> Self {
        Self {
            config,
            storage,
            fetcher,
        }
    }

    /// Current version token.
    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    /// Open the current cache.
    pub async fn current(&self) -> Result<Cache> {
        self.storage.open(&self.config.cache_name).await
    }

    async fn fetch_shell_entry(&self, url: Url) -> std::result::Result<Response, NetError> {
        let retry = self.config.install_retry.to_retry_config();
        retry_with_backoff(
            &retry,
            || {
                let request = Request::get(url.clone());
                async move { self.fetcher.fetch(request).await?.error_for_status() }
            },
            NetError::is_retryable,
        )
        .await
    }

    /// Populate the current cache with the app shell.
    ///
    /// Every entry is fetched before anything is written. What happens to
    /// a partial result depends on [`InstallPolicy`]; only `Strict` turns a
    /// failure into an error.
    pub async fn install(&self) -> Result<InstallReport> {
        let policy = self.config.install_policy;
        let urls = self.config.app_shell_urls()?;
        let cache = self.current().await?;

        info!(cache = %cache.name(), entries = urls.len(), ?policy, "Populating app shell");

        let results = join_all(urls.into_iter().map(|url| async move {
            let result = self.fetch_shell_entry(url.clone()).await;
            (url, result)
        }))
        .await;

        let mut report = InstallReport {
            cache_name: cache.name().to_string(),
            ..Default::default()
        };
        let mut fetched = Vec::new();
        for (url, result) in results {
            match result {
                Ok(response) => fetched.push((Request::get(url), response)),
                Err(e) => {
                    warn!(url = %url, error = %e, "App shell entry failed");
                    report.failed.push((url, e.to_string()));
                }
            }
        }

        let write = match policy {
            InstallPolicy::AllOrNothing if !report.failed.is_empty() => {
                warn!(
                    failed = report.failed.len(),
                    "App shell incomplete, nothing cached"
                );
                false
            }
            InstallPolicy::Strict if !report.failed.is_empty() => {
                return Err(ServiceWorkerError::InstallFailed(format!(
                    "{} of the app shell could not be fetched: {}",
                    report.failed.len(),
                    report
                        .failed
                        .iter()
                        .map(|(url, _)| url.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
            _ => true,
        };

        if !write || fetched.is_empty() {
            if write {
                debug!("Nothing to cache");
            } else {
                report
                    .failed
                    .extend(fetched.into_iter().map(|(r, _)| (r.url, "not written".to_string())));
            }
            return Ok(report);
        }

        match cache.put_all(&fetched).await {
            Ok(()) => {
                report.cached = fetched.into_iter().map(|(request, _)| request.url).collect();
                info!(cache = %cache.name(), cached = report.cached.len(), "App shell cached");
            }
            Err(e) if policy == InstallPolicy::Strict => return Err(e),
            Err(e) => {
                warn!(category = e.category(), error = %e, "App shell write failed");
                let reason = e.to_string();
                report
                    .failed
                    .extend(fetched.into_iter().map(|(r, _)| (r.url, reason.clone())));
            }
        }

        Ok(report)
    }

    /// Delete every cache except the current one. Returns the deleted names.
    pub async fn activate(&self) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for name in self.storage.keys().await? {
            if name != self.config.cache_name && self.storage.delete(&name).await? {
                deleted.push(name);
            }
        }

        if !deleted.is_empty() {
            info!(kept = %self.config.cache_name, deleted = ?deleted, "Stale caches deleted");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pwakit_net::MemoryFetcher;

    const ORIGIN: &str = "https://app.test/";

    fn config(policy: InstallPolicy) -> Arc<WorkerConfig> {
        Arc::new(WorkerConfig {
            app_shell: vec!["./".into(), "./index.html".into(), "./config.js".into()],
            install_policy: policy,
            ..WorkerConfig::for_scope(ORIGIN)
        })
    }

    fn full_origin() -> Arc<MemoryFetcher> {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher
            .route("https://app.test/", "<html>root</html>")
            .route("https://app.test/index.html", "<html>index</html>")
            .route("https://app.test/config.js", "window.CONFIG = {}");
        fetcher
    }

    fn manager(policy: InstallPolicy, fetcher: Arc<MemoryFetcher>) -> (CacheManager, CacheStorage) {
        let storage = CacheStorage::in_memory();
        (
            CacheManager::new(config(policy), storage.clone(), fetcher),
            storage,
        )
    }

    #[test]
    fn test_state_transitions() {
        let mut worker = ServiceWorker::new("v1");
        assert_eq!(worker.state, ServiceWorkerState::Parsed);

        assert!(worker.set_state(ServiceWorkerState::Activated).is_err());
        worker.set_state(ServiceWorkerState::Installing).unwrap();
        worker.set_state(ServiceWorkerState::Installed).unwrap();
        worker.set_state(ServiceWorkerState::Activating).unwrap();
        worker.set_state(ServiceWorkerState::Activated).unwrap();
        assert!(worker.is_active());

        worker.set_state(ServiceWorkerState::Redundant).unwrap();
        assert!(worker.set_state(ServiceWorkerState::Installing).is_err());
        assert!(worker.is_redundant());
    }

    #[test]
    fn test_worker_ids_unique() {
        assert_ne!(ServiceWorkerId::new(), ServiceWorkerId::new());
    }

    #[tokio::test]
    async fn test_install_caches_every_shell_entry() {
        let (manager, _) = manager(InstallPolicy::AllOrNothing, full_origin());
        let report = manager.install().await.unwrap();
        assert!(report.is_complete());

        let keys = manager.current().await.unwrap().keys().await.unwrap();
        let urls: Vec<_> = keys.iter().map(|k| k.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://app.test/",
                "https://app.test/config.js",
                "https://app.test/index.html"
            ]
        );
    }

    #[tokio::test]
    async fn test_all_or_nothing_writes_nothing_on_failure() {
        let fetcher = full_origin();
        fetcher.fail("https://app.test/config.js");
        let (manager, storage) = manager(InstallPolicy::AllOrNothing, fetcher);

        let report = manager.install().await.unwrap();
        assert_eq!(report.failed.len(), 3);
        assert!(report.cached.is_empty());
        assert!(storage.has("gastospro-cache-v1").await.unwrap());
        assert!(manager.current().await.unwrap().keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_success_status_counts_as_failure() {
        let fetcher = full_origin();
        fetcher.route_with(
            "https://app.test/config.js",
            http::StatusCode::NOT_FOUND,
            None,
            "missing",
        );
        let (manager, _) = manager(InstallPolicy::AllOrNothing, fetcher);

        let report = manager.install().await.unwrap();
        assert!(!report.is_complete());
        assert!(manager.current().await.unwrap().keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_best_effort_keeps_successes() {
        let fetcher = full_origin();
        fetcher.fail("https://app.test/config.js");
        let (manager, _) = manager(InstallPolicy::BestEffort, fetcher);

        let report = manager.install().await.unwrap();
        assert_eq!(report.cached.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(manager.current().await.unwrap().keys().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_strict_fails_install() {
        let fetcher = full_origin();
        fetcher.fail("https://app.test/index.html");
        let (manager, _) = manager(InstallPolicy::Strict, fetcher);

        let err = manager.install().await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InstallFailed(_)));
        assert!(manager.current().await.unwrap().keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_install_retries_transient_failures() {
        let fetcher = full_origin();
        fetcher.set_offline(true);
        let config = Arc::new(WorkerConfig {
            app_shell: vec!["./index.html".into()],
            install_retry: crate::config::InstallRetry {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 1,
            },
            ..WorkerConfig::for_scope(ORIGIN)
        });
        let manager = CacheManager::new(config, CacheStorage::in_memory(), fetcher.clone());

        let report = manager.install().await.unwrap();
        assert!(!report.is_complete());
        assert_eq!(fetcher.hits("https://app.test/index.html"), 3);
    }

    #[tokio::test]
    async fn test_activate_prunes_stale_caches() {
        let (manager, storage) = manager(InstallPolicy::AllOrNothing, full_origin());
        storage.open("gastospro-cache-v0").await.unwrap();
        storage.open("unrelated").await.unwrap();
        manager.install().await.unwrap();

        let mut deleted = manager.activate().await.unwrap();
        deleted.sort();
        assert_eq!(deleted, vec!["gastospro-cache-v0", "unrelated"]);
        assert_eq!(storage.keys().await.unwrap(), vec!["gastospro-cache-v1"]);
    }
}
