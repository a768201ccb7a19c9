//! Fetch interception: cache first, then network, then the offline document.

use std::fmt;
use std::sync::Arc;

use http::Method;
use pwakit_net::{NetworkFetcher, Request, Response};
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::{Cache, CacheStorage};
use crate::config::{OfflineFallback, WorkerConfig};
use crate::lifetime::LifetimeTracker;

/// An intercepted outbound request.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: Request,
    /// Page that issued the request, if known.
    pub client_id: Option<String>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }

    pub fn from_client(request: Request, client_id: impl Into<String>) -> Self {
        Self {
            request,
            client_id: Some(client_id.into()),
        }
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    OfflineFallback,
}

/// What the worker decided for a fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Not intercepted; the host performs the request itself.
    Passthrough,
    /// Answer with this response.
    Respond {
        response: Response,
        source: ResponseSource,
    },
    /// Answer with a network error (status 0).
    NetworkError,
}

impl FetchOutcome {
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Respond { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            FetchOutcome::Respond { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, FetchOutcome::Passthrough)
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, FetchOutcome::NetworkError)
    }
}

/// Answers GET requests from the current cache, filling it from the network.
pub struct FetchInterceptor {
    config: Arc<WorkerConfig>,
    storage: CacheStorage,
    fetcher: Arc<dyn NetworkFetcher>,
    tracker: LifetimeTracker,
}

impl fmt::Debug for FetchInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchInterceptor")
            .field("cache_name", &self.config.cache_name)
            .field("offline_fallback", &self.config.offline_fallback)
            .finish_non_exhaustive()
    }
}

impl FetchInterceptor {
    pub fn new(
        config: Arc<WorkerConfig>,
        storage: CacheStorage,
        fetcher: Arc<dyn NetworkFetcher>,
        tracker: LifetimeTracker,
    ) -> Self {
        Self {
            config,
            storage,
            fetcher,
            tracker,
        }
    }

    /// Decide the response for one request. Never fails: every error
    /// degrades to the next source.
    pub async fn handle(&self, event: FetchEvent) -> FetchOutcome {
        let request = event.request;
        if request.method != Method::GET {
            debug!(method = %request.method, url = %request.url, "Not intercepted");
            return FetchOutcome::Passthrough;
        }

        let cache = self.current_cache().await;
        if let Some(cache) = &cache {
            match cache.match_request(&request).await {
                Ok(Some(response)) => {
                    trace!(url = %request.url, "Served from cache");
                    return FetchOutcome::Respond {
                        response,
                        source: ResponseSource::Cache,
                    };
                }
                Ok(None) => {}
                Err(e) => warn!(url = %request.url, error = %e, "Cache lookup failed"),
            }
        }

        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                debug!(url = %request.url, status = %response.status, "Served from network");
                self.store_in_background(request, response.clone());
                FetchOutcome::Respond {
                    response,
                    source: ResponseSource::Network,
                }
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed");
                self.offline_fallback(&request, cache.as_ref()).await
            }
        }
    }

    async fn current_cache(&self) -> Option<Cache> {
        match self.storage.get(&self.config.cache_name).await {
            Ok(cache) => cache,
            Err(e) => {
                warn!(cache = %self.config.cache_name, error = %e, "Cache unavailable");
                None
            }
        }
    }

    /// Write the response to the current cache without holding up the reply.
    ///
    /// A cache that is gone by the time the write runs was pruned by a newer
    /// version and is not recreated.
    fn store_in_background(&self, request: Request, response: Response) {
        let storage = self.storage.clone();
        let name = self.config.cache_name.clone();

        self.tracker.extend("cache-put", async move {
            let result = async {
                match storage.get(&name).await? {
                    Some(cache) => cache.put(&request, &response).await.map(|_| true),
                    None => Ok(false),
                }
            }
            .await;
            match result {
                Ok(true) => {}
                Ok(false) => debug!(cache = %name, url = %request.url, "Cache gone, write skipped"),
                Err(e) => warn!(url = %request.url, error = %e, "Cache write failed"),
            }
            Ok(())
        });
    }

    async fn offline_fallback(&self, request: &Request, cache: Option<&Cache>) -> FetchOutcome {
        if self.config.offline_fallback == OfflineFallback::NavigationOnly && !request.is_navigation()
        {
            return FetchOutcome::NetworkError;
        }

        let offline_url: Url = match self.config.offline_url() {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Offline document unresolvable");
                return FetchOutcome::NetworkError;
            }
        };

        let cache = match cache {
            Some(cache) => cache.clone(),
            None => match self.current_cache().await {
                Some(cache) => cache,
                None => return FetchOutcome::NetworkError,
            },
        };

        match cache.match_url(&offline_url).await {
            Ok(Some(response)) => {
                debug!(url = %request.url, offline = %offline_url, "Served offline document");
                FetchOutcome::Respond {
                    response,
                    source: ResponseSource::OfflineFallback,
                }
            }
            Ok(None) => FetchOutcome::NetworkError,
            Err(e) => {
                warn!(error = %e, "Offline document lookup failed");
                FetchOutcome::NetworkError
            }
        }
    }
}
