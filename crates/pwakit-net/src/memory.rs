//! Scripted in-memory fetcher for offline simulation and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tracing::trace;

use crate::{NetError, NetworkFetcher, Request, Response, Url};

#[derive(Debug, Clone)]
struct Route {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// A fetcher that answers from a route table instead of the network.
///
/// Unknown URLs answer `404`. Taking the fetcher offline makes every
/// request fail with [`NetError::Offline`], including routed ones.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    routes: Mutex<HashMap<String, Route>>,
    offline: AtomicBool,
    failing: Mutex<Vec<String>>,
    latency: Mutex<Option<Duration>>,
    log: Mutex<Vec<(Method, Url)>>,
}

impl MemoryFetcher {
    /// Create an empty, online fetcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` with status 200 at `url`.
    pub fn route(&self, url: &str, body: impl Into<Bytes>) -> &Self {
        self.route_with(url, StatusCode::OK, None, body)
    }

    /// Serve a response with an explicit status and content type.
    pub fn route_with(
        &self,
        url: &str,
        status: StatusCode,
        content_type: Option<&'static str>,
        body: impl Into<Bytes>,
    ) -> &Self {
        let mut headers = HeaderMap::new();
        if let Some(ct) = content_type {
            headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static(ct));
        }
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(
                url.to_string(),
                Route {
                    status,
                    headers,
                    body: body.into(),
                },
            );
        }
        self
    }

    /// Make requests to `url` fail as if the host were unreachable.
    pub fn fail(&self, url: &str) -> &Self {
        if let Ok(mut failing) = self.failing.lock() {
            failing.push(url.to_string());
        }
        self
    }

    /// Toggle simulated connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every answer by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    /// Requests that reached this fetcher, in arrival order.
    pub fn requests(&self) -> Vec<(Method, Url)> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Number of requests that reached this fetcher for `url`.
    pub fn hits(&self, url: &str) -> usize {
        self.requests()
            .iter()
            .filter(|(_, u)| u.as_str() == url)
            .count()
    }

    async fn answer(&self, request: Request) -> Result<Response, NetError> {
        if let Ok(mut log) = self.log.lock() {
            log.push((request.method.clone(), request.url.clone()));
        }

        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let key = request.url.as_str();
        let failing = self
            .failing
            .lock()
            .map(|f| f.iter().any(|u| u == key))
            .unwrap_or(false);
        if self.offline.load(Ordering::SeqCst) || failing {
            trace!(url = %request.url, "Simulated network failure");
            return Err(NetError::Offline(request.url.to_string()));
        }

        let route = self
            .routes
            .lock()
            .ok()
            .and_then(|routes| routes.get(key).cloned());

        Ok(match route {
            Some(route) => Response::new(request.url, route.status, route.headers, route.body),
            None => Response::new(request.url, StatusCode::NOT_FOUND, HeaderMap::new(), ""),
        })
    }
}

impl NetworkFetcher for MemoryFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(self.answer(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_and_not_found() {
        let fetcher = MemoryFetcher::new();
        fetcher.route("https://app.test/index.html", "<html>");

        let hit = fetcher
            .fetch(Request::parse_get("https://app.test/index.html").unwrap())
            .await
            .unwrap();
        assert_eq!(hit.body().as_ref(), b"<html>");

        let miss = fetcher
            .fetch(Request::parse_get("https://app.test/nope").unwrap())
            .await
            .unwrap();
        assert_eq!(miss.status, StatusCode::NOT_FOUND);
        assert_eq!(fetcher.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_offline_fails_everything() {
        let fetcher = MemoryFetcher::new();
        fetcher.route("https://app.test/", "root");
        fetcher.set_offline(true);

        let err = fetcher
            .fetch(Request::parse_get("https://app.test/").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Offline(_)));
        assert_eq!(fetcher.hits("https://app.test/"), 1);
    }

    #[tokio::test]
    async fn test_single_failing_url() {
        let fetcher = MemoryFetcher::new();
        fetcher
            .route("https://app.test/a.js", "a")
            .route("https://app.test/b.js", "b")
            .fail("https://app.test/b.js");

        assert!(fetcher
            .fetch(Request::parse_get("https://app.test/a.js").unwrap())
            .await
            .is_ok());
        assert!(fetcher
            .fetch(Request::parse_get("https://app.test/b.js").unwrap())
            .await
            .is_err());
    }
}
