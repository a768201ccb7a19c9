//! Versioned cache storage.
//!
//! ```text
//! CacheStorage (caches)
//!     └── Cache "gastospro-cache-v1"
//!             └── CacheKey (GET + URL) → CacheEntry
//! ```
//!
//! Storage is pluggable through [`CacheBackend`]; the in-memory backend
//! lives as long as the process, the SQLite backend survives restarts.
//! Backend calls are synchronous and run on tokio's blocking pool.

use std::path::Path;
use std::sync::Arc;

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use pwakit_net::{Request, Response};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::{Result, ServiceWorkerError};

mod memory;
mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

// ==================== Keys & Entries ====================

/// Normalized request identity: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: Method::GET.to_string(),
            url: url.into(),
        }
    }

    /// Key for `request`. Only GET requests are cacheable.
    pub fn for_request(request: &Request) -> Result<Self> {
        if request.method != Method::GET {
            return Err(ServiceWorkerError::CacheError(format!(
                "{} {} is not cacheable",
                request.method, request.url
            )));
        }
        Ok(Self::get(&request.url))
    }
}

/// A cached response.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,

    /// Response status.
    pub status: u16,

    /// Response headers, values as raw bytes.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: i64,
}

impl CacheEntry {
    /// Snapshot `response` under `key`.
    pub fn from_response(key: CacheKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        Self {
            key,
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            cached_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Rebuild a response from this entry.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.key.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("corrupt key {}: {}", self.key.url, e)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| ServiceWorkerError::CacheError(format!("corrupt header name: {}", e)))?;
            let value = HeaderValue::from_bytes(value)
                .map_err(|e| ServiceWorkerError::CacheError(format!("corrupt header {}: {}", name, e)))?;
            headers.append(name, value);
        }

        Ok(Response::new(url, status, headers, self.body.clone()))
    }
}

// ==================== Backend ====================

/// Storage engine behind [`CacheStorage`].
///
/// Writes to an existing key replace the previous entry.
pub trait CacheBackend: Send + Sync {
    /// Create the named cache if it does not exist.
    fn open(&mut self, name: &str) -> Result<()>;

    /// Check if a cache exists.
    fn has(&self, name: &str) -> Result<bool>;

    /// All cache names.
    fn names(&self) -> Result<Vec<String>>;

    /// Delete a cache and everything in it.
    fn delete(&mut self, name: &str) -> Result<bool>;

    /// Look up one entry.
    fn get(&self, name: &str, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Store entries in the named cache (created if absent), all or none.
    fn put_all(&mut self, name: &str, entries: Vec<CacheEntry>) -> Result<()>;

    /// Keys stored in the named cache.
    fn keys(&self, name: &str) -> Result<Vec<CacheKey>>;
}

// ==================== Cache Storage ====================

/// Shared handle to the cache store (`caches` global).
///
/// Cheap to clone; every clone sees the same backend.
#[derive(Clone)]
pub struct CacheStorage {
    backend: Arc<RwLock<Box<dyn CacheBackend>>>,
}

impl std::fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStorage").finish_non_exhaustive()
    }
}

impl CacheStorage {
    /// Wrap a backend.
    pub fn with_backend(backend: impl CacheBackend + 'static) -> Self {
        Self {
            backend: Arc::new(RwLock::new(Box::new(backend))),
        }
    }

    /// Process-lifetime storage.
    pub fn in_memory() -> Self {
        Self::with_backend(MemoryBackend::new())
    }

    /// Storage persisted in a SQLite database at `path`.
    pub fn open_sqlite(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_backend(SqliteBackend::open(path)?))
    }

    async fn read<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CacheBackend) -> Result<T> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || op(&**backend.blocking_read()))
            .await
            .map_err(|e| ServiceWorkerError::CacheError(format!("cache task failed: {}", e)))?
    }

    async fn write<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn CacheBackend) -> Result<T> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || {
            let mut backend = backend.blocking_write();
            op(&mut **backend)
        })
        .await
        .map_err(|e| ServiceWorkerError::CacheError(format!("cache task failed: {}", e)))?
    }

    /// Open a cache (creates if it doesn't exist).
    pub async fn open(&self, name: &str) -> Result<Cache> {
        let owned = name.to_string();
        self.write(move |backend| backend.open(&owned)).await?;
        Ok(Cache {
            name: name.to_string(),
            storage: self.clone(),
        })
    }

    /// Handle to an existing cache. Unlike [`open`](Self::open) this never
    /// creates one.
    pub async fn get(&self, name: &str) -> Result<Option<Cache>> {
        if !self.has(name).await? {
            return Ok(None);
        }
        Ok(Some(Cache {
            name: name.to_string(),
            storage: self.clone(),
        }))
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.read(move |backend| backend.has(&name)).await
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let owned = name.to_string();
        let deleted = self.write(move |backend| backend.delete(&owned)).await?;
        if deleted {
            debug!(cache = name, "Cache deleted");
        }
        Ok(deleted)
    }

    /// Get all cache names.
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.read(|backend| backend.names()).await
    }
}

// ==================== Cache ====================

/// Handle to one named cache.
#[derive(Debug, Clone)]
pub struct Cache {
    name: String,
    storage: CacheStorage,
}

impl Cache {
    /// Cache name (version token).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request. Non-GET requests never match.
    pub async fn match_request(&self, request: &Request) -> Result<Option<Response>> {
        if request.method != Method::GET {
            return Ok(None);
        }
        self.match_key(&CacheKey::get(&request.url)).await
    }

    /// Match a GET of `url`.
    pub async fn match_url(&self, url: &Url) -> Result<Option<Response>> {
        self.match_key(&CacheKey::get(url)).await
    }

    async fn match_key(&self, key: &CacheKey) -> Result<Option<Response>> {
        let (name, owned) = (self.name.clone(), key.clone());
        let entry = self
            .storage
            .read(move |backend| backend.get(&name, &owned))
            .await?;
        match entry {
            Some(entry) => {
                trace!(cache = %self.name, url = %key.url, "Cache hit");
                entry.to_response().map(Some)
            }
            None => Ok(None),
        }
    }

    /// Store a response for a GET request, replacing any previous entry.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<()> {
        let key = CacheKey::for_request(request)?;
        let entry = CacheEntry::from_response(key, response);
        let name = self.name.clone();
        self.storage
            .write(move |backend| backend.put_all(&name, vec![entry]))
            .await
    }

    /// Store several responses atomically.
    pub async fn put_all(&self, pairs: &[(Request, Response)]) -> Result<()> {
        let entries = pairs
            .iter()
            .map(|(request, response)| {
                CacheKey::for_request(request).map(|key| CacheEntry::from_response(key, response))
            })
            .collect::<Result<Vec<_>>>()?;
        let name = self.name.clone();
        self.storage
            .write(move |backend| backend.put_all(&name, entries))
            .await
    }

    /// Get all keys.
    pub async fn keys(&self) -> Result<Vec<CacheKey>> {
        let name = self.name.clone();
        self.storage.read(move |backend| backend.keys(&name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn get(url: &str) -> Request {
        Request::parse_get(url).unwrap()
    }

    fn ok(url: &str, body: &'static str) -> Response {
        Response::ok_with_body(Url::parse(url).unwrap(), Bytes::from_static(body.as_bytes()))
    }

    #[test]
    fn test_cache_key_strips_fragment() {
        let a = CacheKey::get(&Url::parse("https://app.test/index.html#top").unwrap());
        let b = CacheKey::get(&Url::parse("https://app.test/index.html").unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn test_cache_key_rejects_non_get() {
        let post = Request::post(Url::parse("https://app.test/api").unwrap(), Bytes::new());
        assert!(CacheKey::for_request(&post).is_err());
    }

    #[test]
    fn test_entry_roundtrip_keeps_headers() {
        let mut response = ok("https://app.test/app.css", "body{}");
        response.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/css"),
        );
        let entry = CacheEntry::from_response(CacheKey::get(&response.url), &response);
        let rebuilt = entry.to_response().unwrap();
        assert_eq!(rebuilt.content_type(), Some("text/css"));
        assert_eq!(rebuilt.body(), response.body());
    }

    #[tokio::test]
    async fn test_non_ascii_header_survives_cache() {
        let disposition = HeaderValue::from_bytes(b"attachment; filename=\"relat\xf3rio.pdf\"").unwrap();
        let mut response = ok("https://app.test/relatorio.pdf", "%PDF");
        response
            .headers
            .insert(http::header::CONTENT_DISPOSITION, disposition.clone());
        let request = get("https://app.test/relatorio.pdf");

        for storage in [
            CacheStorage::in_memory(),
            CacheStorage::with_backend(SqliteBackend::open_in_memory().unwrap()),
        ] {
            let cache = storage.open("v1").await.unwrap();
            cache.put(&request, &response).await.unwrap();

            let hit = cache.match_request(&request).await.unwrap().unwrap();
            assert_eq!(
                hit.headers.get(http::header::CONTENT_DISPOSITION),
                Some(&disposition)
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_sqlite_writes() {
        let storage = CacheStorage::with_backend(SqliteBackend::open_in_memory().unwrap());
        let cache = storage.open("v1").await.unwrap();

        let writes = (0..8).map(|i| {
            let cache = cache.clone();
            async move {
                let url = format!("https://app.test/data/{}.json", i);
                cache.put(&get(&url), &ok(&url, "[]")).await
            }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }

        assert_eq!(cache.keys().await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v1").await.unwrap();

        let request = get("https://app.test/style.css");
        cache
            .put(&request, &ok("https://app.test/style.css", "a"))
            .await
            .unwrap();

        let hit = cache.match_request(&request).await.unwrap().unwrap();
        assert_eq!(hit.body().as_ref(), b"a");
        assert!(cache
            .match_request(&get("https://app.test/other.css"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v1").await.unwrap();
        let request = get("https://app.test/data.json");

        cache.put(&request, &ok("https://app.test/data.json", "1")).await.unwrap();
        cache.put(&request, &ok("https://app.test/data.json", "2")).await.unwrap();

        assert_eq!(cache.keys().await.unwrap().len(), 1);
        let hit = cache.match_request(&request).await.unwrap().unwrap();
        assert_eq!(hit.body().as_ref(), b"2");
    }

    #[tokio::test]
    async fn test_put_rejects_post() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v1").await.unwrap();
        let post = Request::post(Url::parse("https://app.test/api").unwrap(), Bytes::new());

        assert!(cache.put(&post, &ok("https://app.test/api", "x")).await.is_err());
        assert!(cache.keys().await.unwrap().is_empty());
        assert!(cache.match_request(&post).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_all_is_atomic() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v1").await.unwrap();
        let post = Request::post(Url::parse("https://app.test/api").unwrap(), Bytes::new());

        let pairs = vec![
            (get("https://app.test/a.js"), ok("https://app.test/a.js", "a")),
            (post, ok("https://app.test/api", "x")),
        ];
        assert!(cache.put_all(&pairs).await.is_err());
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_storage_delete() {
        let storage = CacheStorage::in_memory();
        assert!(!storage.has("v1").await.unwrap());

        assert!(storage.get("v1").await.unwrap().is_none());
        assert!(!storage.has("v1").await.unwrap());

        storage.open("v1").await.unwrap();
        assert!(storage.has("v1").await.unwrap());
        assert_eq!(storage.get("v1").await.unwrap().unwrap().name(), "v1");

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
    }
}
