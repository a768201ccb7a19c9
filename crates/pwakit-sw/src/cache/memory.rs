//! Process-lifetime cache backend.

use hashbrown::HashMap;

use super::{CacheBackend, CacheEntry, CacheKey};
use crate::Result;

/// One named cache.
#[derive(Debug, Default)]
struct MemoryCache {
    entries: HashMap<CacheKey, CacheEntry>,
}

/// Cache backend that keeps everything in a map.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    caches: HashMap<String, MemoryCache>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryBackend {
    fn open(&mut self, name: &str) -> Result<()> {
        self.caches.entry(name.to_string()).or_default();
        Ok(())
    }

    fn has(&self, name: &str) -> Result<bool> {
        Ok(self.caches.contains_key(name))
    }

    fn names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.caches.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn delete(&mut self, name: &str) -> Result<bool> {
        Ok(self.caches.remove(name).is_some())
    }

    fn get(&self, name: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(self
            .caches
            .get(name)
            .and_then(|cache| cache.entries.get(key))
            .cloned())
    }

    fn put_all(&mut self, name: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let cache = self.caches.entry(name.to_string()).or_default();
        for entry in entries {
            cache.entries.insert(entry.key.clone(), entry);
        }
        Ok(())
    }

    fn keys(&self, name: &str) -> Result<Vec<CacheKey>> {
        let mut keys: Vec<CacheKey> = self
            .caches
            .get(name)
            .map(|cache| cache.entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn entry(url: &str, body: &[u8]) -> CacheEntry {
        CacheEntry {
            key: CacheKey::get(&Url::parse(url).unwrap()),
            status: 200,
            headers: Vec::new(),
            body: body.to_vec(),
            cached_at: 0,
        }
    }

    #[test]
    fn test_names_sorted() {
        let mut backend = MemoryBackend::new();
        backend.open("v2").unwrap();
        backend.open("v1").unwrap();
        backend.open("v2").unwrap();
        assert_eq!(backend.names().unwrap(), vec!["v1", "v2"]);
    }

    #[test]
    fn test_put_creates_cache() {
        let mut backend = MemoryBackend::new();
        backend
            .put_all("v1", vec![entry("https://app.test/a.js", b"a")])
            .unwrap();
        assert!(backend.has("v1").unwrap());
        assert_eq!(backend.keys("v1").unwrap().len(), 1);
    }

    #[test]
    fn test_caches_are_isolated() {
        let mut backend = MemoryBackend::new();
        let e = entry("https://app.test/a.js", b"a");
        backend.put_all("v1", vec![e.clone()]).unwrap();
        assert!(backend.get("v2", &e.key).unwrap().is_none());
        assert!(backend.get("v1", &e.key).unwrap().is_some());
    }
}
