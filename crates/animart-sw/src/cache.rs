//! Cache API: named cache generations holding request → response pairs.

use animart_net::{Request, Response, Url};
use hashbrown::HashMap;
use http::Method;

/// Identity of a cached entry: method + URL without its fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: Method,
    pub url: String,
}

impl CacheKey {
    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self {
            method: Method::GET,
            url: without_fragment(url),
        }
    }

    /// Key for a request.
    pub fn for_request(request: &Request) -> Self {
        Self {
            method: request.method.clone(),
            url: without_fragment(&request.url),
        }
    }
}

fn without_fragment(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// A cached request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Request identity.
    pub key: CacheKey,

    /// Stored response.
    pub response: Response,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    fn new(key: CacheKey, response: Response) -> Self {
        Self {
            key,
            response,
            cached_at: now_millis(),
        }
    }
}

/// A cache instance (one generation).
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request by method + URL.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.entries.get(&CacheKey::for_request(request))
    }

    /// Match a key.
    pub fn match_key(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store a response, overwriting any previous entry for the same key.
    pub fn put(&mut self, key: CacheKey, response: Response) {
        let entry = CacheEntry::new(key.clone(), response);
        self.entries.insert(key, entry);
    }

    /// Store a batch of responses.
    ///
    /// Callers stage the whole batch before calling, so either every pair
    /// lands or (if staging failed) none do.
    pub fn put_all(&mut self, batch: impl IntoIterator<Item = (CacheKey, Response)>) {
        for (key, response) in batch {
            self.put(key, response);
        }
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys.
    pub fn keys(&self) -> Vec<&CacheKey> {
        self.entries.keys().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache storage (caches global).
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Get all cache names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Match across all caches.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.caches
            .values()
            .find_map(|cache| cache.match_request(request))
    }

    /// Match across the named caches, in order.
    pub fn match_in(&self, names: &[&str], request: &Request) -> Option<&CacheEntry> {
        names
            .iter()
            .filter_map(|name| self.caches.get(*name))
            .find_map(|cache| cache.match_request(request))
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
