//! Result cache: the backend contract, the in-memory reference backend,
//! and the backend registry.
//!
//! Backends never fail the query path. Read errors degrade to misses,
//! write errors to no-ops; the engine always falls through to a live
//! computation.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use tallydb_api::{ActorTotal, Scope};
use tracing::warn;

/// Key of one cached result set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub signature: String,
    pub scope: Scope,
}

/// A pluggable result-cache backend.
pub trait QueryCache: Send + Sync {
    /// The slug this backend is registered and indexed under.
    fn slug(&self) -> &str;

    fn get(&self, key: &CacheKey) -> Option<Vec<ActorTotal>>;

    fn set(&self, key: &CacheKey, value: &[ActorTotal]);

    fn delete(&self, key: &CacheKey);
}

struct CachedValue {
    rows: Vec<ActorTotal>,
    expires_at: Option<Instant>,
}

/// In-memory LRU backend with an optional per-entry TTL.
///
/// Entries for the two scopes live in separate stores, mirroring how a
/// network-wide deployment keeps network entries in a network-scope
/// store.
pub struct MemoryCache {
    slug: String,
    ttl: Option<Duration>,
    site: Mutex<LruCache<String, CachedValue>>,
    network: Mutex<LruCache<String, CachedValue>>,
}

impl MemoryCache {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(slug: impl Into<String>) -> Self {
        Self::with_capacity(slug, Self::DEFAULT_CAPACITY, None)
    }

    pub fn with_capacity(
        slug: impl Into<String>,
        capacity: usize,
        ttl: Option<Duration>,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        MemoryCache {
            slug: slug.into(),
            ttl,
            site: Mutex::new(LruCache::new(capacity)),
            network: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn store(&self, scope: Scope) -> &Mutex<LruCache<String, CachedValue>> {
        match scope {
            Scope::Site => &self.site,
            Scope::Network => &self.network,
        }
    }
}

impl QueryCache for MemoryCache {
    fn slug(&self) -> &str {
        &self.slug
    }

    fn get(&self, key: &CacheKey) -> Option<Vec<ActorTotal>> {
        let mut store = match self.store(key.scope).lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(slug = %self.slug, "cache store poisoned, treating as miss");
                return None;
            }
        };

        let now = Instant::now();
        let live = match store.get(&key.signature) {
            None => return None,
            Some(value) => value.expires_at.is_none_or(|at| now < at),
        };

        if live {
            store.get(&key.signature).map(|value| value.rows.clone())
        } else {
            store.pop(&key.signature);
            None
        }
    }

    fn set(&self, key: &CacheKey, value: &[ActorTotal]) {
        let mut store = match self.store(key.scope).lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(slug = %self.slug, "cache store poisoned, dropping write");
                return;
            }
        };

        store.put(
            key.signature.clone(),
            CachedValue {
                rows: value.to_vec(),
                expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn delete(&self, key: &CacheKey) {
        if let Ok(mut store) = self.store(key.scope).lock() {
            store.pop(&key.signature);
        }
    }
}

/// Explicit slug -> backend map, injected into the engine at
/// construction.
#[derive(Clone, Default)]
pub struct CacheRegistry {
    backends: HashMap<String, Arc<dyn QueryCache>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn QueryCache>) {
        self.backends.insert(backend.slug().to_string(), backend);
    }

    pub fn get(&self, slug: &str) -> Option<Arc<dyn QueryCache>> {
        self.backends.get(slug).cloned()
    }
}
