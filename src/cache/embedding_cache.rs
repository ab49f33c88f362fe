//! Bounded LRU cache for query embeddings. Repeated questions skip the
//! embedding API round-trip entirely.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

pub struct EmbeddingCache {
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingCache {
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, query: &str) -> Option<Vec<f32>> {
        self.cache.lock().unwrap().get(query).cloned()
    }

    pub fn put(&self, query: String, embedding: Vec<f32>) {
        self.cache.lock().unwrap().put(query, embedding);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().unwrap().is_empty()
    }
}
