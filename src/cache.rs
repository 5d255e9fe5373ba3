//! Counter store backing the local rate limit algorithms.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::algorithms::{LeakyBucketState, TokenBucketState};
use crate::error::ThrottlerResult;
use crate::types::Algorithm;

/// Shared handle to the cache; the mutex serialises every algorithm call.
pub type SharedCache = Arc<Mutex<Box<dyn Cache>>>;

pub fn shared(cache: impl Cache + 'static) -> SharedCache {
    Arc::new(Mutex::new(Box::new(cache)))
}

#[derive(Debug, Clone, PartialEq)]
pub enum BucketState {
    Token(TokenBucketState),
    Leaky(LeakyBucketState),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheItem {
    pub algorithm: Algorithm,
    pub state: BucketState,
    /// Epoch milliseconds after which the item is dropped.
    pub expire_at: u64,
}

/// Key/value store used by the algorithms while the caller holds the lock.
pub trait Cache: Send {
    fn start(&mut self) -> ThrottlerResult<()> {
        Ok(())
    }

    /// Returns the live item for `key`, dropping it first if it expired.
    fn get(&mut self, key: &str, now: u64) -> Option<&mut CacheItem>;

    fn add(&mut self, key: String, item: CacheItem);

    fn remove(&mut self, key: &str);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory cache with a fixed capacity; the least recently used item is
/// evicted when a new key arrives at capacity.
pub struct MemoryCache {
    items: LruCache<String, CacheItem>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.items.cap().get()
    }
}

impl Cache for MemoryCache {
    fn start(&mut self) -> ThrottlerResult<()> {
        tracing::debug!(capacity = self.capacity(), "memory cache started");
        Ok(())
    }

    fn get(&mut self, key: &str, now: u64) -> Option<&mut CacheItem> {
        let expired = self.items.peek(key).map(|item| item.expire_at <= now)?;
        if expired {
            self.items.pop(key);
            return None;
        }
        self.items.get_mut(key)
    }

    fn add(&mut self, key: String, item: CacheItem) {
        let replacing = self.items.contains(&key);
        match self.items.push(key, item) {
            Some((evicted, _)) if !replacing => tracing::trace!(key = %evicted, "evicting cache item"),
            _ => {}
        }
    }

    fn remove(&mut self, key: &str) {
        self.items.pop(key);
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}
