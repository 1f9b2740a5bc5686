use bytes::Bytes;
use lru::LruCache;
use std::{
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// A response captured from an upstream, ready to be replayed to clients.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub content_type: String,
    pub body: Bytes,
}

struct TimedEntry {
    entry: CachedEntry,
    stored_at: Instant,
}

impl TimedEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() < ttl
    }
}

/// A bounded response cache for a single upstream family.
///
/// Entries are evicted least-recently-used first once `capacity` is
/// reached, and are treated as absent once `ttl` has elapsed regardless
/// of how recently they were used.
pub struct MirrorCache {
    entries: Mutex<LruCache<String, TimedEntry>>,
    ttl: Duration,
}

impl MirrorCache {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Look up a fresh entry, marking it as recently used.
    /// An expired entry is pruned and reported as absent.
    pub fn get(&self, key: &str) -> Option<CachedEntry> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(timed) if timed.is_fresh(self.ttl) => Some(timed.entry.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    /// Whether a fresh entry exists for `key`, without touching recency.
    pub fn contains(&self, key: &str) -> bool {
        self.lock()
            .peek(key)
            .is_some_and(|timed| timed.is_fresh(self.ttl))
    }

    /// Insert an entry unless a fresh one is already present.
    ///
    /// The first writer wins so that concurrent requests for the same key
    /// cannot overwrite each other's entry. Returns whether the entry was
    /// actually inserted.
    pub fn put(&self, key: &str, entry: CachedEntry) -> bool {
        let mut entries = self.lock();
        if entries
            .peek(key)
            .is_some_and(|timed| timed.is_fresh(self.ttl))
        {
            return false;
        }
        entries.put(
            key.to_owned(),
            TimedEntry {
                entry,
                stored_at: Instant::now(),
            },
        );
        true
    }

    pub fn remove(&self, key: &str) {
        self.lock().pop(key);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, TimedEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
