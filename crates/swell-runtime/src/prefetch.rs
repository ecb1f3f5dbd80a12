//! Speculative route rendering limits: a per-session token bucket, a
//! per-session concurrency cap and one process-wide semaphore, plus the TTL/LRU
//! cache that successful renders land in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    pub requests_per_sec: u32,
    pub burst: u32,
    pub per_session_concurrency: usize,
    pub render_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            requests_per_sec: 4,
            burst: 4,
            per_session_concurrency: 2,
            render_timeout: Duration::from_millis(500),
            cache_ttl: Duration::from_secs(30),
            cache_capacity: 16,
        }
    }
}

/// Process-wide prefetch concurrency. Built once and handed to the manager.
#[derive(Clone, Debug)]
pub struct PrefetchPool {
    permits: Arc<Semaphore>,
}

impl PrefetchPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for PrefetchPool {
    fn default() -> Self {
        Self::new(64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchRejected {
    RateLimited,
    SessionBusy,
    GlobalBusy,
}

impl PrefetchRejected {
    pub fn label(self) -> &'static str {
        match self {
            PrefetchRejected::RateLimited => "rate_limited",
            PrefetchRejected::SessionBusy => "session_busy",
            PrefetchRejected::GlobalBusy => "global_busy",
        }
    }
}

/// Held for the lifetime of one prefetch render.
#[derive(Debug)]
pub struct PrefetchPermit {
    _session: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

#[derive(Debug)]
struct TokenBucket {
    per_sec: u32,
    burst: u32,
    available: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_sec: u32, burst: u32, now: Instant) -> Self {
        let burst = burst.max(1);
        Self {
            per_sec,
            burst,
            available: burst as f64,
            last_refill: now,
        }
    }

    fn try_take_at(&mut self, now: Instant) -> bool {
        if now > self.last_refill {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.available = (self.available + elapsed * self.per_sec as f64).min(self.burst as f64);
            self.last_refill = now;
        }
        if self.available >= 1.0 {
            self.available -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
pub struct PrefetchLimiter {
    bucket: Mutex<TokenBucket>,
    session_permits: Arc<Semaphore>,
    pool: PrefetchPool,
}

impl PrefetchLimiter {
    pub fn new(config: &PrefetchConfig, pool: PrefetchPool) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(
                config.requests_per_sec,
                config.burst,
                Instant::now(),
            )),
            session_permits: Arc::new(Semaphore::new(config.per_session_concurrency)),
            pool,
        }
    }

    pub fn try_acquire(&self) -> Result<PrefetchPermit, PrefetchRejected> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<PrefetchPermit, PrefetchRejected> {
        if !self.bucket.lock().try_take_at(now) {
            return Err(PrefetchRejected::RateLimited);
        }
        let session = self
            .session_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| PrefetchRejected::SessionBusy)?;
        let global = self
            .pool
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| PrefetchRejected::GlobalBusy)?;
        Ok(PrefetchPermit {
            _session: session,
            _global: global,
        })
    }
}

#[derive(Debug)]
struct CacheEntry<T> {
    value: T,
    inserted: Instant,
    last_used: Instant,
}

/// Canonical path to prefetched render, bounded by TTL and entry count.
#[derive(Debug)]
pub struct PrefetchCache<T> {
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
    ttl: Duration,
    capacity: usize,
}

impl<T> PrefetchCache<T> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&self, path: impl Into<String>, value: T) {
        self.insert_at(path.into(), value, Instant::now());
    }

    fn insert_at(&self, path: String, value: T, now: Instant) {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| now.duration_since(entry.inserted) < self.ttl);
        while entries.len() >= self.capacity && !entries.contains_key(&path) {
            let Some(lru) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            entries.remove(&lru);
        }
        entries.insert(
            path,
            CacheEntry {
                value,
                inserted: now,
                last_used: now,
            },
        );
    }

    pub fn contains_fresh(&self, path: &str) -> bool {
        self.contains_fresh_at(path, Instant::now())
    }

    fn contains_fresh_at(&self, path: &str, now: Instant) -> bool {
        self.entries
            .lock()
            .get(path)
            .is_some_and(|entry| now.duration_since(entry.inserted) < self.ttl)
    }

    /// Removes and returns a fresh entry.
    pub fn take(&self, path: &str) -> Option<T> {
        self.take_at(path, Instant::now())
    }

    fn take_at(&self, path: &str, now: Instant) -> Option<T> {
        let entry = self.entries.lock().remove(path)?;
        (now.duration_since(entry.inserted) < self.ttl).then_some(entry.value)
    }

    pub fn touch(&self, path: &str) {
        if let Some(entry) = self.entries.lock().get_mut(path) {
            entry.last_used = Instant::now();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swell_core::WireNode;

    fn node(text: &str) -> WireNode {
        WireNode::Text {
            hid: None,
            text: text.to_string(),
        }
    }

    fn config(per_sec: u32, burst: u32, per_session: usize) -> PrefetchConfig {
        PrefetchConfig {
            requests_per_sec: per_sec,
            burst,
            per_session_concurrency: per_session,
            ..PrefetchConfig::default()
        }
    }

    #[test_timeout::timeout]
    fn token_bucket_refills_over_time() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, 2, start);
        assert!(bucket.try_take_at(start));
        assert!(bucket.try_take_at(start));
        assert!(!bucket.try_take_at(start));
        assert!(bucket.try_take_at(start + Duration::from_millis(500)));
        assert!(!bucket.try_take_at(start + Duration::from_millis(600)));
    }

    #[test_timeout::timeout]
    fn per_session_permits_are_released_on_drop() {
        let limiter = PrefetchLimiter::new(&config(100, 100, 1), PrefetchPool::new(8));
        let permit = limiter.try_acquire().unwrap();
        assert_eq!(limiter.try_acquire().unwrap_err(), PrefetchRejected::SessionBusy);
        drop(permit);
        assert!(limiter.try_acquire().is_ok());
    }

    #[test_timeout::timeout]
    fn global_pool_is_shared_between_sessions() {
        let pool = PrefetchPool::new(1);
        let first = PrefetchLimiter::new(&config(100, 100, 4), pool.clone());
        let second = PrefetchLimiter::new(&config(100, 100, 4), pool.clone());
        let held = first.try_acquire().unwrap();
        assert_eq!(second.try_acquire().unwrap_err(), PrefetchRejected::GlobalBusy);
        assert_eq!(pool.available(), 0);
        drop(held);
        assert!(second.try_acquire().is_ok());
    }

    #[test_timeout::timeout]
    fn rate_limit_rejects_before_semaphores() {
        let limiter = PrefetchLimiter::new(&config(1, 1, 4), PrefetchPool::new(4));
        let now = Instant::now();
        let _first = limiter.try_acquire_at(now).unwrap();
        assert_eq!(
            limiter.try_acquire_at(now).unwrap_err(),
            PrefetchRejected::RateLimited
        );
    }

    #[test_timeout::timeout]
    fn cache_expires_by_ttl() {
        let cache = PrefetchCache::new(Duration::from_millis(50), 4);
        let now = Instant::now();
        cache.insert_at("/a".into(), node("a"), now);
        assert!(cache.contains_fresh_at("/a", now + Duration::from_millis(10)));
        assert!(!cache.contains_fresh_at("/a", now + Duration::from_millis(60)));
        assert!(cache.take_at("/a", now + Duration::from_millis(60)).is_none());
    }

    #[test_timeout::timeout]
    fn cache_evicts_least_recently_used() {
        let cache = PrefetchCache::new(Duration::from_secs(60), 2);
        let now = Instant::now();
        cache.insert_at("/a".into(), node("a"), now);
        cache.insert_at("/b".into(), node("b"), now + Duration::from_millis(1));
        cache.insert_at("/c".into(), node("c"), now + Duration::from_millis(2));
        assert_eq!(cache.len(), 2);
        assert!(cache.take("/a").is_none());
        assert_eq!(cache.take("/c"), Some(node("c")));
    }
}
