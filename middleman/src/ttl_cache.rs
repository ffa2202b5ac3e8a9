// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! Generic TTL (Time-To-Live) cache for reducing repeated HTTP calls.
//!
//! Thread-safe with automatic expiration. Values are stored atomically so
//! reads never block behind a writer holding the value; only the timestamp
//! sits behind a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// A thread-safe TTL cache for atomic-compatible values.
#[derive(Debug)]
pub struct TtlCache<T: AtomicValue> {
    value: T::Atomic,
    last_updated: RwLock<Option<Instant>>,
    cache_duration: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T: AtomicValue> TtlCache<T> {
    pub fn new(cache_duration: Duration) -> Self {
        Self {
            value: T::new_atomic(T::default_value()),
            last_updated: RwLock::new(None),
            cache_duration,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Return the cached value if it has not expired.
    pub async fn get_if_valid(&self) -> Option<T> {
        let last_updated = self.last_updated.read().await;
        if let Some(updated_at) = *last_updated {
            if updated_at.elapsed() < self.cache_duration {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(T::load(&self.value));
            }
        }
        None
    }

    pub async fn update(&self, value: T) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        T::store(&self.value, value);
        let mut last_updated = self.last_updated.write().await;
        *last_updated = Some(Instant::now());
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Cache statistics for logging.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Types that can be stored atomically in the cache.
pub trait AtomicValue: Copy + Send + Sync + 'static {
    type Atomic: Send + Sync;

    fn new_atomic(value: Self) -> Self::Atomic;
    fn load(atomic: &Self::Atomic) -> Self;
    fn store(atomic: &Self::Atomic, value: Self);
    fn default_value() -> Self;
}

impl AtomicValue for u64 {
    type Atomic = AtomicU64;

    fn new_atomic(value: Self) -> Self::Atomic {
        AtomicU64::new(value)
    }

    fn load(atomic: &Self::Atomic) -> Self {
        atomic.load(Ordering::Acquire)
    }

    fn store(atomic: &Self::Atomic, value: Self) {
        atomic.store(value, Ordering::Release);
    }

    fn default_value() -> Self {
        0
    }
}

// f64 rides on AtomicU64 through its bit pattern; used for exchange rates.
impl AtomicValue for f64 {
    type Atomic = AtomicU64;

    fn new_atomic(value: Self) -> Self::Atomic {
        AtomicU64::new(value.to_bits())
    }

    fn load(atomic: &Self::Atomic) -> Self {
        f64::from_bits(atomic.load(Ordering::Acquire))
    }

    fn store(atomic: &Self::Atomic, value: Self) {
        atomic.store(value.to_bits(), Ordering::Release);
    }

    fn default_value() -> Self {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_starts_empty() {
        let cache = TtlCache::<f64>::with_secs(10);
        assert!(cache.get_if_valid().await.is_none());
    }

    #[tokio::test]
    async fn test_update_and_read() {
        let cache = TtlCache::<f64>::with_secs(10);
        cache.update(65.25).await;
        assert_eq!(cache.get_if_valid().await, Some(65.25));

        cache.update(70.5).await;
        assert_eq!(cache.get_if_valid().await, Some(70.5));
    }

    #[tokio::test]
    async fn test_cache_expiration() {
        let cache = TtlCache::<u64>::new(Duration::from_millis(40));
        cache.update(100).await;
        assert_eq!(cache.get_if_valid().await, Some(100));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get_if_valid().await.is_none());
    }

    #[tokio::test]
    async fn test_cache_stats() {
        let cache = TtlCache::<u64>::with_secs(100);
        cache.update(42).await;
        let _ = cache.get_if_valid().await;
        let _ = cache.get_if_valid().await;

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }
}
