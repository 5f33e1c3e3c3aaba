//! Two-generation string cache with bucketed expiry
//!
//! Entries live in a `current` and a `previous` generation. A write that
//! arrives more than one swap interval after the last rotation first rotates
//! the generations (`previous := current`, `current := {}`), so an entry
//! survives between one and two swap intervals unless it is read again.
//!
//! A hit in `previous` is promoted back into `current` by a detached task.
//! The promotion is best-effort: it may race with a concurrent rotation and
//! land in a generation that is about to be dropped, which only costs a
//! future cache miss.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

/// Generational key/value cache shared by cloning.
///
/// Cloning is cheap and every clone observes the same generations. Create one
/// instance per purpose so unrelated key spaces never evict each other.
#[derive(Clone)]
pub struct GenerationalCache {
    inner: Arc<Inner>,
}

struct Inner {
    swap_interval: Duration,
    generations: RwLock<Generations>,
    stats: CacheStats,
}

#[derive(Default)]
struct Generations {
    current: HashMap<String, String>,
    previous: HashMap<String, String>,
    /// `None` until the first write, which always rotates.
    last_swap: Option<Instant>,
}

impl Generations {
    fn rotate_if_due(&mut self, now: Instant, swap_interval: Duration) -> bool {
        let due = self
            .last_swap
            .is_none_or(|last| now.saturating_duration_since(last) > swap_interval);
        if due {
            self.previous = std::mem::take(&mut self.current);
            self.last_swap = Some(now);
        }
        due
    }
}

/// Cache counters tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    rotations: AtomicU64,
}

/// Point-in-time view of the cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Lookups answered from either generation
    pub hits: u64,
    /// Lookups answered from neither generation
    pub misses: u64,
    /// Hits in `previous` that scheduled a promotion
    pub promotions: u64,
    /// Generation rotations performed by writes
    pub rotations: u64,
    /// Entries in `current`
    pub current_len: usize,
    /// Entries in `previous`
    pub previous_len: usize,
}

impl GenerationalCache {
    /// Create an empty cache rotating at most once per `swap_interval`.
    #[must_use]
    pub fn new(swap_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                swap_interval,
                generations: RwLock::new(Generations::default()),
                stats: CacheStats::default(),
            }),
        }
    }

    /// The configured swap interval
    #[must_use]
    pub fn swap_interval(&self) -> Duration {
        self.inner.swap_interval
    }

    /// Insert `value` under `key` in the current generation, rotating first
    /// when the swap interval has elapsed.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.set(key.into(), value.into());
    }

    /// Look up `key`, current generation first.
    ///
    /// Never blocks on I/O and never fetches; `None` is a plain miss.
    pub fn get(&self, key: &str) -> Option<String> {
        let (value, from_previous) = {
            let generations = self.inner.generations.read();
            if let Some(v) = generations.current.get(key) {
                (Some(v.clone()), false)
            } else {
                (generations.previous.get(key).cloned(), true)
            }
        };

        let stats = &self.inner.stats;
        let Some(value) = value else {
            stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        stats.hits.fetch_add(1, Ordering::Relaxed);

        if from_previous {
            stats.promotions.fetch_add(1, Ordering::Relaxed);
            self.promote(key.to_string(), value.clone());
        }
        Some(value)
    }

    /// Current counters and generation sizes
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        let generations = self.inner.generations.read();
        let stats = &self.inner.stats;
        CacheStatsSnapshot {
            hits: stats.hits.load(Ordering::Relaxed),
            misses: stats.misses.load(Ordering::Relaxed),
            promotions: stats.promotions.load(Ordering::Relaxed),
            rotations: stats.rotations.load(Ordering::Relaxed),
            current_len: generations.current.len(),
            previous_len: generations.previous.len(),
        }
    }

    /// Re-insert a value found in `previous` without holding up the reader.
    ///
    /// Outside a tokio runtime there is nothing to detach onto, so the write
    /// happens inline.
    fn promote(&self, key: String, value: String) {
        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                drop(handle.spawn(async move { inner.set(key, value) }));
            }
            Err(_) => inner.set(key, value),
        }
    }
}

impl Inner {
    fn set(&self, key: String, value: String) {
        let mut generations = self.generations.write();
        if generations.rotate_if_due(Instant::now(), self.swap_interval) {
            self.stats.rotations.fetch_add(1, Ordering::Relaxed);
        }
        generations.current.insert(key, value);
    }
}

impl std::fmt::Debug for GenerationalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationalCache")
            .field("swap_interval", &self.inner.swap_interval)
            .field("stats", &self.stats())
            .finish()
    }
}
