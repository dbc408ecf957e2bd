//! Metrics response cache
//!
//! Recent snapshots per mint with an adjustable freshness TTL. Entries older
//! than the TTL are not served as fresh but remain usable as stale fallbacks
//! up to `max_stale_secs`.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::MetricsSnapshot;

/// Configuration for the metrics cache
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum cached mints
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Freshness TTL under normal latency
    #[serde(default = "default_base_ttl_secs")]
    pub base_ttl_secs: u64,
    /// Upper bound for the TTL when upstream latency is high
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,
    /// Oldest snapshot usable as a stale fallback
    #[serde(default = "default_max_stale_secs")]
    pub max_stale_secs: u64,
}

fn default_capacity() -> usize {
    5_000
}
fn default_base_ttl_secs() -> u64 {
    15
}
fn default_max_ttl_secs() -> u64 {
    120
}
fn default_max_stale_secs() -> u64 {
    600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            base_ttl_secs: default_base_ttl_secs(),
            max_ttl_secs: default_max_ttl_secs(),
            max_stale_secs: default_max_stale_secs(),
        }
    }
}

#[derive(Clone)]
struct CachedMetrics {
    snapshot: MetricsSnapshot,
    cached_at: Instant,
}

/// Cache statistics for monitoring
#[derive(Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub stale_served: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Serializable view of [`CacheStats`]
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub entries: usize,
    pub ttl_ms: u64,
    pub hits: u64,
    pub misses: u64,
    pub stale_served: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

pub struct MetricsCache {
    config: CacheConfig,
    entries: DashMap<String, CachedMetrics>,
    ttl_ms: AtomicU64,
    stats: CacheStats,
}

impl MetricsCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::with_capacity(config.capacity.min(1024)),
            ttl_ms: AtomicU64::new(config.base_ttl_secs * 1000),
            stats: CacheStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }

    /// Set the freshness TTL, bounded to [base, max]
    pub fn set_ttl(&self, ttl: Duration) -> Duration {
        let bounded = ttl.clamp(
            Duration::from_secs(self.config.base_ttl_secs),
            Duration::from_secs(self.config.max_ttl_secs),
        );
        self.ttl_ms
            .store(bounded.as_millis() as u64, Ordering::Relaxed);
        bounded
    }

    /// Snapshot younger than the current TTL
    pub fn get_fresh(&self, mint: &str) -> Option<MetricsSnapshot> {
        let ttl = self.ttl();
        if let Some(entry) = self.entries.get(mint) {
            if entry.cached_at.elapsed() <= ttl {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.snapshot.clone());
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Snapshot no older than `max_stale_secs`, with its age
    pub fn get_stale(&self, mint: &str) -> Option<(MetricsSnapshot, Duration)> {
        let max_stale = Duration::from_secs(self.config.max_stale_secs);
        let entry = self.entries.get(mint)?;
        let age = entry.cached_at.elapsed();
        if age > max_stale {
            drop(entry);
            self.entries.remove(mint);
            return None;
        }
        self.stats.stale_served.fetch_add(1, Ordering::Relaxed);
        Some((entry.snapshot.clone(), age))
    }

    pub fn insert(&self, mint: &str, snapshot: MetricsSnapshot) {
        if !self.entries.contains_key(mint) && self.entries.len() >= self.config.capacity {
            // Make room: ~10% of capacity
            self.evict_fraction(0.1);
        }
        self.entries.insert(
            mint.to_string(),
            CachedMetrics {
                snapshot,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, mint: &str) {
        self.entries.remove(mint);
    }

    /// Evict about `fraction` of the entries: entries beyond the stale
    /// window first, then the oldest. Returns the number removed.
    pub fn evict_fraction(&self, fraction: f64) -> usize {
        let len = self.entries.len();
        if len == 0 {
            return 0;
        }
        let target = ((len as f64 * fraction.clamp(0.0, 1.0)).ceil() as usize).max(1);
        let max_stale = Duration::from_secs(self.config.max_stale_secs);

        let mut by_age: Vec<(String, Duration)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.cached_at.elapsed()))
            .collect();
        by_age.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = 0;
        for (key, age) in by_age {
            if removed >= target && age <= max_stale {
                break;
            }
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        self.stats
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn report(&self) -> CacheReport {
        CacheReport {
            entries: self.entries.len(),
            ttl_ms: self.ttl().as_millis() as u64,
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            stale_served: self.stats.stale_served.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            hit_rate: self.stats.hit_rate(),
        }
    }
}
