//! Uniform contract over one cache tier.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::entry::{CacheEntry, Clock, EntryMeta, KeyPattern};
use crate::error::CacheError;

/// Position of an adapter in the priority chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Memory,
    Persistent,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Memory => "memory",
            Tier::Persistent => "persistent",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdapterStats {
    pub count: u64,
    pub approx_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// One cache tier. Reads of expired entries behave exactly like misses.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    fn tier(&self) -> Tier;

    fn clock(&self) -> Clock;

    /// Fetch a live entry with its metadata and absolute expiry.
    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Store an entry as-is, keeping its absolute expiry.
    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every entry matching `pattern` (all entries when `None`).
    async fn clear(&self, pattern: Option<&KeyPattern>) -> Result<u64, CacheError>;

    async fn keys(&self, pattern: Option<&KeyPattern>) -> Result<Vec<String>, CacheError>;

    async fn stats(&self) -> Result<AdapterStats, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        Ok(self.get_entry(key).await?.map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration, meta: &EntryMeta) -> Result<(), CacheError> {
        let entry = CacheEntry::new(key, value, meta, self.clock().now(), ttl);
        self.put(entry).await
    }
}

/// Hit/miss counters kept by each adapter.
#[derive(Debug, Default)]
pub(crate) struct HitCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HitCounters {
    pub(crate) fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self, count: u64, approx_bytes: u64) -> AdapterStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        AdapterStats {
            count,
            approx_bytes,
            hits,
            misses,
            hit_rate: hit_rate(hits, misses),
        }
    }
}

pub(crate) fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}
