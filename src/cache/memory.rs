//! Process-local cache tier.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use super::adapter::{AdapterStats, CacheAdapter, HitCounters, Tier};
use super::entry::{CacheEntry, Clock, KeyPattern};
use crate::error::CacheError;

/// Thread-safe in-process table. Expired entries are dropped lazily on read
/// and eagerly by [`MemoryAdapter::sweep`].
pub struct MemoryAdapter {
    inner: RwLock<HashMap<String, CacheEntry>>,
    clock: Clock,
    counters: HitCounters,
}

impl MemoryAdapter {
    pub fn new(clock: Clock) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            clock,
            counters: HitCounters::default(),
        }
    }

    /// Remove every expired entry, returning how many were dropped.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut table = self.inner.write().await;
        let before = table.len();
        table.retain(|_, entry| !entry.is_expired(now));
        before - table.len()
    }

    /// Periodic sweep to bound memory held by entries nobody reads again.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = adapter.sweep().await;
                if removed > 0 {
                    debug!("Swept {} expired memory cache entries", removed);
                }
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new(Clock::new())
    }
}

#[async_trait]
impl CacheAdapter for MemoryAdapter {
    fn tier(&self) -> Tier {
        Tier::Memory
    }

    fn clock(&self) -> Clock {
        self.clock
    }

    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let now = self.clock.now();
        let expired = {
            let table = self.inner.read().await;
            match table.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.counters.record(true);
                    return Ok(Some(entry.clone()));
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut table = self.inner.write().await;
            // Re-check: a fresh write may have landed between the two locks.
            if table.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
                table.remove(key);
            }
        }
        self.counters.record(false);
        Ok(None)
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut table = self.inner.write().await;
        table.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self, pattern: Option<&KeyPattern>) -> Result<u64, CacheError> {
        let now = self.clock.now();
        let mut table = self.inner.write().await;
        let mut removed = 0u64;
        table.retain(|key, entry| {
            let matched = pattern.map(|p| p.matches(key)).unwrap_or(true);
            if matched && !entry.is_expired(now) {
                removed += 1;
            }
            !matched && !entry.is_expired(now)
        });
        Ok(removed)
    }

    async fn keys(&self, pattern: Option<&KeyPattern>) -> Result<Vec<String>, CacheError> {
        let now = self.clock.now();
        let table = self.inner.read().await;
        let mut keys: Vec<String> = table
            .values()
            .filter(|entry| !entry.is_expired(now))
            .filter(|entry| pattern.map(|p| p.matches(&entry.key)).unwrap_or(true))
            .map(|entry| entry.key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn stats(&self) -> Result<AdapterStats, CacheError> {
        let now = self.clock.now();
        let table = self.inner.read().await;
        let (count, bytes) = table
            .values()
            .filter(|entry| !entry.is_expired(now))
            .fold((0u64, 0u64), |(count, bytes), entry| (count + 1, bytes + entry.size_bytes));
        Ok(self.counters.snapshot(count, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{DataType, EntryMeta};
    use serde_json::json;

    fn meta(sport: &str) -> EntryMeta {
        EntryMeta::new(DataType::Games, sport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_expiry_on_read() {
        let adapter = MemoryAdapter::default();
        adapter
            .set("games:basketball:live", json!(["a"]), Duration::from_secs(90), &meta("basketball"))
            .await
            .unwrap();

        assert_eq!(adapter.get("games:basketball:live").await.unwrap(), Some(json!(["a"])));

        tokio::time::advance(Duration::from_secs(91)).await;
        assert_eq!(adapter.get("games:basketball:live").await.unwrap(), None);
        assert_eq!(adapter.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let adapter = MemoryAdapter::default();
        adapter.set("a", json!(1), Duration::from_secs(10), &meta("hockey")).await.unwrap();
        adapter.set("b", json!(2), Duration::from_secs(100), &meta("hockey")).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(adapter.sweep().await, 1);
        assert_eq!(adapter.keys(None).await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_pattern_clear_and_stats() {
        let adapter = MemoryAdapter::default();
        let ttl = Duration::from_secs(60);
        adapter.set("games:basketball:default", json!([1]), ttl, &meta("basketball")).await.unwrap();
        adapter.set("odds:basketball:default", json!([2]), ttl, &meta("basketball")).await.unwrap();
        adapter.set("games:hockey:default", json!([3]), ttl, &meta("hockey")).await.unwrap();

        let removed = adapter.clear(Some(&KeyPattern::for_sport("basketball"))).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(adapter.clear(Some(&KeyPattern::for_sport("basketball"))).await.unwrap(), 0);

        adapter.get("games:hockey:default").await.unwrap();
        adapter.get("games:basketball:default").await.unwrap();

        let stats = adapter.stats().await.unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.approx_bytes, 3);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
