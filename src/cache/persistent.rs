//! Durable, cross-process cache tier.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::adapter::{AdapterStats, CacheAdapter, HitCounters, Tier};
use super::entry::{CacheEntry, Clock, KeyPattern};
use crate::error::{CacheError, StoreError};
use crate::store::DurableStore;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(750);

/// Cache tier over the durable store's `cache_entries` table.
///
/// Every call is bounded by a timeout; timeouts and store errors surface as
/// [`CacheError::Unavailable`].
pub struct PersistentAdapter {
    store: Arc<dyn DurableStore>,
    timeout: Duration,
    clock: Clock,
    counters: HitCounters,
}

impl PersistentAdapter {
    pub fn new(store: Arc<dyn DurableStore>, timeout: Duration, clock: Clock) -> Self {
        Self {
            store,
            timeout,
            clock,
            counters: HitCounters::default(),
        }
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                debug!("Persistent cache {} failed: {}", op, e);
                Err(CacheError::Unavailable {
                    tier: Tier::Persistent.as_str(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                debug!("Persistent cache {} timed out after {:?}", op, self.timeout);
                Err(CacheError::Unavailable {
                    tier: Tier::Persistent.as_str(),
                    reason: format!("{} timed out after {:?}", op, self.timeout),
                })
            }
        }
    }

    /// Physically delete expired rows; reads already ignore them.
    pub async fn purge_expired(&self) -> Result<u64, CacheError> {
        let now = self.clock.now();
        self.bounded("purge", self.store.purge_expired(now)).await
    }
}

#[async_trait]
impl CacheAdapter for PersistentAdapter {
    fn tier(&self) -> Tier {
        Tier::Persistent
    }

    fn clock(&self) -> Clock {
        self.clock
    }

    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let now = self.clock.now();
        let entry = self
            .bounded("read", self.store.read_entry(key, now))
            .await?
            .filter(|entry| !entry.is_expired(now));
        self.counters.record(entry.is_some());
        Ok(entry)
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.bounded("write", self.store.write_entry(&entry)).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        // Exact-key pattern; `*` is never part of a composed key.
        let pattern = KeyPattern::new(key);
        self.bounded("delete", self.store.delete_entries(&pattern, self.clock.now()))
            .await
            .map(|_| ())
    }

    async fn clear(&self, pattern: Option<&KeyPattern>) -> Result<u64, CacheError> {
        let pattern = pattern.cloned().unwrap_or_else(KeyPattern::all);
        self.bounded("clear", self.store.delete_entries(&pattern, self.clock.now()))
            .await
    }

    async fn keys(&self, pattern: Option<&KeyPattern>) -> Result<Vec<String>, CacheError> {
        let pattern = pattern.cloned().unwrap_or_else(KeyPattern::all);
        self.bounded("keys", self.store.entry_keys(&pattern, self.clock.now()))
            .await
    }

    async fn stats(&self) -> Result<AdapterStats, CacheError> {
        let totals = self
            .bounded("stats", self.store.entry_totals(self.clock.now()))
            .await?;
        Ok(self.counters.snapshot(totals.count, totals.approx_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{DataType, EntryMeta};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn adapter(store: Arc<MemoryStore>, timeout: Duration) -> PersistentAdapter {
        PersistentAdapter::new(store, timeout, Clock::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_roundtrip_and_expiry() {
        let store = Arc::new(MemoryStore::new());
        let adapter = adapter(store, DEFAULT_STORE_TIMEOUT);
        let meta = EntryMeta::new(DataType::Standings, "hockey");

        adapter
            .set("standings:hockey:default", json!([{"team": "a"}]), Duration::from_secs(30), &meta)
            .await
            .unwrap();
        let entry = adapter.get_entry("standings:hockey:default").await.unwrap().unwrap();
        assert_eq!(entry.sport, "hockey");
        assert_eq!(entry.data_type, DataType::Standings);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(adapter.get("standings:hockey:default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_failure_is_unavailable() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let adapter = adapter(store, DEFAULT_STORE_TIMEOUT);

        let err = adapter.get("games:basketball:default").await.unwrap_err();
        assert!(matches!(err, CacheError::Unavailable { tier: "persistent", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let store = Arc::new(MemoryStore::new());
        store.set_latency(Some(Duration::from_secs(30)));
        let adapter = adapter(store, Duration::from_millis(200));

        let err = adapter.keys(None).await.unwrap_err();
        match err {
            CacheError::Unavailable { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_removes_only_expired_rows() {
        let store = Arc::new(MemoryStore::new());
        let adapter = adapter(store.clone(), DEFAULT_STORE_TIMEOUT);
        let meta = EntryMeta::new(DataType::Odds, "hockey");

        adapter
            .set("odds:hockey:default", json!([1]), Duration::from_secs(10), &meta)
            .await
            .unwrap();
        adapter
            .set("odds:hockey:game=g1", json!([2]), Duration::from_secs(120), &meta)
            .await
            .unwrap();

        assert_eq!(adapter.purge_expired().await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(adapter.purge_expired().await.unwrap(), 1);
        assert_eq!(adapter.keys(None).await.unwrap(), vec!["odds:hockey:game=g1".to_string()]);

        store.set_unavailable(true);
        assert!(matches!(adapter.purge_expired().await, Err(CacheError::Unavailable { .. })));
    }
}
