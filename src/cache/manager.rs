//! Cache Manager - one cache API over the prioritized tiers.
//!
//! Reads check tiers fastest-first and backfill faster tiers on a slower
//! hit. Writes go to every tier. `warmup` coalesces concurrent producers
//! for the same key so an expensive computation runs once per process.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::adapter::{hit_rate, AdapterStats, CacheAdapter, Tier};
use super::entry::{CacheEntry, Clock, DataType, EntryMeta, KeyPattern};
use super::memory::MemoryAdapter;
use super::notify::InvalidationSink;
use super::persistent::{PersistentAdapter, DEFAULT_STORE_TIMEOUT};
use super::strategy::CacheStrategy;
use crate::error::CacheError;
use crate::store::DurableStore;

/// Where a served value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    MemoryCache,
    PersistentCache,
    Computed,
}

impl Source {
    fn from_tier(tier: Tier) -> Self {
        match tier {
            Tier::Memory => Source::MemoryCache,
            Tier::Persistent => Source::PersistentCache,
        }
    }
}

/// A cached value together with the tier that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub value: Value,
    pub source: Source,
    pub entry: CacheEntry,
}

/// Value handed back by [`CacheManager::warmup`].
#[derive(Debug, Clone, PartialEq)]
pub struct Served {
    pub value: Value,
    pub source: Source,
}

/// Producer output; transient values are returned but never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Computed {
    pub value: Value,
    pub cacheable: bool,
}

impl Computed {
    pub fn cacheable(value: Value) -> Self {
        Self { value, cacheable: true }
    }

    pub fn transient(value: Value) -> Self {
        Self { value, cacheable: false }
    }
}

impl From<Value> for Computed {
    fn from(value: Value) -> Self {
        Self::cacheable(value)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub tier: Tier,
    pub available: bool,
    #[serde(flatten)]
    pub stats: AdapterStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub backfills: u64,
    pub computations: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub tiers: Vec<TierStats>,
}

/// Settings for the standard memory-over-store layout.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Upper bound on every persistent tier call.
    pub store_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    backfills: AtomicU64,
    computations: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
}

type InFlight = Mutex<HashMap<String, Arc<OnceCell<Served>>>>;

/// Drops the in-flight slot once its owner is done, unless a newer slot replaced it.
struct InFlightGuard<'a> {
    map: &'a InFlight,
    key: &'a str,
    cell: Arc<OnceCell<Served>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        if map.get(self.key).map(|c| Arc::ptr_eq(c, &self.cell)).unwrap_or(false) {
            map.remove(self.key);
        }
    }
}

/// The concrete adapters behind [`CacheManager::two_tier`].
pub struct TierHandles {
    pub memory: Arc<MemoryAdapter>,
    pub persistent: Arc<PersistentAdapter>,
}

pub struct CacheManager {
    tiers: Vec<Arc<dyn CacheAdapter>>,
    strategy: RwLock<Arc<CacheStrategy>>,
    sink: Option<Arc<dyn InvalidationSink>>,
    in_flight: InFlight,
    counters: Counters,
}

impl CacheManager {
    /// Tiers are consulted in the order given, fastest first.
    pub fn new(tiers: Vec<Arc<dyn CacheAdapter>>) -> Self {
        Self {
            tiers,
            strategy: RwLock::new(Arc::new(CacheStrategy::new())),
            sink: None,
            in_flight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Memory tier in front of a persistent tier over `store`, sharing one clock.
    ///
    /// The adapters are returned as well so the caller can run the memory
    /// sweeper and the persistent purge.
    pub fn two_tier(store: Arc<dyn DurableStore>, settings: &ManagerSettings) -> (Self, TierHandles) {
        let clock = Clock::new();
        let memory = Arc::new(MemoryAdapter::new(clock));
        let persistent = Arc::new(PersistentAdapter::new(store, settings.store_timeout, clock));
        let manager = Self::new(vec![
            Arc::clone(&memory) as Arc<dyn CacheAdapter>,
            Arc::clone(&persistent) as Arc<dyn CacheAdapter>,
        ]);
        (manager, TierHandles { memory, persistent })
    }

    pub fn with_strategy(self, strategy: CacheStrategy) -> Self {
        self.replace_strategy(strategy);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn InvalidationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn strategy(&self) -> Arc<CacheStrategy> {
        Arc::clone(&self.strategy.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Swap in a new policy table atomically.
    pub fn replace_strategy(&self, strategy: CacheStrategy) {
        *self.strategy.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(strategy);
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.lookup(key).await.map(|hit| hit.value)
    }

    /// Read through the tiers. Adapter errors count as misses; a hit on a
    /// slower tier is copied into every faster tier with its original expiry.
    pub async fn lookup(&self, key: &str) -> Option<CacheHit> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        for (idx, adapter) in self.tiers.iter().enumerate() {
            match adapter.get_entry(key).await {
                Ok(Some(entry)) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    self.backfill(&self.tiers[..idx], &entry).await;
                    return Some(CacheHit {
                        value: entry.value.clone(),
                        source: Source::from_tier(adapter.tier()),
                        entry,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!("Cache read for '{}' downgraded to miss: {}", key, e),
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn backfill(&self, faster: &[Arc<dyn CacheAdapter>], entry: &CacheEntry) {
        for adapter in faster {
            match adapter.put(entry.clone()).await {
                Ok(()) => {
                    self.counters.backfills.fetch_add(1, Ordering::Relaxed);
                    debug!("Backfilled '{}' into {} tier", entry.key, adapter.tier().as_str());
                }
                Err(e) => warn!("Backfill of '{}' into {} tier failed: {}", entry.key, adapter.tier().as_str(), e),
            }
        }
    }

    /// Store `value` in every tier with a strategy-assigned TTL.
    ///
    /// Returns `Ok(false)` when the strategy declines the payload. An error
    /// means no tier accepted the write; the value is simply not cached.
    pub async fn set(&self, key: &str, value: Value, meta: &EntryMeta) -> Result<bool, CacheError> {
        let strategy = self.strategy();
        if !strategy.should_cache(key, &value, meta) {
            debug!("Not caching '{}'", key);
            return Ok(false);
        }
        let ttl = strategy.ttl_for_meta(meta);

        let mut stored = 0usize;
        let mut last_error = None;
        // One timestamp for every tier keeps faster tiers no staler than slower ones.
        let now = match self.tiers.first() {
            Some(adapter) => adapter.clock().now(),
            None => return Ok(false),
        };
        let entry = CacheEntry::new(key, value, meta, now, ttl);

        for adapter in &self.tiers {
            match adapter.put(entry.clone()).await {
                Ok(()) => stored += 1,
                Err(e) => {
                    self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Cache write for '{}' to {} tier failed: {}", key, adapter.tier().as_str(), e);
                    last_error = Some(e);
                }
            }
        }

        match (stored, last_error) {
            (0, Some(e)) => Err(e),
            _ => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                debug!("Cached '{}' in {} tier(s) for {:?}", key, stored, ttl);
                Ok(true)
            }
        }
    }

    /// Return the cached value, or run `producer` once per key no matter how
    /// many callers arrive concurrently, cache its output and hand it to all.
    ///
    /// A failed producer is not remembered: the next waiter runs its own.
    pub async fn warmup<F, Fut, E>(&self, key: &str, meta: &EntryMeta, producer: F) -> Result<Served, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Computed, E>>,
    {
        if let Some(hit) = self.lookup(key).await {
            return Ok(Served {
                value: hit.value,
                source: hit.source,
            });
        }

        let cell = {
            let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(key.to_string()).or_insert_with(|| Arc::new(OnceCell::new())))
        };
        let _guard = InFlightGuard {
            map: &self.in_flight,
            key,
            cell: Arc::clone(&cell),
        };

        let served = cell
            .get_or_try_init(|| async move {
                // A previous owner may have finished between our miss and taking the slot.
                if let Some(hit) = self.lookup(key).await {
                    return Ok(Served {
                        value: hit.value,
                        source: hit.source,
                    });
                }

                self.counters.computations.fetch_add(1, Ordering::Relaxed);
                let computed = producer().await?;
                if computed.cacheable {
                    if let Err(e) = self.set(key, computed.value.clone(), meta).await {
                        warn!("Computed value for '{}' not cached: {}", key, e);
                    }
                }
                Ok::<Served, E>(Served {
                    value: computed.value,
                    source: Source::Computed,
                })
            })
            .await?;

        Ok(served.clone())
    }

    pub async fn delete(&self, key: &str) {
        for adapter in &self.tiers {
            if let Err(e) = adapter.delete(key).await {
                warn!("Cache delete of '{}' in {} tier failed: {}", key, adapter.tier().as_str(), e);
            }
        }
    }

    pub async fn clear_by_type(&self, data_type: DataType) -> u64 {
        self.clear_matching(Some(KeyPattern::for_type(data_type))).await
    }

    pub async fn clear_by_sport(&self, sport: &str) -> u64 {
        self.clear_matching(Some(KeyPattern::for_sport(sport))).await
    }

    pub async fn clear(&self) -> u64 {
        self.clear_matching(None).await
    }

    /// Bulk invalidation across every tier. Returns the largest number of
    /// live entries any single tier dropped.
    pub async fn clear_matching(&self, pattern: Option<KeyPattern>) -> u64 {
        let mut removed = 0u64;
        for adapter in &self.tiers {
            match adapter.clear(pattern.as_ref()).await {
                Ok(count) => removed = removed.max(count),
                Err(e) => warn!("Cache clear in {} tier failed: {}", adapter.tier().as_str(), e),
            }
        }

        let pattern = pattern.unwrap_or_else(KeyPattern::all);
        debug!("Cleared {} entries matching '{}'", removed, pattern);
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.publish(&pattern).await {
                warn!("Failed to publish invalidation for '{}': {}", pattern, e);
            }
        }
        removed
    }

    /// Union of live keys across tiers, sorted.
    pub async fn keys(&self, pattern: Option<&KeyPattern>) -> Vec<String> {
        let mut keys = Vec::new();
        for adapter in &self.tiers {
            match adapter.keys(pattern).await {
                Ok(found) => keys.extend(found),
                Err(e) => warn!("Listing keys in {} tier failed: {}", adapter.tier().as_str(), e),
            }
        }
        keys.sort();
        keys.dedup();
        keys
    }

    pub async fn get_stats(&self) -> ManagerStats {
        let mut tiers = Vec::with_capacity(self.tiers.len());
        for adapter in &self.tiers {
            let (available, stats) = match adapter.stats().await {
                Ok(stats) => (true, stats),
                Err(_) => (false, AdapterStats::default()),
            };
            tiers.push(TierStats {
                tier: adapter.tier(),
                available,
                stats,
            });
        }

        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        ManagerStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            hits,
            misses,
            hit_rate: hit_rate(hits, misses),
            backfills: self.counters.backfills.load(Ordering::Relaxed),
            computations: self.counters.computations.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
            tiers,
        }
    }
}
