//! Two-tier cache: process-local memory in front of the durable store.

mod adapter;
mod entry;
mod manager;
mod memory;
mod notify;
mod persistent;
mod strategy;

pub use adapter::{AdapterStats, CacheAdapter, Tier};
pub use entry::{CacheEntry, CacheKey, Clock, DataType, EntryMeta, KeyPattern, Volatility, ALL_SPORTS};
pub use manager::{
    CacheHit, CacheManager, Computed, ManagerSettings, ManagerStats, Served, Source, TierHandles, TierStats,
};
pub use memory::MemoryAdapter;
pub use notify::{InvalidationSink, RedisInvalidationSink, INVALIDATION_STREAM};
pub use persistent::{PersistentAdapter, DEFAULT_STORE_TIMEOUT};
pub use strategy::{default_ttl_secs, interval_key, CacheStrategy, MAX_TTL_SECS, MIN_TTL_SECS};
