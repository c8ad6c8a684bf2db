//! Pure caching policy: whether to cache a payload and for how long.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::entry::{DataType, EntryMeta, Volatility};
use crate::sports::SportConfig;

pub const MIN_TTL_SECS: u64 = 5;
pub const MAX_TTL_SECS: u64 = 3600;

/// Default TTL in seconds for a data type at a given volatility.
pub fn default_ttl_secs(data_type: DataType, volatility: Volatility) -> u64 {
    match (data_type, volatility) {
        (DataType::Games, Volatility::Live) => 90,
        (DataType::Games, Volatility::Normal) => 300,
        (DataType::Odds, _) => 90,
        (DataType::Teams, _) => 1800,
        (DataType::Standings, _) => 900,
        (DataType::Predictions, _) => 600,
        (DataType::Analytics, _) => 300,
    }
}

/// Key into a sport's `refresh_intervals` table: the data type name, with a
/// `_live` suffix for live volatility (e.g. `games_live`).
pub fn interval_key(data_type: DataType, volatility: Volatility) -> String {
    match volatility {
        Volatility::Live => format!("{}_live", data_type),
        Volatility::Normal => data_type.to_string(),
    }
}

fn clamp_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(MIN_TTL_SECS, MAX_TTL_SECS))
}

/// TTL table with optional per-sport overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStrategy {
    overrides: HashMap<String, HashMap<String, u64>>,
}

impl CacheStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take per-sport overrides from each config's `refresh_intervals`.
    pub fn from_configs<'a>(configs: impl IntoIterator<Item = &'a SportConfig>) -> Self {
        let overrides = configs
            .into_iter()
            .filter(|c| !c.refresh_intervals.is_empty())
            .map(|c| (c.name.clone(), c.refresh_intervals.clone()))
            .collect();
        Self { overrides }
    }

    /// TTL for a data type at normal volatility, always within `[5s, 1h]`.
    pub fn ttl_for(&self, data_type: DataType, sport: Option<&str>) -> Duration {
        self.ttl_at(data_type, Volatility::Normal, sport)
    }

    pub fn ttl_at(&self, data_type: DataType, volatility: Volatility, sport: Option<&str>) -> Duration {
        let configured = sport
            .and_then(|s| self.overrides.get(s))
            .and_then(|table| table.get(&interval_key(data_type, volatility)));
        clamp_secs(configured.copied().unwrap_or_else(|| default_ttl_secs(data_type, volatility)))
    }

    /// TTL for a write; an explicit override still goes through the clamp.
    pub fn ttl_for_meta(&self, meta: &EntryMeta) -> Duration {
        match meta.ttl_override {
            Some(ttl) => clamp_secs(ttl.as_secs()),
            None => self.ttl_at(meta.data_type, meta.volatility, meta.sport.as_deref()),
        }
    }

    /// Empty payloads, error payloads and explicitly uncacheable writes are skipped.
    pub fn should_cache(&self, key: &str, value: &Value, meta: &EntryMeta) -> bool {
        if !meta.cacheable || key.trim().is_empty() {
            return false;
        }
        match value {
            Value::Null => false,
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => {
                !map.is_empty()
                    && !map.contains_key("error")
                    && map.get("success").and_then(Value::as_bool) != Some(false)
            }
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }
}
