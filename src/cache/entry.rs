//! Cache entry records shared by both tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// Sport sentinel for entries that span every sport.
pub const ALL_SPORTS: &str = "all";

/// Kind of payload an entry holds; drives the TTL policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Games,
    Teams,
    Odds,
    Predictions,
    Standings,
    Analytics,
}

impl DataType {
    pub const ALL: [DataType; 6] = [
        DataType::Games,
        DataType::Teams,
        DataType::Odds,
        DataType::Predictions,
        DataType::Standings,
        DataType::Analytics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Games => "games",
            DataType::Teams => "teams",
            DataType::Odds => "odds",
            DataType::Predictions => "predictions",
            DataType::Standings => "standings",
            DataType::Analytics => "analytics",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataType::ALL
            .into_iter()
            .find(|dt| dt.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown data type '{}'", s))
    }
}

/// How quickly the underlying data moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Volatility {
    /// In-progress games, moving lines.
    Live,
    #[default]
    Normal,
}

/// Caller-supplied metadata attached to a write.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryMeta {
    pub data_type: DataType,
    /// `None` means cross-sport.
    pub sport: Option<String>,
    pub volatility: Volatility,
    /// `false` marks health checks and other payloads that must never be stored.
    pub cacheable: bool,
    /// Explicit TTL; still clamped by the strategy.
    pub ttl_override: Option<Duration>,
}

impl EntryMeta {
    pub fn new(data_type: DataType, sport: impl Into<String>) -> Self {
        Self {
            data_type,
            sport: Some(sport.into()),
            volatility: Volatility::Normal,
            cacheable: true,
            ttl_override: None,
        }
    }

    pub fn live(mut self) -> Self {
        self.volatility = Volatility::Live;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_override = Some(ttl);
        self
    }

    pub fn uncacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn sport_or_all(&self) -> &str {
        self.sport.as_deref().unwrap_or(ALL_SPORTS)
    }
}

/// A stored value with an absolute expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub data_type: DataType,
    pub sport: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: &str, value: Value, meta: &EntryMeta, now: DateTime<Utc>, ttl: Duration) -> Self {
        let size_bytes = value.to_string().len() as u64;
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            key: key.to_string(),
            value,
            data_type: meta.data_type,
            sport: meta.sport_or_all().to_string(),
            size_bytes,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// An entry is logically absent once its expiry has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Wall-clock timestamps derived from tokio's monotonic clock.
///
/// Anchored once, so timestamps never go backwards and follow
/// `tokio::time::pause`/`advance` in tests.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.mono.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Glob over cache keys: `*` matches any run of characters, the rest is literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern(String);

impl KeyPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn all() -> Self {
        Self("*".to_string())
    }

    pub fn for_type(data_type: DataType) -> Self {
        Self(format!("{}:*", data_type))
    }

    pub fn for_sport(sport: &str) -> Self {
        Self(format!("*:{}:*", sport))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, key: &str) -> bool {
        let parts: Vec<&str> = self.0.split('*').collect();
        if parts.len() == 1 {
            return self.0 == key;
        }

        let first = parts[0];
        let last = parts[parts.len() - 1];
        if !key.starts_with(first) || key.len() < first.len() + last.len() || !key.ends_with(last) {
            return false;
        }

        // Greedy scan of the middle segments between the fixed prefix and suffix.
        let mut rest = &key[first.len()..key.len() - last.len()];
        for part in &parts[1..parts.len() - 1] {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
        true
    }

    /// SQL `LIKE` form, escaped with `\`.
    pub fn to_like(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for ch in self.0.chars() {
            match ch {
                '\\' | '%' | '_' => {
                    out.push('\\');
                    out.push(ch);
                }
                '*' => out.push('%'),
                _ => out.push(ch),
            }
        }
        out
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds `dataType:sport:qualifier` keys from normalized query parameters.
pub struct CacheKey;

/// Percent-encode the characters that delimit keys, params and patterns.
fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            ':' => out.push_str("%3A"),
            '*' => out.push_str("%2A"),
            _ => out.push(ch),
        }
    }
    out
}

impl CacheKey {
    pub fn compose(data_type: DataType, sport: Option<&str>, params: &[(&str, Option<String>)]) -> String {
        let mut pairs: Vec<(&str, String)> = params
            .iter()
            .filter_map(|(name, value)| {
                let value = value.as_ref()?.trim();
                if value.is_empty() {
                    None
                } else {
                    Some((*name, escape_value(&value.to_lowercase())))
                }
            })
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));

        let qualifier = if pairs.is_empty() {
            "default".to_string()
        } else {
            pairs
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("&")
        };

        format!("{}:{}:{}", data_type, sport.unwrap_or(ALL_SPORTS), qualifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pattern_matching() {
        assert!(KeyPattern::all().matches("games:basketball:default"));
        assert!(KeyPattern::for_sport("basketball").matches("games:basketball:status=live"));
        assert!(!KeyPattern::for_sport("basketball").matches("games:football:status=live"));
        assert!(KeyPattern::for_type(DataType::Odds).matches("odds:hockey:default"));
        assert!(!KeyPattern::for_type(DataType::Odds).matches("games:hockey:odds"));
        assert!(KeyPattern::new("games:basketball:live").matches("games:basketball:live"));
        assert!(!KeyPattern::new("games:basketball:live").matches("games:basketball:live2"));
        assert!(KeyPattern::new("*a*a*").matches("aa"));
        assert!(!KeyPattern::new("*a*a*").matches("a"));
    }

    #[test]
    fn test_like_escaping() {
        assert_eq!(KeyPattern::new("*:nba_x:*").to_like(), "%:nba\\_x:%");
        assert_eq!(KeyPattern::new("100%").to_like(), "100\\%");
    }

    #[test]
    fn test_key_composition_is_order_independent() {
        let a = CacheKey::compose(
            DataType::Games,
            Some("basketball"),
            &[("status", Some("live".into())), ("league", Some("NBA".into())), ("limit", None)],
        );
        let b = CacheKey::compose(
            DataType::Games,
            Some("basketball"),
            &[("league", Some("nba".into())), ("status", Some("live".into()))],
        );
        assert_eq!(a, b);
        assert_eq!(a, "games:basketball:league=nba&status=live");

        let distinct = CacheKey::compose(DataType::Games, Some("basketball"), &[("status", Some("completed".into()))]);
        assert_ne!(a, distinct);

        assert_eq!(CacheKey::compose(DataType::Analytics, None, &[]), "analytics:all:default");
    }

    #[test]
    fn test_key_values_cannot_forge_params() {
        let forged = CacheKey::compose(DataType::Odds, Some("hockey"), &[("game", Some("x&limit=5".into()))]);
        let real = CacheKey::compose(
            DataType::Odds,
            Some("hockey"),
            &[("game", Some("x".into())), ("limit", Some("5".into()))],
        );
        assert_ne!(forged, real);
        assert_eq!(forged, "odds:hockey:game=x%26limit%3D5");

        let colon = CacheKey::compose(DataType::Odds, Some("hockey"), &[("game", Some("a:b".into()))]);
        let dot = CacheKey::compose(DataType::Odds, Some("hockey"), &[("game", Some("a.b".into()))]);
        assert_ne!(colon, dot);
        assert_eq!(colon, "odds:hockey:game=a%3Ab");

        let escaped = CacheKey::compose(DataType::Odds, Some("hockey"), &[("game", Some("%26".into()))]);
        let raw = CacheKey::compose(DataType::Odds, Some("hockey"), &[("game", Some("&".into()))]);
        assert_ne!(escaped, raw);

        // Wildcards in values stay literal to pattern invalidation.
        let starred = CacheKey::compose(DataType::Odds, Some("hockey"), &[("game", Some("*".into()))]);
        assert!(!KeyPattern::new(starred.clone()).matches("odds:hockey:game=g1"));
        assert!(KeyPattern::for_sport("hockey").matches(&starred));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expiry_follows_clock() {
        let clock = Clock::new();
        let meta = EntryMeta::new(DataType::Games, "basketball");
        let ttl = Duration::from_secs(90);
        let entry = CacheEntry::new("games:basketball:live", json!([1, 2]), &meta, clock.now(), ttl);

        assert!(!entry.is_expired(clock.now()));
        assert_eq!(entry.size_bytes, 5);

        tokio::time::advance(Duration::from_secs(91)).await;
        assert!(entry.is_expired(clock.now()));
        assert_eq!(entry.remaining(clock.now()), Duration::ZERO);
    }
}
