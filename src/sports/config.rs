//! Per-sport configuration and the built-in fallback table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::cache::{default_ttl_secs, interval_key, DataType, Volatility};

/// Canonical game statuses every provider vocabulary is mapped onto.
pub const CANONICAL_STATUSES: [&str; 5] = ["scheduled", "live", "completed", "postponed", "cancelled"];

const COMMON_STATUS_MAPPING: [(&str, &str); 20] = [
    ("status_scheduled", "scheduled"),
    ("pre", "scheduled"),
    ("upcoming", "scheduled"),
    ("not_started", "scheduled"),
    ("status_in_progress", "live"),
    ("in", "live"),
    ("in_progress", "live"),
    ("inprogress", "live"),
    ("status_halftime", "live"),
    ("halftime", "live"),
    ("status_end_period", "live"),
    ("status_final", "completed"),
    ("final", "completed"),
    ("post", "completed"),
    ("closed", "completed"),
    ("status_postponed", "postponed"),
    ("delayed", "postponed"),
    ("status_canceled", "cancelled"),
    ("canceled", "cancelled"),
    ("status_cancelled", "cancelled"),
];

/// Configuration for one sport. Replaced wholesale on reload, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SportConfig {
    pub name: String,
    pub default_league: String,
    #[serde(default)]
    pub leagues: Vec<String>,
    /// Seconds per data type name (`games`, `games_live`, `odds`, ...).
    #[serde(default)]
    pub refresh_intervals: HashMap<String, u64>,
    /// Requests per minute per provider.
    #[serde(default)]
    pub rate_limits: HashMap<String, u32>,
    #[serde(default)]
    pub status_mapping: HashMap<String, String>,
    #[serde(default)]
    pub period_mapping: HashMap<String, String>,
    /// Points total used by fallback predictions.
    #[serde(default = "default_fallback_total")]
    pub fallback_total: f64,
}

fn default_fallback_total() -> f64 {
    0.0
}

impl SportConfig {
    pub fn supports_league(&self, league: &str) -> bool {
        league == self.default_league || self.leagues.iter().any(|l| l == league)
    }

    /// Map a provider status onto [`CANONICAL_STATUSES`]; unknown values are
    /// passed through lowercased.
    pub fn normalize_status(&self, raw: &str) -> String {
        let key = raw.trim().to_lowercase().replace([' ', '-'], "_");
        if let Some(mapped) = self.status_mapping.get(&key) {
            return mapped.clone();
        }
        if CANONICAL_STATUSES.contains(&key.as_str()) {
            return key;
        }
        COMMON_STATUS_MAPPING
            .iter()
            .find(|(from, _)| *from == key)
            .map(|(_, to)| to.to_string())
            .unwrap_or(key)
    }

    pub fn normalize_period(&self, raw: &str) -> String {
        let key = raw.trim().to_lowercase();
        self.period_mapping
            .get(&key)
            .cloned()
            .unwrap_or_else(|| raw.trim().to_string())
    }

    /// How often data of this type should be refreshed for this sport.
    pub fn refresh_interval(&self, data_type: DataType, volatility: Volatility) -> Duration {
        let secs = self
            .refresh_intervals
            .get(&interval_key(data_type, volatility))
            .copied()
            .unwrap_or_else(|| default_ttl_secs(data_type, volatility));
        Duration::from_secs(secs.max(1))
    }
}

fn table(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn intervals(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn limits(pairs: &[(&str, u32)]) -> HashMap<String, u32> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// Used whenever `sport_configs` cannot be read.
pub fn builtin_configs() -> Vec<SportConfig> {
    let quarters = table(&[("1", "Q1"), ("2", "Q2"), ("3", "Q3"), ("4", "Q4"), ("5", "OT")]);

    vec![
        SportConfig {
            name: "basketball".to_string(),
            default_league: "nba".to_string(),
            leagues: vec!["nba".to_string(), "ncaab".to_string(), "wnba".to_string()],
            refresh_intervals: intervals(&[
                ("games_live", 60),
                ("games", 300),
                ("odds", 120),
                ("teams", 1800),
                ("standings", 900),
                ("predictions", 600),
            ]),
            rate_limits: limits(&[("the_odds_api", 45), ("espn", 60)]),
            status_mapping: HashMap::new(),
            period_mapping: quarters.clone(),
            fallback_total: 220.0,
        },
        SportConfig {
            name: "football".to_string(),
            default_league: "nfl".to_string(),
            leagues: vec!["nfl".to_string(), "ncaaf".to_string()],
            refresh_intervals: intervals(&[("games_live", 90), ("games", 300), ("odds", 120), ("teams", 1800)]),
            rate_limits: limits(&[("the_odds_api", 45), ("espn", 60)]),
            status_mapping: HashMap::new(),
            period_mapping: quarters,
            fallback_total: 44.0,
        },
        SportConfig {
            name: "baseball".to_string(),
            default_league: "mlb".to_string(),
            leagues: vec!["mlb".to_string()],
            refresh_intervals: intervals(&[("games_live", 120), ("games", 300), ("odds", 120)]),
            rate_limits: limits(&[("the_odds_api", 45), ("mlb_stats", 120)]),
            status_mapping: table(&[("status_rain_delay", "live"), ("warmup", "scheduled")]),
            period_mapping: table(&[("top", "Top"), ("mid", "Middle"), ("bot", "Bottom"), ("end", "End")]),
            fallback_total: 8.5,
        },
        SportConfig {
            name: "hockey".to_string(),
            default_league: "nhl".to_string(),
            leagues: vec!["nhl".to_string()],
            refresh_intervals: intervals(&[("games_live", 60), ("games", 300), ("odds", 120)]),
            rate_limits: limits(&[("the_odds_api", 45), ("nhl_api", 60)]),
            status_mapping: table(&[("status_intermission", "live"), ("off", "completed")]),
            period_mapping: table(&[("1", "P1"), ("2", "P2"), ("3", "P3"), ("4", "OT"), ("5", "SO")]),
            fallback_total: 6.0,
        },
        SportConfig {
            name: "soccer".to_string(),
            default_league: "mls".to_string(),
            leagues: vec!["mls".to_string(), "epl".to_string()],
            refresh_intervals: intervals(&[("games_live", 60), ("games", 300), ("odds", 120), ("standings", 1800)]),
            rate_limits: limits(&[("the_odds_api", 45), ("football_data", 10)]),
            status_mapping: table(&[
                ("status_first_half", "live"),
                ("status_second_half", "live"),
                ("ft", "completed"),
            ]),
            period_mapping: table(&[("1", "1H"), ("2", "2H"), ("3", "ET1"), ("4", "ET2"), ("5", "PEN")]),
            fallback_total: 2.5,
        },
    ]
}
