//! Service configuration from the environment.
//!
//! Secrets can come from env vars or, under Docker Compose, from files in
//! `/run/secrets`. Everything is optional: without a database the service
//! still serves (empty) envelopes.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::ManagerSettings;
use crate::client::ClientSettings;
use crate::degrade::PipelineSettings;

const DATABASE_URL_SECRET: &str = "/run/secrets/database_url";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub http_port: u16,
    pub sweep_interval_seconds: u64,
    pub persistent_cache_timeout_ms: u64,
    pub sport_config_ttl_seconds: u64,
    pub compute_timeout_ms: u64,
    pub prediction_item_timeout_ms: u64,
    pub prediction_concurrency: usize,
    /// Sports the warmer refreshes; empty means every supported sport.
    pub warm_sports: Vec<String>,
    /// If true, run one warm cycle and exit
    pub run_once: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = match env::var("DATABASE_URL") {
            Ok(v) if !v.trim().is_empty() => Some(v),
            Ok(_) => return Err(anyhow!("DATABASE_URL is set but empty")),
            Err(_) if Path::new(DATABASE_URL_SECRET).exists() => {
                Some(read_secret_file(DATABASE_URL_SECRET, "database_url")?)
            }
            Err(_) => None,
        };

        let redis_url = match env::var("REDIS_URL") {
            Ok(v) if !v.trim().is_empty() => Some(v),
            Ok(_) => return Err(anyhow!("REDIS_URL is set but empty")),
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            redis_url,
            http_port: env_or("HTTP_PORT", 8090)?,
            sweep_interval_seconds: env_or("CACHE_SWEEP_INTERVAL_SECONDS", 60)?,
            persistent_cache_timeout_ms: env_or("PERSISTENT_CACHE_TIMEOUT_MS", 750)?,
            sport_config_ttl_seconds: env_or("SPORT_CONFIG_TTL_SECONDS", 300)?,
            compute_timeout_ms: env_or("COMPUTE_TIMEOUT_MS", 5000)?,
            prediction_item_timeout_ms: env_or("PREDICTION_ITEM_TIMEOUT_MS", 2000)?,
            prediction_concurrency: env_or("PREDICTION_CONCURRENCY", 8)?,
            warm_sports: parse_sports(&env::var("WARM_SPORTS").unwrap_or_default()),
            run_once: env::var("RUN_ONCE")
                .unwrap_or_else(|_| "false".to_string())
                .to_lowercase()
                == "true",
        })
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            store_timeout: Duration::from_millis(self.persistent_cache_timeout_ms),
            sweep_interval: Duration::from_secs(self.sweep_interval_seconds.max(1)),
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            compute_timeout: Duration::from_millis(self.compute_timeout_ms),
            pipeline: PipelineSettings {
                item_timeout: Duration::from_millis(self.prediction_item_timeout_ms),
                concurrency: self.prediction_concurrency.max(1),
            },
            ..ClientSettings::default()
        }
    }

    pub fn sport_config_ttl(&self) -> Duration {
        Duration::from_secs(self.sport_config_ttl_seconds)
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim().parse().with_context(|| format!("Invalid value for {}: {}", name, v)),
        _ => Ok(default),
    }
}

/// Comma-separated sport list, lowercased, blanks dropped.
pub fn parse_sports(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Read a secret from a Docker secret file
fn read_secret_file(file_path: &str, secret_name: &str) -> Result<String> {
    std::fs::read_to_string(file_path)
        .map(|s| s.trim().to_string())
        .context(format!("Secret file unreadable at {} ({})", file_path, secret_name))
}
