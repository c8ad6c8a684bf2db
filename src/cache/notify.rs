//! Cross-process invalidation notices.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{info, warn};

use super::entry::KeyPattern;

pub const INVALIDATION_STREAM: &str = "cache.invalidations";

/// Receives every bulk invalidation the manager performs.
#[async_trait]
pub trait InvalidationSink: Send + Sync {
    async fn publish(&self, pattern: &KeyPattern) -> Result<()>;
}

/// Appends invalidations to a Redis stream so peer processes can drop
/// their memory tier.
#[derive(Clone)]
pub struct RedisInvalidationSink {
    redis: redis::aio::ConnectionManager,
}

impl RedisInvalidationSink {
    pub fn new(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis }
    }

    pub async fn connect_with_retry(url: &str, max_retries: u32) -> Result<Self> {
        let mut attempt = 0;
        loop {
            let connected = match redis::Client::open(url) {
                Ok(client) => redis::aio::ConnectionManager::new(client).await,
                Err(e) => Err(e),
            };
            match connected {
                Ok(conn) => {
                    info!("Connected to Redis");
                    return Ok(Self::new(conn));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_retries {
                        return Err(anyhow!("Failed to connect to Redis after {} attempts: {}", max_retries, e));
                    }
                    warn!("Redis connection attempt {} failed: {}. Retrying...", attempt, e);
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
            }
        }
    }
}

#[async_trait]
impl InvalidationSink for RedisInvalidationSink {
    async fn publish(&self, pattern: &KeyPattern) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: String = conn
            .xadd(
                INVALIDATION_STREAM,
                "*",
                &[
                    ("pattern", pattern.as_str().to_string()),
                    ("at", Utc::now().to_rfc3339()),
                ],
            )
            .await?;
        Ok(())
    }
}
