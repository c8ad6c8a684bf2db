//! Per-provider request budgets for a sport.

use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use tracing::warn;

use super::config::SportConfig;

type DirectLimiter =
    RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

/// One direct limiter per provider, built from `rate_limits` (requests per minute).
///
/// Providers without a configured limit are not throttled.
pub struct ProviderLimits {
    limiters: HashMap<String, DirectLimiter>,
}

impl ProviderLimits {
    pub fn from_config(config: &SportConfig) -> Self {
        let mut limiters = HashMap::new();
        for (provider, per_minute) in &config.rate_limits {
            match NonZeroU32::new(*per_minute) {
                Some(per_minute) => {
                    limiters.insert(provider.clone(), RateLimiter::direct(Quota::per_minute(per_minute)));
                }
                None => warn!(
                    "Ignoring zero rate limit for provider '{}' ({})",
                    provider, config.name
                ),
            }
        }
        Self { limiters }
    }

    /// Take one request from the provider's budget without waiting.
    pub fn try_acquire(&self, provider: &str) -> bool {
        self.limiters
            .get(provider)
            .map(|limiter| limiter.check().is_ok())
            .unwrap_or(true)
    }

    /// Wait until the provider's budget allows one more request.
    pub async fn until_ready(&self, provider: &str) {
        if let Some(limiter) = self.limiters.get(provider) {
            limiter.until_ready().await;
        }
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut providers: Vec<&str> = self.limiters.keys().map(String::as_str).collect();
        providers.sort();
        providers
    }
}
