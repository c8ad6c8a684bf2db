//! Sport Service Registry.
//!
//! Resolves sport identifiers against the configuration table and lazily
//! constructs one service per (sport, league), at most once per process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use super::config::{builtin_configs, SportConfig};
use super::service::{ServiceFactory, ServiceHandle};
use crate::error::{RegistryError, StoreError};
use crate::store::{DurableStore, RowFilter};

pub const DEFAULT_CONFIG_TTL: Duration = Duration::from_secs(300);
const CONFIG_LOAD_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of one (sport, league) service slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Unregistered,
    Constructing,
    Ready,
}

/// Where the active configuration set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    Store,
    Builtin,
}

/// An immutable snapshot of every sport's configuration.
#[derive(Debug)]
pub struct ConfigSet {
    configs: HashMap<String, Arc<SportConfig>>,
    order: Vec<String>,
    pub generation: u64,
    pub origin: ConfigOrigin,
    loaded_at: Instant,
}

impl ConfigSet {
    fn new(configs: Vec<SportConfig>, generation: u64, origin: ConfigOrigin) -> Self {
        let order = configs.iter().map(|c| c.name.clone()).collect();
        let configs = configs.into_iter().map(|c| (c.name.clone(), Arc::new(c))).collect();
        Self {
            configs,
            order,
            generation,
            origin,
            loaded_at: Instant::now(),
        }
    }

    /// Same configs and generation, with the TTL restarted.
    fn renewed(&self) -> Self {
        Self {
            configs: self.configs.clone(),
            order: self.order.clone(),
            generation: self.generation,
            origin: self.origin,
            loaded_at: Instant::now(),
        }
    }

    pub fn get(&self, sport: &str) -> Option<&Arc<SportConfig>> {
        self.configs.get(sport)
    }

    pub fn sports(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &SportConfig> {
        self.order.iter().filter_map(|name| self.configs.get(name).map(|c| c.as_ref()))
    }
}

#[derive(Default)]
struct ServiceSlot {
    cell: OnceCell<ServiceHandle>,
    constructing: AtomicBool,
}

/// Clears the constructing flag however construction ends.
struct ConstructingFlag<'a>(&'a AtomicBool);

impl<'a> ConstructingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ConstructingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub fn normalize_sport(sport: &str) -> String {
    sport.trim().to_lowercase()
}

pub struct SportRegistry {
    store: Arc<dyn DurableStore>,
    factory: Arc<dyn ServiceFactory>,
    config_ttl: Duration,
    configs: RwLock<Option<Arc<ConfigSet>>>,
    reload: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    services: Mutex<HashMap<(String, String), Arc<ServiceSlot>>>,
}

impl SportRegistry {
    pub fn new(store: Arc<dyn DurableStore>, factory: Arc<dyn ServiceFactory>) -> Self {
        Self {
            store,
            factory,
            config_ttl: DEFAULT_CONFIG_TTL,
            configs: RwLock::new(None),
            reload: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            services: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config_ttl(mut self, ttl: Duration) -> Self {
        self.config_ttl = ttl;
        self
    }

    /// Current configuration set, reloading it once it is older than the TTL.
    pub async fn configs(&self) -> Arc<ConfigSet> {
        if let Some(set) = self.fresh_configs().await {
            return set;
        }

        let _reloading = self.reload.lock().await;
        if let Some(set) = self.fresh_configs().await {
            return set;
        }

        let previous = self.configs.read().await.clone();
        let set = Arc::new(match (self.load_from_store().await, previous) {
            (Ok(configs), _) if !configs.is_empty() => {
                let generation = self.next_generation();
                info!("Loaded {} sport configs from store (generation {})", configs.len(), generation);
                ConfigSet::new(configs, generation, ConfigOrigin::Store)
            }
            (Ok(_), _) => {
                warn!("No sport configs in store; using built-in table");
                ConfigSet::new(builtin_configs(), self.next_generation(), ConfigOrigin::Builtin)
            }
            (Err(e), Some(previous)) if previous.origin == ConfigOrigin::Store => {
                warn!(
                    "Failed to reload sport configs ({}); keeping generation {} from store",
                    e, previous.generation
                );
                previous.renewed()
            }
            (Err(e), _) => {
                warn!("Failed to load sport configs ({}); using built-in table", e);
                ConfigSet::new(builtin_configs(), self.next_generation(), ConfigOrigin::Builtin)
            }
        });

        *self.configs.write().await = Some(Arc::clone(&set));
        set
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn fresh_configs(&self) -> Option<Arc<ConfigSet>> {
        self.configs
            .read()
            .await
            .as_ref()
            .filter(|set| set.loaded_at.elapsed() < self.config_ttl)
            .cloned()
    }

    async fn load_from_store(&self) -> Result<Vec<SportConfig>, StoreError> {
        let filter = RowFilter::new().order_by("name", true);
        let rows = tokio::time::timeout(CONFIG_LOAD_TIMEOUT, self.store.read("sport_configs", &filter))
            .await
            .map_err(|_| StoreError::Unavailable("sport config load timed out".to_string()))??;

        let mut configs = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<SportConfig>(row) {
                Ok(mut config) => {
                    config.name = normalize_sport(&config.name);
                    configs.push(config);
                }
                Err(e) => warn!("Skipping malformed sport config row: {}", e),
            }
        }
        Ok(configs)
    }

    pub async fn is_sport_supported(&self, sport: &str) -> bool {
        self.configs().await.get(&normalize_sport(sport)).is_some()
    }

    pub async fn get_supported_sports(&self) -> Vec<String> {
        self.configs().await.sports().to_vec()
    }

    pub async fn sport_config(&self, sport: &str) -> Result<Arc<SportConfig>, RegistryError> {
        let sport = normalize_sport(sport);
        self.configs()
            .await
            .get(&sport)
            .cloned()
            .ok_or(RegistryError::UnsupportedSport(sport))
    }

    pub async fn get_default_league(&self, sport: &str) -> Result<String, RegistryError> {
        Ok(self.sport_config(sport).await?.default_league.clone())
    }

    /// Resolve `league` (or the sport's default) and check the sport accepts it.
    pub async fn resolve_league(&self, sport: &str, league: Option<&str>) -> Result<String, RegistryError> {
        let config = self.sport_config(sport).await?;
        let league = match league.map(normalize_sport).filter(|l| !l.is_empty()) {
            Some(league) => league,
            None => config.default_league.clone(),
        };
        if !config.supports_league(&league) {
            return Err(RegistryError::UnsupportedLeague {
                sport: config.name.clone(),
                league,
            });
        }
        Ok(league)
    }

    /// The service for (sport, league), constructing it on first use.
    ///
    /// Concurrent first calls share one construction. A failed construction
    /// leaves the slot unregistered so a later call retries.
    pub async fn get_service(&self, sport: &str, league: Option<&str>) -> Result<ServiceHandle, RegistryError> {
        let config = self.sport_config(sport).await?;
        let league = self.resolve_league(&config.name, league).await?;

        let slot = {
            let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(services.entry((config.name.clone(), league.clone())).or_default())
        };

        let handle = slot
            .cell
            .get_or_try_init(|| async {
                let _flag = ConstructingFlag::raise(&slot.constructing);
                info!("Constructing {} service for league {}", config.name, league);
                self.factory
                    .build(Arc::clone(&config), &league)
                    .await
                    .map_err(|source| RegistryError::Construction {
                        sport: config.name.clone(),
                        league: league.clone(),
                        source,
                    })
            })
            .await?;

        Ok(Arc::clone(handle))
    }

    pub fn service_state(&self, sport: &str, league: &str) -> ServiceState {
        let services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        match services.get(&(normalize_sport(sport), normalize_sport(league))) {
            Some(slot) if slot.cell.initialized() => ServiceState::Ready,
            Some(slot) if slot.constructing.load(Ordering::SeqCst) => ServiceState::Constructing,
            _ => ServiceState::Unregistered,
        }
    }
}
