//! Sport configuration, per-sport services and the registry that owns them.

mod config;
mod limits;
mod registry;
mod service;

pub use config::{builtin_configs, SportConfig, CANONICAL_STATUSES};
pub use limits::ProviderLimits;
pub use registry::{normalize_sport, ConfigOrigin, ConfigSet, ServiceState, SportRegistry, DEFAULT_CONFIG_TTL};
pub use service::{
    DatabaseServiceFactory, DatabaseSportService, GamesQuery, OddsQuery, ServiceFactory, ServiceHandle, SportService,
    DEFAULT_LIMIT, MAX_LIMIT,
};
