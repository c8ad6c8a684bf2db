//! Sports data serving service.
//!
//! Hosts the database-first [`DataClient`]: keeps the cache warm for the
//! configured sports and exposes health and cache statistics over HTTP.
//!
//! - Postgres is the durable store; without it the service runs offline
//!   and serves empty envelopes instead of failing
//! - Redis (optional) receives cache invalidation notices

use anyhow::Result;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use sportscache::cache::{CacheManager, DataType, ManagerStats, Volatility};
use sportscache::predictions::StoredPredictionEngine;
use sportscache::sports::{DatabaseServiceFactory, SportRegistry};
use sportscache::store::{DurableStore, OfflineStore, PgStore};
use sportscache::{cache::RedisInvalidationSink, Config, DataClient, GamesRequest, OddsRequest};

const CONNECT_RETRIES: u32 = 5;

/// Service health state
#[derive(Clone)]
struct HealthState {
    instance_id: Uuid,
    store_online: bool,
    last_warm_time: Arc<RwLock<Option<DateTime<Utc>>>>,
    warm_cycles: Arc<RwLock<u64>>,
    error_count: Arc<RwLock<usize>>,
}

impl HealthState {
    fn new(store_online: bool) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            store_online,
            last_warm_time: Arc::new(RwLock::new(None)),
            warm_cycles: Arc::new(RwLock::new(0)),
            error_count: Arc::new(RwLock::new(0)),
        }
    }

    async fn record_success(&self) {
        *self.last_warm_time.write().await = Some(Utc::now());
        *self.warm_cycles.write().await += 1;
        *self.error_count.write().await = 0;
    }

    async fn record_error(&self) {
        *self.error_count.write().await += 1;
    }
}

#[derive(Clone)]
struct AppState {
    client: Arc<DataClient>,
    health: HealthState,
}

async fn connect_store(config: &Config) -> (Arc<dyn DurableStore>, bool) {
    let Some(url) = &config.database_url else {
        warn!("DATABASE_URL not set; running with an offline durable store");
        return (Arc::new(OfflineStore), false);
    };

    match PgStore::connect_with_retry(url, CONNECT_RETRIES).await {
        Ok(store) => {
            if let Err(e) = store.ensure_schema().await {
                warn!("Failed to ensure cache schema: {}", e);
            }
            (Arc::new(store), true)
        }
        Err(e) => {
            error!("{}; running with an offline durable store", e);
            (Arc::new(OfflineStore), false)
        }
    }
}

/// Refresh the default queries for one sport. Returns false if any read
/// was rejected.
async fn warm_sport(client: &DataClient, sport: &str) -> bool {
    let live = GamesRequest {
        status: Some("live".to_string()),
        ..Default::default()
    };
    let served = [
        client.games(sport, &GamesRequest::default()).await,
        client.games(sport, &live).await,
        client.odds(sport, &OddsRequest::default()).await,
    ];

    for envelope in &served {
        info!(
            "Warmed {} {}: {} rows from {:?}",
            sport, envelope.meta.data_type, envelope.meta.count, envelope.meta.source
        );
    }
    served.iter().all(|envelope| envelope.success)
}

async fn warm_sports(client: &DataClient, config: &Config) -> Vec<String> {
    let supported = client.registry().get_supported_sports().await;
    if config.warm_sports.is_empty() {
        return supported;
    }
    config
        .warm_sports
        .iter()
        .filter(|sport| {
            let known = supported.contains(*sport);
            if !known {
                warn!("Ignoring unsupported sport '{}' in WARM_SPORTS", sport);
            }
            known
        })
        .cloned()
        .collect()
}

/// Keep one sport warm at its live-games refresh cadence.
async fn run_warmer(client: Arc<DataClient>, health: HealthState, sport: String) {
    loop {
        if warm_sport(&client, &sport).await {
            health.record_success().await;
        } else {
            health.record_error().await;
        }

        let cadence = match client.registry().sport_config(&sport).await {
            Ok(config) => config.refresh_interval(DataType::Games, Volatility::Live),
            Err(e) => {
                warn!("{}; retrying warm-up in 60s", e);
                Duration::from_secs(60)
            }
        };
        tokio::time::sleep(cadence).await;
    }
}

/// Health check handler
async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let last_warm = state.health.last_warm_time.read().await;
    let cycles = state.health.warm_cycles.read().await;
    let errors = state.health.error_count.read().await;
    let sports = state.client.registry().get_supported_sports().await;

    let status = if *errors > 5 || !state.health.store_online {
        "degraded"
    } else {
        "ok"
    };

    let http_status = if *errors > 10 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        http_status,
        Json(json!({
            "service": "sportscache",
            "version": env!("CARGO_PKG_VERSION"),
            "instance": state.health.instance_id.to_string(),
            "status": status,
            "store_online": state.health.store_online,
            "supported_sports": sports,
            "last_warm": last_warm.map(|t| t.to_rfc3339()),
            "warm_cycles": *cycles,
            "consecutive_errors": *errors
        })),
    )
}

async fn stats_handler(State(state): State<AppState>) -> Json<ManagerStats> {
    Json(state.client.cache().get_stats().await)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("sportscache=info".parse()?),
        )
        .init();

    let config = Config::from_env()?;
    info!("Sports cache service v{}", env!("CARGO_PKG_VERSION"));

    let (store, store_online) = connect_store(&config).await;

    let manager_settings = config.manager_settings();
    let (manager, tiers) = CacheManager::two_tier(Arc::clone(&store), &manager_settings);
    let manager = match &config.redis_url {
        Some(url) => match RedisInvalidationSink::connect_with_retry(url, CONNECT_RETRIES).await {
            Ok(sink) => manager.with_sink(Arc::new(sink)),
            Err(e) => {
                warn!("{}; cache invalidations will not be published", e);
                manager
            }
        },
        None => manager,
    };
    let manager = Arc::new(manager);

    let factory = Arc::new(DatabaseServiceFactory::new(Arc::clone(&store)));
    let registry = Arc::new(SportRegistry::new(Arc::clone(&store), factory).with_config_ttl(config.sport_config_ttl()));
    let engine = Arc::new(StoredPredictionEngine::new(Arc::clone(&store)));
    let client = Arc::new(DataClient::new(registry, manager, engine, config.client_settings()));

    let health = HealthState::new(store_online);
    info!("Instance {}", health.instance_id);

    let sports = warm_sports(&client, &config).await;

    if config.run_once {
        info!("Running in one-shot mode (RUN_ONCE=true)");
        let mut failed = 0;
        for sport in &sports {
            if !warm_sport(&client, sport).await {
                failed += 1;
            }
        }
        info!("One-shot warm-up completed: {} sports, {} with rejected reads", sports.len(), failed);
        return Ok(());
    }

    let sweeper = tiers.memory.spawn_sweeper(manager_settings.sweep_interval);
    let persistent = Arc::clone(&tiers.persistent);
    let purge_interval = manager_settings.sweep_interval;
    let purger = tokio::spawn(async move {
        loop {
            tokio::time::sleep(purge_interval).await;
            match persistent.purge_expired().await {
                Ok(0) => {}
                Ok(n) => info!("Purged {} expired persistent cache entries", n),
                Err(e) => warn!("Persistent cache purge skipped: {}", e),
            }
        }
    });

    info!("Warming {} sports: {}", sports.len(), sports.join(", "));
    for sport in sports {
        tokio::spawn(run_warmer(Arc::clone(&client), health.clone(), sport));
    }

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(AppState {
            client: Arc::clone(&client),
            health,
        });

    let addr = format!("0.0.0.0:{}", config.http_port);
    info!("HTTP endpoint listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let server = axum::serve(listener, app).into_future();
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("HTTP server error: {:?}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    sweeper.abort();
    purger.abort();
    Ok(())
}
