//! Database-first data client.
//!
//! Every read resolves the sport's service through the registry, builds a
//! key from the normalized query, and goes through [`CacheManager::warmup`].
//! The caller always gets an [`Envelope`]; failures become empty data.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheManager, CacheStrategy, Computed, DataType, EntryMeta, Source};
use crate::degrade::{self, BatchSummary, DegradedResult, PipelineSettings};
use crate::error::{RegistryError, ServiceError};
use crate::predictions::{fallback_prediction, GameRef, Prediction, PredictionEngine};
use crate::sports::{normalize_sport, GamesQuery, OddsQuery, ServiceHandle, SportRegistry};

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Budget for one service computation on a cache miss.
    pub compute_timeout: Duration,
    /// Horizon for the games that get predictions.
    pub days_ahead: u32,
    pub pipeline: PipelineSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            compute_timeout: Duration::from_secs(5),
            days_ahead: 7,
            pipeline: PipelineSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMeta {
    pub source: Source,
    pub count: usize,
    pub sport: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub league: Option<String>,
    pub data_type: DataType,
    pub timestamp: DateTime<Utc>,
    /// True when the data was computed for this request.
    pub refreshed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation: Option<BatchSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response shape for every served dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub success: bool,
    pub data: Vec<Value>,
    pub meta: EnvelopeMeta,
}

impl Envelope {
    fn new(data_type: DataType, sport: &str, league: Option<&str>, source: Source, data: Vec<Value>) -> Self {
        Self {
            success: true,
            meta: EnvelopeMeta {
                source,
                count: data.len(),
                sport: sport.to_string(),
                league: league.map(str::to_string),
                data_type,
                timestamp: Utc::now(),
                refreshed: source == Source::Computed,
                degradation: None,
                error: None,
            },
            data,
        }
    }

    fn rejected(data_type: DataType, sport: &str, error: &RegistryError) -> Self {
        let mut envelope = Self::new(data_type, sport, None, Source::Computed, Vec::new());
        envelope.success = false;
        envelope.meta.refreshed = false;
        envelope.meta.error = Some(error.to_string());
        envelope
    }
}

fn into_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GamesRequest {
    pub league: Option<String>,
    pub status: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OddsRequest {
    pub league: Option<String>,
    pub game_id: Option<String>,
    pub bookmaker: Option<String>,
    pub limit: Option<u32>,
}

/// Cached prediction payload; the summary travels with the items.
#[derive(Debug, Serialize, serde::Deserialize)]
struct PredictionBatch {
    predictions: Vec<DegradedResult<Prediction>>,
    degradation: BatchSummary,
}

pub struct DataClient {
    registry: Arc<SportRegistry>,
    cache: Arc<CacheManager>,
    engine: Arc<dyn PredictionEngine>,
    settings: ClientSettings,
    strategy_generation: AtomicU64,
}

impl DataClient {
    pub fn new(
        registry: Arc<SportRegistry>,
        cache: Arc<CacheManager>,
        engine: Arc<dyn PredictionEngine>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            registry,
            cache,
            engine,
            settings,
            strategy_generation: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SportRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Rebuild the TTL overrides whenever the registry reloaded its configs.
    async fn sync_strategy(&self) {
        let configs = self.registry.configs().await;
        let seen = self.strategy_generation.swap(configs.generation, Ordering::SeqCst);
        if seen != configs.generation {
            debug!("Refreshing cache strategy for config generation {}", configs.generation);
            self.cache.replace_strategy(CacheStrategy::from_configs(configs.iter()));
        }
    }

    async fn resolve(
        &self,
        data_type: DataType,
        sport: &str,
        league: Option<&str>,
    ) -> Result<ServiceHandle, Envelope> {
        self.sync_strategy().await;
        match self.registry.get_service(sport, league).await {
            Ok(service) => Ok(service),
            Err(e @ RegistryError::Construction { .. }) => {
                warn!("{}; serving empty {}", e, data_type);
                let league = league.map(normalize_sport);
                Err(Envelope::new(data_type, &normalize_sport(sport), league.as_deref(), Source::Computed, Vec::new()))
            }
            Err(e) => {
                debug!("Rejected {} request: {}", data_type, e);
                Err(Envelope::rejected(data_type, &normalize_sport(sport), &e))
            }
        }
    }

    /// Bound one service call by the compute budget.
    async fn bounded<T, Fut>(&self, call: Fut) -> Result<T, ServiceError>
    where
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let timeout = self.settings.compute_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ServiceError::Timeout(timeout))?
    }

    /// Read-through for one key. A failed computation is served as empty
    /// data and not cached.
    async fn serve<F, Fut>(&self, service: &ServiceHandle, key: &str, meta: &EntryMeta, compute: F) -> (Source, Value)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Computed, ServiceError>>,
    {
        match self.cache.warmup(key, meta, compute).await {
            Ok(served) => (served.source, served.value),
            Err(e) => {
                warn!(
                    "{} service for {}/{} failed on '{}': {}",
                    meta.data_type,
                    service.sport(),
                    service.league(),
                    key,
                    e
                );
                (Source::Computed, Value::Array(Vec::new()))
            }
        }
    }

    async fn serve_rows<F, Fut>(
        &self,
        data_type: DataType,
        service: &ServiceHandle,
        params: &[(&str, Option<String>)],
        meta: EntryMeta,
        compute: F,
    ) -> Envelope
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Value>, ServiceError>>,
    {
        let key = self.key(data_type, service, params);
        let (source, value) = self
            .serve(service, &key, &meta, || async move {
                let rows = self.bounded(compute()).await?;
                Ok::<Computed, ServiceError>(Computed::cacheable(Value::Array(rows)))
            })
            .await;
        Envelope::new(data_type, service.sport(), Some(service.league()), source, into_rows(value))
    }

    fn key(&self, data_type: DataType, service: &ServiceHandle, params: &[(&str, Option<String>)]) -> String {
        let mut all = Vec::with_capacity(params.len() + 1);
        all.push(("league", Some(service.league().to_string())));
        all.extend(params.iter().cloned());
        CacheKey::compose(data_type, Some(service.sport()), &all)
    }

    pub async fn games(&self, sport: &str, request: &GamesRequest) -> Envelope {
        let service = match self.resolve(DataType::Games, sport, request.league.as_deref()).await {
            Ok(service) => service,
            Err(envelope) => return envelope,
        };

        let query = GamesQuery {
            status: request.status.as_deref().map(|s| service.config().normalize_status(s)),
            from: request.from,
            to: request.to,
            limit: request.limit,
        };
        let params = [
            ("status", query.status.clone()),
            ("from", query.from.map(|t| t.to_rfc3339())),
            ("to", query.to.map(|t| t.to_rfc3339())),
            ("limit", query.limit.map(|l| l.to_string())),
        ];
        let mut meta = EntryMeta::new(DataType::Games, service.sport());
        if query.status.as_deref() == Some("live") {
            meta = meta.live();
        }

        let svc = Arc::clone(&service);
        self.serve_rows(DataType::Games, &service, &params, meta, || async move { svc.games(&query).await })
            .await
    }

    pub async fn teams(&self, sport: &str, league: Option<&str>) -> Envelope {
        let service = match self.resolve(DataType::Teams, sport, league).await {
            Ok(service) => service,
            Err(envelope) => return envelope,
        };
        let meta = EntryMeta::new(DataType::Teams, service.sport());
        let svc = Arc::clone(&service);
        self.serve_rows(DataType::Teams, &service, &[], meta, || async move { svc.teams().await })
            .await
    }

    pub async fn odds(&self, sport: &str, request: &OddsRequest) -> Envelope {
        let service = match self.resolve(DataType::Odds, sport, request.league.as_deref()).await {
            Ok(service) => service,
            Err(envelope) => return envelope,
        };

        let query = OddsQuery {
            game_id: request.game_id.clone(),
            bookmaker: request.bookmaker.as_deref().map(|b| b.trim().to_lowercase()),
            limit: request.limit,
        };
        let params = [
            ("game", query.game_id.clone()),
            ("bookmaker", query.bookmaker.clone()),
            ("limit", query.limit.map(|l| l.to_string())),
        ];
        let meta = EntryMeta::new(DataType::Odds, service.sport());
        let svc = Arc::clone(&service);
        self.serve_rows(DataType::Odds, &service, &params, meta, || async move { svc.odds(&query).await })
            .await
    }

    pub async fn standings(&self, sport: &str, league: Option<&str>, season: Option<&str>) -> Envelope {
        let service = match self.resolve(DataType::Standings, sport, league).await {
            Ok(service) => service,
            Err(envelope) => return envelope,
        };
        let season = season.map(str::to_string);
        let params = [("season", season.clone())];
        let meta = EntryMeta::new(DataType::Standings, service.sport());
        let svc = Arc::clone(&service);
        self.serve_rows(DataType::Standings, &service, &params, meta, || async move {
            svc.standings(season.as_deref()).await
        })
        .await
    }

    /// One prediction per upcoming game. Games whose prediction fails carry
    /// the sport's fallback prediction; a batch with no real prediction is
    /// served but not cached.
    ///
    /// Only the games read runs under the compute budget. Each game then gets
    /// its own timeout from the pipeline settings.
    pub async fn predictions(&self, sport: &str, league: Option<&str>) -> Envelope {
        let service = match self.resolve(DataType::Predictions, sport, league).await {
            Ok(service) => service,
            Err(envelope) => return envelope,
        };

        let days_ahead = self.settings.days_ahead;
        let params = [("days", Some(days_ahead.to_string()))];
        let key = self.key(DataType::Predictions, &service, &params);
        let meta = EntryMeta::new(DataType::Predictions, service.sport());

        let svc = Arc::clone(&service);
        let (source, value) = self
            .serve(&service, &key, &meta, || async move {
                let games = self.bounded(svc.upcoming_games(days_ahead)).await?;
                let batch = self.predict_batch(&svc, games).await;
                let keep = batch.degradation.total > 0 && !batch.degradation.all_degraded();
                let value = serde_json::to_value(&batch)
                    .map_err(|e| ServiceError::InvalidQuery(format!("unserializable prediction batch: {}", e)))?;
                Ok::<Computed, ServiceError>(if !keep {
                    Computed::transient(value)
                } else {
                    Computed::cacheable(value)
                })
            })
            .await;

        let (data, degradation) = match serde_json::from_value::<PredictionBatch>(value) {
            Ok(batch) => {
                let data = batch
                    .predictions
                    .iter()
                    .filter_map(|p| serde_json::to_value(p).ok())
                    .collect();
                (data, batch.degradation)
            }
            Err(_) => (Vec::new(), BatchSummary::default()),
        };

        let mut envelope = Envelope::new(DataType::Predictions, service.sport(), Some(service.league()), source, data);
        envelope.meta.degradation = Some(degradation);
        envelope
    }

    async fn predict_batch(&self, service: &ServiceHandle, games: Vec<Value>) -> PredictionBatch {
        let config = Arc::new(service.config().clone());
        let engine = Arc::clone(&self.engine);

        let predictions = degrade::run(
            games,
            &self.settings.pipeline,
            |row| {
                let engine = Arc::clone(&engine);
                let config = Arc::clone(&config);
                async move {
                    let game = GameRef::from_row(&row)?;
                    engine.predict(&config, &game).await
                }
            },
            |row| {
                let id = GameRef::from_row(row).map(|g| g.id).unwrap_or_default();
                fallback_prediction(&config, &id)
            },
        )
        .await;

        let degradation = BatchSummary::of(&predictions);
        if degradation.degraded > 0 {
            warn!(
                "{} of {} {} predictions degraded to fallback",
                degradation.degraded,
                degradation.total,
                service.sport()
            );
        }
        PredictionBatch {
            predictions,
            degradation,
        }
    }

    /// Accuracy per prediction type over predictions whose outcome is known.
    pub async fn accuracy(&self, sport: &str, league: Option<&str>) -> Envelope {
        let service = match self.resolve(DataType::Analytics, sport, league).await {
            Ok(service) => service,
            Err(envelope) => return envelope,
        };
        let params = [("metric", Some("accuracy".to_string()))];
        let meta = EntryMeta::new(DataType::Analytics, service.sport());
        let svc = Arc::clone(&service);
        self.serve_rows(DataType::Analytics, &service, &params, meta, || async move {
            Ok::<_, ServiceError>(accuracy_by_type(&svc.prediction_outcomes().await?))
        })
        .await
    }

    pub async fn invalidate_sport(&self, sport: &str) -> u64 {
        self.cache.clear_by_sport(&normalize_sport(sport)).await
    }

    pub async fn invalidate_type(&self, data_type: DataType) -> u64 {
        self.cache.clear_by_type(data_type).await
    }
}

fn is_correct(row: &Value) -> Option<bool> {
    match row.get("is_correct")? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn accuracy_by_type(outcomes: &[Value]) -> Vec<Value> {
    let mut tally: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
    for row in outcomes {
        let (Some(kind), Some(correct)) = (row.get("prediction_type").and_then(Value::as_str), is_correct(row)) else {
            continue;
        };
        let entry = tally.entry(kind).or_default();
        entry.0 += 1;
        if correct {
            entry.1 += 1;
        }
    }

    tally
        .into_iter()
        .map(|(kind, (evaluated, correct))| {
            json!({
                "predictionType": kind,
                "evaluated": evaluated,
                "correct": correct,
                "accuracy": correct as f64 / evaluated as f64,
            })
        })
        .collect()
}
