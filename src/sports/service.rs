//! Sport services: the capability each registered sport must provide.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::Arc;

use super::config::SportConfig;
use super::limits::ProviderLimits;
use crate::error::ServiceError;
use crate::store::{DurableStore, RowFilter};

pub const DEFAULT_LIMIT: u32 = 100;
pub const MAX_LIMIT: u32 = 500;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GamesQuery {
    /// Already normalized to a canonical status.
    pub status: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OddsQuery {
    pub game_id: Option<String>,
    pub bookmaker: Option<String>,
    pub limit: Option<u32>,
}

/// Shared handle to a constructed service.
pub type ServiceHandle = Arc<dyn SportService>;

/// Read capability for one (sport, league). Implementations read the durable
/// store only; third-party providers are synced in the background elsewhere.
#[async_trait]
pub trait SportService: Send + Sync {
    fn sport(&self) -> &str;

    fn league(&self) -> &str;

    fn config(&self) -> &SportConfig;

    fn limits(&self) -> &ProviderLimits;

    async fn games(&self, query: &GamesQuery) -> Result<Vec<Value>, ServiceError>;

    /// Scheduled games starting within `days_ahead` days.
    async fn upcoming_games(&self, days_ahead: u32) -> Result<Vec<Value>, ServiceError>;

    async fn teams(&self) -> Result<Vec<Value>, ServiceError>;

    async fn odds(&self, query: &OddsQuery) -> Result<Vec<Value>, ServiceError>;

    async fn standings(&self, season: Option<&str>) -> Result<Vec<Value>, ServiceError>;

    /// Predictions whose outcome has been evaluated.
    async fn prediction_outcomes(&self) -> Result<Vec<Value>, ServiceError>;
}

/// Builds services on first use.
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    async fn build(&self, config: Arc<SportConfig>, league: &str) -> Result<ServiceHandle, ServiceError>;
}

pub(crate) fn checked_limit(limit: Option<u32>) -> Result<u32, ServiceError> {
    match limit {
        None => Ok(DEFAULT_LIMIT),
        Some(0) => Err(ServiceError::InvalidQuery("limit must be positive".to_string())),
        Some(n) => Ok(n.min(MAX_LIMIT)),
    }
}

/// Service over the durable store tables `games`, `teams`, `odds`,
/// `standings` and `predictions`, all keyed by `sport` and `league`.
pub struct DatabaseSportService {
    config: Arc<SportConfig>,
    league: String,
    store: Arc<dyn DurableStore>,
    limits: ProviderLimits,
}

impl DatabaseSportService {
    pub fn new(config: Arc<SportConfig>, league: &str, store: Arc<dyn DurableStore>) -> Self {
        let limits = ProviderLimits::from_config(&config);
        Self {
            config,
            league: league.to_string(),
            store,
            limits,
        }
    }

    fn scoped(&self) -> RowFilter {
        RowFilter::new()
            .eq("sport", self.config.name.as_str())
            .eq("league", self.league.as_str())
    }

    /// Rewrite provider `status`/`period` vocabulary into canonical labels.
    fn normalize_game(&self, mut row: Value) -> Value {
        if let Some(obj) = row.as_object_mut() {
            if let Some(status) = obj.get("status").and_then(Value::as_str).map(str::to_string) {
                obj.insert("status".to_string(), Value::String(self.config.normalize_status(&status)));
            }
            let period = match obj.get("period") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            };
            if let Some(period) = period {
                obj.insert("period".to_string(), Value::String(self.config.normalize_period(&period)));
            }
        }
        row
    }
}

#[async_trait]
impl SportService for DatabaseSportService {
    fn sport(&self) -> &str {
        &self.config.name
    }

    fn league(&self) -> &str {
        &self.league
    }

    fn config(&self) -> &SportConfig {
        &self.config
    }

    fn limits(&self) -> &ProviderLimits {
        &self.limits
    }

    /// Stored statuses are provider vocabulary, so a status filter is applied
    /// after normalization and before the limit.
    async fn games(&self, query: &GamesQuery) -> Result<Vec<Value>, ServiceError> {
        let limit = checked_limit(query.limit)?;
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(ServiceError::InvalidQuery("date range is reversed".to_string()));
            }
        }
        let status = query.status.as_deref().map(|s| self.config.normalize_status(s));

        let mut filter = self.scoped();
        if let Some(from) = query.from {
            filter = filter.gte("game_date", from);
        }
        if let Some(to) = query.to {
            filter = filter.lte("game_date", to);
        }
        let mut filter = filter.order_by("game_date", true);
        if status.is_none() {
            filter = filter.limit(limit);
        }

        let rows = self.store.read("games", &filter).await?;
        Ok(rows
            .into_iter()
            .map(|row| self.normalize_game(row))
            .filter(|row| match &status {
                Some(status) => row.get("status").and_then(Value::as_str) == Some(status.as_str()),
                None => true,
            })
            .take(limit as usize)
            .collect())
    }

    async fn upcoming_games(&self, days_ahead: u32) -> Result<Vec<Value>, ServiceError> {
        let now = Utc::now();
        self.games(&GamesQuery {
            status: Some("scheduled".to_string()),
            from: Some(now),
            to: Some(now + ChronoDuration::days(i64::from(days_ahead))),
            limit: Some(MAX_LIMIT),
        })
        .await
    }

    async fn teams(&self) -> Result<Vec<Value>, ServiceError> {
        let filter = self.scoped().order_by("name", true);
        Ok(self.store.read("teams", &filter).await?)
    }

    async fn odds(&self, query: &OddsQuery) -> Result<Vec<Value>, ServiceError> {
        let mut filter = self.scoped();
        if let Some(game_id) = &query.game_id {
            filter = filter.eq("game_id", game_id.as_str());
        }
        if let Some(bookmaker) = &query.bookmaker {
            filter = filter.eq("source", bookmaker.as_str());
        }
        let filter = filter.order_by("timestamp", false).limit(checked_limit(query.limit)?);
        Ok(self.store.read("odds", &filter).await?)
    }

    async fn standings(&self, season: Option<&str>) -> Result<Vec<Value>, ServiceError> {
        let mut filter = self.scoped();
        if let Some(season) = season {
            filter = filter.eq("season", season);
        }
        Ok(self.store.read("standings", &filter.order_by("rank", true)).await?)
    }

    async fn prediction_outcomes(&self) -> Result<Vec<Value>, ServiceError> {
        let filter = self.scoped().not_null("is_correct");
        Ok(self.store.read("predictions", &filter).await?)
    }
}

/// Builds [`DatabaseSportService`]s over a shared store.
pub struct DatabaseServiceFactory {
    store: Arc<dyn DurableStore>,
}

impl DatabaseServiceFactory {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ServiceFactory for DatabaseServiceFactory {
    async fn build(&self, config: Arc<SportConfig>, league: &str) -> Result<ServiceHandle, ServiceError> {
        Ok(Arc::new(DatabaseSportService::new(config, league, Arc::clone(&self.store))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sports::builtin_configs;
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn service() -> (DatabaseSportService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_rows(
                "games",
                vec![
                    json!({"id": "g1", "sport": "basketball", "league": "nba", "status": "STATUS_IN_PROGRESS", "period": 2, "game_date": "2024-03-01T00:00:00Z"}),
                    json!({"id": "g2", "sport": "basketball", "league": "nba", "status": "live", "game_date": "2024-03-01T02:00:00Z"}),
                    json!({"id": "g3", "sport": "basketball", "league": "ncaab", "status": "live", "game_date": "2024-03-01T00:00:00Z"}),
                    json!({"id": "g4", "sport": "basketball", "league": "nba", "status": "final", "game_date": "2024-02-01T00:00:00Z"}),
                ],
            )
            .await;
        let config = Arc::new(builtin_configs().remove(0));
        (DatabaseSportService::new(config, "nba", store.clone()), store)
    }

    #[tokio::test]
    async fn test_games_scoped_and_normalized() {
        let (service, _) = service().await;
        let rows = service.games(&GamesQuery::default()).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["id"], "g4");
        assert_eq!(rows[0]["status"], "completed");
        assert_eq!(rows[1]["status"], "live");
        assert_eq!(rows[1]["period"], "Q2");
    }

    #[tokio::test]
    async fn test_status_filter_matches_normalized_status() {
        let (service, store) = service().await;
        let live = GamesQuery {
            status: Some("live".to_string()),
            ..Default::default()
        };
        let rows = service.games(&live).await.unwrap();
        let ids: Vec<&str> = rows.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["g1", "g2"]);

        // The limit counts matching rows, not rows read.
        store
            .insert_rows(
                "games",
                vec![
                    json!({"id": "g5", "sport": "basketball", "league": "nba", "status": "STATUS_FINAL", "game_date": "2024-01-01T00:00:00Z"}),
                    json!({"id": "g6", "sport": "basketball", "league": "nba", "status": "STATUS_FINAL", "game_date": "2024-01-02T00:00:00Z"}),
                ],
            )
            .await;
        let completed = GamesQuery {
            status: Some("Final".to_string()),
            limit: Some(2),
            ..Default::default()
        };
        let rows = service.games(&completed).await.unwrap();
        let ids: Vec<&str> = rows.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["g5", "g6"]);
        assert!(rows.iter().all(|r| r["status"] == "completed"));
    }

    #[tokio::test]
    async fn test_upcoming_games_include_provider_scheduled_rows() {
        let (service, store) = service().await;
        let soon = (Utc::now() + ChronoDuration::hours(6)).to_rfc3339();
        store
            .insert_rows(
                "games",
                vec![
                    json!({"id": "u1", "sport": "basketball", "league": "nba", "status": "STATUS_SCHEDULED", "game_date": soon}),
                    json!({"id": "u2", "sport": "basketball", "league": "nba", "status": "scheduled", "game_date": soon}),
                ],
            )
            .await;
        let rows = service.upcoming_games(7).await.unwrap();
        let mut ids: Vec<&str> = rows.iter().filter_map(|r| r["id"].as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_invalid_queries() {
        let (service, _) = service().await;
        let zero = GamesQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert!(matches!(service.games(&zero).await, Err(ServiceError::InvalidQuery(_))));

        let reversed = GamesQuery {
            from: Some(Utc::now()),
            to: Some(Utc::now() - ChronoDuration::days(1)),
            ..Default::default()
        };
        assert!(matches!(service.games(&reversed).await, Err(ServiceError::InvalidQuery(_))));
        assert_eq!(checked_limit(Some(10_000)).unwrap(), MAX_LIMIT);
    }

    #[tokio::test]
    async fn test_store_failure_propagates_as_service_error() {
        let (service, store) = service().await;
        store.set_unavailable(true);
        assert!(matches!(service.teams().await, Err(ServiceError::Store(_))));
    }
}
