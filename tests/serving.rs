use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use sportscache::cache::{CacheManager, DataType, EntryMeta, ManagerSettings, Source};
use sportscache::degrade::PipelineSettings;
use sportscache::predictions::{fallback_prediction, GameRef, Prediction, PredictionEngine, StoredPredictionEngine};
use sportscache::sports::{DatabaseServiceFactory, SportConfig, SportRegistry};
use sportscache::store::MemoryStore;
use sportscache::{ClientSettings, DataClient, GamesRequest, PredictionError};

fn client_with_engine(
    store: &Arc<MemoryStore>,
    settings: ClientSettings,
    engine: Arc<dyn PredictionEngine>,
) -> DataClient {
    let (manager, _tiers) = CacheManager::two_tier(store.clone(), &ManagerSettings::default());
    let factory = Arc::new(DatabaseServiceFactory::new(store.clone()));
    let registry = Arc::new(SportRegistry::new(store.clone(), factory));
    DataClient::new(registry, Arc::new(manager), engine, settings)
}

fn client_over(store: &Arc<MemoryStore>, settings: ClientSettings) -> DataClient {
    client_with_engine(store, settings, Arc::new(StoredPredictionEngine::new(store.clone())))
}

/// Answers every game after a fixed delay.
struct PacedEngine {
    pace: Duration,
}

#[async_trait]
impl PredictionEngine for PacedEngine {
    async fn predict(&self, config: &SportConfig, game: &GameRef) -> Result<Prediction, PredictionError> {
        tokio::time::sleep(self.pace).await;
        let mut prediction = fallback_prediction(config, &game.id);
        prediction.model_name = "paced".to_string();
        Ok(prediction)
    }
}

fn game(id: &str, status: &str, starts_in_hours: i64) -> Value {
    json!({
        "id": id,
        "sport": "basketball",
        "league": "nba",
        "status": status,
        "home_team": format!("{}-home", id),
        "away_team": format!("{}-away", id),
        "game_date": (Utc::now() + ChronoDuration::hours(starts_in_hours)).to_rfc3339(),
    })
}

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_rows(
            "games",
            vec![
                game("g1", "scheduled", 20),
                game("g2", "scheduled", 30),
                game("g3", "scheduled", 40),
                game("g4", "STATUS_IN_PROGRESS", -1),
            ],
        )
        .await;
    store
}

#[tokio::test]
async fn test_provenance_follows_the_tiers() {
    let store = seeded_store().await;
    let client = client_over(&store, ClientSettings::default());

    let first = client.games("basketball", &GamesRequest::default()).await;
    assert!(first.success);
    assert_eq!(first.meta.source, Source::Computed);
    assert!(first.meta.refreshed);
    assert_eq!(first.meta.count, 4);
    assert_eq!(first.meta.league.as_deref(), Some("nba"));

    let second = client.games("Basketball", &GamesRequest::default()).await;
    assert_eq!(second.meta.source, Source::MemoryCache);
    assert!(!second.meta.refreshed);
    assert_eq!(second.data, first.data);

    // Another process sharing the durable store sees the persistent tier.
    let other = client_over(&store, ClientSettings::default());
    let shared = other.games("basketball", &GamesRequest::default()).await;
    assert_eq!(shared.meta.source, Source::PersistentCache);
    assert_eq!(shared.data, first.data);
    let backfilled = other.games("basketball", &GamesRequest::default()).await;
    assert_eq!(backfilled.meta.source, Source::MemoryCache);

    assert!(client.invalidate_sport("basketball").await >= 1);
    assert_eq!(client.invalidate_sport("basketball").await, 0);
    let after = client.games("basketball", &GamesRequest::default()).await;
    assert_eq!(after.meta.source, Source::Computed);
}

#[tokio::test]
async fn test_distinct_filters_never_share_a_key() {
    let store = seeded_store().await;
    let client = client_over(&store, ClientSettings::default());

    let all = client.games("basketball", &GamesRequest::default()).await;
    let scheduled = client
        .games(
            "basketball",
            &GamesRequest {
                status: Some("STATUS_SCHEDULED".to_string()),
                ..Default::default()
            },
        )
        .await;
    let live = client
        .games(
            "basketball",
            &GamesRequest {
                status: Some("in".to_string()),
                ..Default::default()
            },
        )
        .await;
    let limited = client
        .games(
            "basketball",
            &GamesRequest {
                limit: Some(1),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(all.meta.count, 4);
    assert_eq!(scheduled.meta.source, Source::Computed);
    assert_eq!(scheduled.meta.count, 3);
    assert_eq!(limited.meta.source, Source::Computed);
    assert_eq!(limited.meta.count, 1);
    // `in` and the stored `STATUS_IN_PROGRESS` both normalize to `live`.
    assert!(live.success);
    assert_eq!(live.meta.count, 1);
    assert_eq!(live.data[0]["id"], "g4");
    assert_eq!(live.data[0]["status"], "live");

    let keys = client.cache().keys(None).await;
    assert_eq!(
        keys,
        vec![
            "games:basketball:league=nba".to_string(),
            "games:basketball:league=nba&limit=1".to_string(),
            "games:basketball:league=nba&status=live".to_string(),
            "games:basketball:league=nba&status=scheduled".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_live_games_expire_after_ttl() {
    let store = Arc::new(MemoryStore::new());
    let (manager, _tiers) = CacheManager::two_tier(store.clone(), &ManagerSettings::default());
    let games = json!([{"id": "g1", "status": "live"}]);
    let meta = EntryMeta::new(DataType::Games, "basketball")
        .live()
        .with_ttl(Duration::from_secs(90));

    assert!(manager.set("games:basketball:live", games.clone(), &meta).await.unwrap());
    let hit = manager.lookup("games:basketball:live").await.unwrap();
    assert_eq!(hit.source, Source::MemoryCache);
    assert_eq!(hit.value, games);

    tokio::time::advance(Duration::from_secs(91)).await;
    assert!(manager.lookup("games:basketball:live").await.is_none());
}

#[tokio::test]
async fn test_prediction_batch_degrades_per_game() {
    let store = seeded_store().await;
    store
        .insert_rows(
            "predictions",
            vec![
                json!({"game_id": "g1", "model_name": "apex", "prediction_type": "winner", "predicted_value": 0.64, "confidence": 0.3}),
                json!({"game_id": "g2", "model_name": "apex", "prediction_type": "total", "predicted_value": 231.5, "confidence": 0.2}),
            ],
        )
        .await;
    let client = client_over(&store, ClientSettings::default());

    let envelope = client.predictions("basketball", None).await;
    assert!(envelope.success);
    assert_eq!(envelope.data.len(), 3);
    let summary = envelope.meta.degradation.unwrap();
    assert_eq!((summary.total, summary.succeeded, summary.degraded), (3, 2, 1));

    let by_game = |id: &str| {
        envelope
            .data
            .iter()
            .find(|item| item["value"]["gameId"] == id)
            .cloned()
            .unwrap()
    };
    assert_eq!(by_game("g1")["isFallback"], false);
    assert_eq!(by_game("g1")["value"]["label"], "home");
    assert_eq!(by_game("g2")["value"]["predictedTotal"], 231.5);

    let fallback = by_game("g3");
    assert_eq!(fallback["isFallback"], true);
    assert_eq!(fallback["value"]["modelName"], "fallback");
    assert_eq!(fallback["value"]["predictedTotal"], 220.0);
    assert!(fallback["reason"].as_str().unwrap().contains("g3"));

    let cached = client.predictions("basketball", Some("nba")).await;
    assert_eq!(cached.meta.source, Source::MemoryCache);
    assert_eq!(cached.meta.degradation, Some(summary));
}

#[tokio::test]
async fn test_fully_degraded_batch_is_not_cached() {
    let store = seeded_store().await;
    let client = client_over(&store, ClientSettings::default());

    let first = client.predictions("basketball", None).await;
    assert_eq!(first.data.len(), 3);
    assert!(first.meta.degradation.unwrap().degraded == 3);

    let second = client.predictions("basketball", None).await;
    assert_eq!(second.meta.source, Source::Computed);
}

#[tokio::test]
async fn test_empty_prediction_batch_is_not_cached() {
    let store = Arc::new(MemoryStore::new());
    store.insert_rows("games", vec![game("old", "completed", -48)]).await;
    let client = client_over(&store, ClientSettings::default());

    let first = client.predictions("basketball", None).await;
    assert!(first.success);
    assert!(first.data.is_empty());
    assert_eq!(first.meta.degradation.unwrap().total, 0);

    let second = client.predictions("basketball", None).await;
    assert_eq!(second.meta.source, Source::Computed);
    assert!(client.cache().keys(None).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_prediction_batch_may_outlast_compute_timeout() {
    let store = Arc::new(MemoryStore::new());
    let games = (0..24).map(|i| game(&format!("p{}", i), "STATUS_SCHEDULED", 2 + i)).collect();
    store.insert_rows("games", games).await;
    let settings = ClientSettings {
        compute_timeout: Duration::from_millis(1500),
        pipeline: PipelineSettings {
            item_timeout: Duration::from_secs(2),
            concurrency: 4,
        },
        ..Default::default()
    };
    // Six rounds of one second each, well past the compute budget.
    let engine = Arc::new(PacedEngine {
        pace: Duration::from_secs(1),
    });
    let client = client_with_engine(&store, settings, engine);

    let envelope = client.predictions("basketball", None).await;
    assert_eq!(envelope.data.len(), 24);
    let summary = envelope.meta.degradation.unwrap();
    assert_eq!((summary.total, summary.succeeded, summary.degraded), (24, 24, 0));
    assert!(envelope.data.iter().all(|item| item["isFallback"] == false));
    assert!(envelope.data.iter().all(|item| item["value"]["modelName"] == "paced"));

    let cached = client.predictions("basketball", None).await;
    assert_eq!(cached.meta.source, Source::MemoryCache);
}

#[tokio::test]
async fn test_unsupported_sport_and_league() {
    let client = client_over(&Arc::new(MemoryStore::new()), ClientSettings::default());

    let curling = client.teams("curling", None).await;
    assert!(!curling.success);
    assert!(curling.data.is_empty());
    assert_eq!(curling.meta.sport, "curling");
    assert!(curling.meta.error.as_deref().unwrap().contains("curling"));

    let wrong_league = client.standings("hockey", Some("nba"), None).await;
    assert!(!wrong_league.success);
    assert!(wrong_league.meta.error.is_some());
}

#[tokio::test]
async fn test_store_outage_serves_empty_and_caches_nothing() {
    let store = seeded_store().await;
    let client = client_over(&store, ClientSettings::default());

    store.set_unavailable(true);
    let down = client.games("basketball", &GamesRequest::default()).await;
    assert!(down.success);
    assert!(down.data.is_empty());
    assert_eq!(down.meta.source, Source::Computed);
    assert!(down.meta.error.is_none());

    store.set_unavailable(false);
    let up = client.games("basketball", &GamesRequest::default()).await;
    assert_eq!(up.meta.source, Source::Computed);
    assert_eq!(up.meta.count, 4);
}

#[tokio::test(start_paused = true)]
async fn test_slow_compute_times_out_to_empty() {
    let store = seeded_store().await;
    let settings = ClientSettings {
        compute_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let client = client_over(&store, settings);
    // Load the configs before slowing the store down.
    assert!(client.registry().is_sport_supported("basketball").await);

    store.set_latency(Some(Duration::from_secs(10)));
    let slow = client.teams("basketball", None).await;
    assert!(slow.success);
    assert!(slow.data.is_empty());
    assert_eq!(slow.meta.source, Source::Computed);
    assert!(client.cache().keys(None).await.is_empty());
}

#[tokio::test]
async fn test_accuracy_over_evaluated_predictions() {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_rows(
            "predictions",
            vec![
                json!({"sport": "hockey", "league": "nhl", "prediction_type": "winner", "is_correct": true}),
                json!({"sport": "hockey", "league": "nhl", "prediction_type": "winner", "is_correct": false}),
                json!({"sport": "hockey", "league": "nhl", "prediction_type": "spread", "is_correct": true}),
                json!({"sport": "hockey", "league": "nhl", "prediction_type": "total", "is_correct": null}),
                json!({"sport": "basketball", "league": "nba", "prediction_type": "winner", "is_correct": false}),
            ],
        )
        .await;
    let client = client_over(&store, ClientSettings::default());

    let envelope = client.accuracy("hockey", None).await;
    assert_eq!(envelope.meta.data_type, DataType::Analytics);
    assert_eq!(envelope.data.len(), 2);
    assert_eq!(envelope.data[0]["predictionType"], "spread");
    assert_eq!(envelope.data[1]["predictionType"], "winner");
    assert_eq!(envelope.data[1]["accuracy"], 0.5);

    assert!(client.invalidate_type(DataType::Analytics).await >= 1);
}
