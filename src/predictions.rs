//! Prediction dispatch: engines behind a trait plus the deterministic fallback.
//!
//! Model internals live in the offline job that writes the `predictions`
//! table; this module only assembles and substitutes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::PredictionError;
use crate::sports::SportConfig;
use crate::store::{DurableStore, RowFilter};

pub const FALLBACK_MODEL: &str = "fallback";
pub const NO_EDGE: &str = "no-edge";

/// Win probabilities closer to a coin flip than this are labelled `no-edge`.
const EDGE_THRESHOLD: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfidenceScores {
    pub outcome: f64,
    pub spread: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub game_id: String,
    pub model_name: String,
    pub home_win_probability: f64,
    pub away_win_probability: f64,
    pub predicted_spread: f64,
    pub predicted_total: f64,
    pub confidence: ConfidenceScores,
    pub label: String,
}

/// The fields of a game row a prediction needs.
#[derive(Debug, Clone, PartialEq)]
pub struct GameRef {
    pub id: String,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
}

impl GameRef {
    pub fn from_row(row: &Value) -> Result<Self, PredictionError> {
        let id = match row.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(PredictionError::InvalidGame("id")),
        };
        let team = |column: &str| row.get(column).and_then(Value::as_str).map(str::to_string);
        Ok(Self {
            id,
            home_team: team("home_team"),
            away_team: team("away_team"),
        })
    }
}

pub fn edge_label(home_win_probability: f64) -> &'static str {
    if (home_win_probability - 0.5).abs() < EDGE_THRESHOLD {
        NO_EDGE
    } else if home_win_probability > 0.5 {
        "home"
    } else {
        "away"
    }
}

/// Fixed placeholder used when a game's prediction cannot be produced.
pub fn fallback_prediction(config: &SportConfig, game_id: &str) -> Prediction {
    Prediction {
        game_id: game_id.to_string(),
        model_name: FALLBACK_MODEL.to_string(),
        home_win_probability: 0.5,
        away_win_probability: 0.5,
        predicted_spread: 0.0,
        predicted_total: config.fallback_total,
        confidence: ConfidenceScores::default(),
        label: NO_EDGE.to_string(),
    }
}

#[async_trait]
pub trait PredictionEngine: Send + Sync {
    async fn predict(&self, config: &SportConfig, game: &GameRef) -> Result<Prediction, PredictionError>;
}

/// Reads the `winner`, `spread` and `total` rows written by the model job.
pub struct StoredPredictionEngine {
    store: Arc<dyn DurableStore>,
}

impl StoredPredictionEngine {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }
}

fn number(row: &Value, column: &str) -> Option<f64> {
    match row.get(column)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl PredictionEngine for StoredPredictionEngine {
    async fn predict(&self, config: &SportConfig, game: &GameRef) -> Result<Prediction, PredictionError> {
        let filter = RowFilter::new()
            .eq("game_id", game.id.as_str())
            .order_by("created_at", false);
        let rows = self.store.read("predictions", &filter).await?;
        if rows.is_empty() {
            return Err(PredictionError::NotFound(game.id.clone()));
        }

        // Newest row per type wins; missing types keep the fallback value at zero confidence.
        let latest = |kind: &str| {
            rows.iter()
                .find(|row| row.get("prediction_type").and_then(Value::as_str) == Some(kind))
                .and_then(|row| Some((number(row, "predicted_value")?, number(row, "confidence").unwrap_or(0.0), row)))
        };

        let mut prediction = fallback_prediction(config, &game.id);
        let mut model = None;

        if let Some((p, confidence, row)) = latest("winner") {
            let p = p.clamp(0.0, 1.0);
            prediction.home_win_probability = p;
            prediction.away_win_probability = 1.0 - p;
            prediction.confidence.outcome = confidence;
            model = model.or_else(|| row.get("model_name").and_then(Value::as_str));
        }
        if let Some((spread, confidence, row)) = latest("spread") {
            prediction.predicted_spread = spread;
            prediction.confidence.spread = confidence;
            model = model.or_else(|| row.get("model_name").and_then(Value::as_str));
        }
        if let Some((total, confidence, row)) = latest("total") {
            prediction.predicted_total = total;
            prediction.confidence.total = confidence;
            model = model.or_else(|| row.get("model_name").and_then(Value::as_str));
        }

        let model = model.ok_or_else(|| PredictionError::NotFound(game.id.clone()))?;
        prediction.model_name = model.to_string();
        prediction.label = edge_label(prediction.home_win_probability).to_string();
        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sports::builtin_configs;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn basketball() -> SportConfig {
        builtin_configs().remove(0)
    }

    #[test]
    fn test_fallback_is_deterministic() {
        let a = fallback_prediction(&basketball(), "g1");
        let b = fallback_prediction(&basketball(), "g1");
        assert_eq!(a, b);
        assert_eq!(a.model_name, "fallback");
        assert_eq!(a.predicted_total, 220.0);
        assert_eq!(a.label, "no-edge");
        assert_eq!(a.confidence, ConfidenceScores::default());
    }

    #[test]
    fn test_game_ref_requires_id() {
        assert_eq!(GameRef::from_row(&json!({"id": 42})).unwrap().id, "42");
        assert!(matches!(
            GameRef::from_row(&json!({"home_team": "a"})),
            Err(PredictionError::InvalidGame("id"))
        ));
    }

    #[tokio::test]
    async fn test_stored_engine_assembles_rows() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_rows(
                "predictions",
                vec![
                    json!({"game_id": "g1", "model_name": "apex", "prediction_type": "winner", "predicted_value": 0.71, "confidence": 0.42, "created_at": "2024-03-01T00:00:00Z"}),
                    json!({"game_id": "g1", "model_name": "apex", "prediction_type": "winner", "predicted_value": 0.55, "confidence": 0.1, "created_at": "2024-02-01T00:00:00Z"}),
                    json!({"game_id": "g1", "model_name": "apex", "prediction_type": "spread", "predicted_value": "-6.5", "confidence": 0.3, "created_at": "2024-03-01T00:00:00Z"}),
                ],
            )
            .await;
        let engine = StoredPredictionEngine::new(store);
        let game = GameRef::from_row(&json!({"id": "g1"})).unwrap();

        let prediction = engine.predict(&basketball(), &game).await.unwrap();
        assert_eq!(prediction.model_name, "apex");
        assert_eq!(prediction.home_win_probability, 0.71);
        assert_eq!(prediction.predicted_spread, -6.5);
        assert_eq!(prediction.predicted_total, 220.0);
        assert_eq!(prediction.confidence.total, 0.0);
        assert_eq!(prediction.label, "home");

        let missing = GameRef::from_row(&json!({"id": "g9"})).unwrap();
        assert!(matches!(
            engine.predict(&basketball(), &missing).await,
            Err(PredictionError::NotFound(id)) if id == "g9"
        ));
    }
}
