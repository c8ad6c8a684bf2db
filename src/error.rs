//! Error types for the serving layer.
//!
//! None of these reach a caller of [`crate::DataClient`]: the client turns
//! every failure into a correctly shaped (possibly empty) envelope.

/// Failures of the external durable store client.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Failed to decode row: {0}")]
    Decode(String),
}

/// Cache adapter failures. The manager downgrades every one of these to a miss.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("{tier} adapter unavailable: {reason}")]
    Unavailable { tier: &'static str, reason: String },
}

/// Failures of a sport service while computing a cache miss.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Registry lookups and lazy service construction.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unsupported sport: {0}")]
    UnsupportedSport(String),

    #[error("Unsupported league '{league}' for sport '{sport}'")]
    UnsupportedLeague { sport: String, league: String },

    #[error("Failed to construct service for {sport}/{league}: {source}")]
    Construction {
        sport: String,
        league: String,
        #[source]
        source: ServiceError,
    },
}

/// Per-game prediction failures; each one degrades a single batch item.
#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("No stored prediction for game {0}")]
    NotFound(String),

    #[error("Game row is missing '{0}'")]
    InvalidGame(&'static str),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
