//! Database-first serving layer for multi-sport games, odds and predictions.
//!
//! A [`DataClient`] answers every read from a two-tier [`cache::CacheManager`]
//! (process memory, then the durable store's cache table) and computes misses
//! through per-sport services resolved by the [`sports::SportRegistry`].
//! Per-game prediction batches run under the [`degrade`] pipeline, so one
//! failed game never fails the batch.

pub mod cache;
pub mod client;
pub mod config;
pub mod degrade;
pub mod error;
pub mod predictions;
pub mod sports;
pub mod store;

pub use client::{ClientSettings, DataClient, Envelope, EnvelopeMeta, GamesRequest, OddsRequest};
pub use config::Config;
pub use error::{CacheError, PredictionError, RegistryError, ServiceError, StoreError};
