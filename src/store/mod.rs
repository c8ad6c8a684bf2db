//! Durable store client consumed by the persistent cache tier and the sport services.

mod memory;
mod postgres;

pub use memory::{MemoryStore, OfflineStore};
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::cache::{CacheEntry, KeyPattern};
use crate::error::StoreError;

/// Aggregate figures for the cache table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryTotals {
    pub count: u64,
    pub approx_bytes: u64,
}

/// A single predicate on a row column.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, String),
    Gte(String, DateTime<Utc>),
    Lte(String, DateTime<Utc>),
    NotNull(String),
}

impl Condition {
    pub fn column(&self) -> &str {
        match self {
            Condition::Eq(c, _) | Condition::Gte(c, _) | Condition::Lte(c, _) | Condition::NotNull(c) => c,
        }
    }
}

/// Row selection for [`DurableStore::read`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
    pub conditions: Vec<Condition>,
    /// Column and ascending flag.
    pub order_by: Option<(String, bool)>,
    pub limit: Option<u32>,
}

impl RowFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<String>) -> Self {
        self.conditions.push(Condition::Eq(column.to_string(), value.into()));
        self
    }

    pub fn gte(mut self, column: &str, at: DateTime<Utc>) -> Self {
        self.conditions.push(Condition::Gte(column.to_string(), at));
        self
    }

    pub fn lte(mut self, column: &str, at: DateTime<Utc>) -> Self {
        self.conditions.push(Condition::Lte(column.to_string(), at));
        self
    }

    pub fn not_null(mut self, column: &str) -> Self {
        self.conditions.push(Condition::NotNull(column.to_string()));
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order_by = Some((column.to_string(), ascending));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check table and column names before they are spliced into SQL.
    pub fn validate(&self, table: &str) -> Result<(), StoreError> {
        validate_identifier(table)?;
        for condition in &self.conditions {
            validate_identifier(condition.column())?;
        }
        if let Some((column, _)) = &self.order_by {
            validate_identifier(column)?;
        }
        Ok(())
    }
}

pub(crate) fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_')
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Opaque external row store. Rows are JSON objects.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn read(&self, table: &str, filter: &RowFilter) -> Result<Vec<Value>, StoreError>;

    async fn write(&self, table: &str, rows: &[Value]) -> Result<u64, StoreError>;

    /// Live (unexpired) cache entry for `key`.
    async fn read_entry(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, StoreError>;

    /// Upsert on key.
    async fn write_entry(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    /// Delete live entries matching `pattern`, returning how many were live.
    async fn delete_entries(&self, pattern: &KeyPattern, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn entry_keys(&self, pattern: &KeyPattern, now: DateTime<Utc>) -> Result<Vec<String>, StoreError>;

    async fn entry_totals(&self, now: DateTime<Utc>) -> Result<EntryTotals, StoreError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("games").is_ok());
        assert!(validate_identifier("sport_configs").is_ok());
        assert!(validate_identifier("games; drop table teams").is_err());
        assert!(validate_identifier("Games").is_err());
        assert!(validate_identifier("1games").is_err());
        assert!(validate_identifier("").is_err());

        let filter = RowFilter::new().eq("sport", "basketball").order_by("game_date", true);
        assert!(filter.validate("games").is_ok());
        let bad = RowFilter::new().eq("sport = sport or 1=1 --", "x");
        assert!(matches!(bad.validate("games"), Err(StoreError::InvalidIdentifier(_))));
    }
}
