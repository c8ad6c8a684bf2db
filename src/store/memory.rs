//! In-process durable stores.
//!
//! [`MemoryStore`] keeps tables and cache entries in memory and can be made
//! slow or unavailable on demand. [`OfflineStore`] rejects every call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{Condition, DurableStore, EntryTotals, RowFilter};
use crate::cache::{CacheEntry, KeyPattern};
use crate::error::StoreError;

/// In-process durable store for local runs and tests.
///
/// Failure and latency can be injected to exercise the degradation paths.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Vec<Value>>>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    reads: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`] while `true`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Number of row reads served (cache-table calls excluded).
    pub fn row_reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub async fn insert_rows(&self, table: &str, rows: Vec<Value>) {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    async fn gate(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

fn column_text(row: &Value, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn column_time(row: &Value, column: &str) -> Option<DateTime<Utc>> {
    row.get(column)?
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn row_matches(row: &Value, condition: &Condition) -> bool {
    match condition {
        Condition::Eq(column, expected) => column_text(row, column).as_deref() == Some(expected.as_str()),
        Condition::Gte(column, at) => column_time(row, column).map(|t| t >= *at).unwrap_or(false),
        Condition::Lte(column, at) => column_time(row, column).map(|t| t <= *at).unwrap_or(false),
        Condition::NotNull(column) => column_text(row, column).is_some(),
    }
}

fn compare_column(a: &Value, b: &Value, column: &str) -> CmpOrdering {
    match (a.get(column), b.get(column)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        _ => column_text(a, column).cmp(&column_text(b, column)),
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn read(&self, table: &str, filter: &RowFilter) -> Result<Vec<Value>, StoreError> {
        filter.validate(table)?;
        self.gate().await?;
        self.reads.fetch_add(1, Ordering::SeqCst);

        let tables = self.tables.read().await;
        let mut rows: Vec<Value> = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filter.conditions.iter().all(|c| row_matches(row, c)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some((column, ascending)) = &filter.order_by {
            rows.sort_by(|a, b| {
                let ord = compare_column(a, b, column);
                if *ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(limit) = filter.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn write(&self, table: &str, rows: &[Value]) -> Result<u64, StoreError> {
        super::validate_identifier(table)?;
        self.gate().await?;
        self.insert_rows(table, rows.to_vec()).await;
        Ok(rows.len() as u64)
    }

    async fn read_entry(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, StoreError> {
        self.gate().await?;
        let entries = self.entries.read().await;
        Ok(entries.get(key).filter(|e| !e.is_expired(now)).cloned())
    }

    async fn write_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.gate().await?;
        self.entries.write().await.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn delete_entries(&self, pattern: &KeyPattern, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.gate().await?;
        let mut entries = self.entries.write().await;
        let mut removed = 0u64;
        entries.retain(|key, entry| {
            if pattern.matches(key) {
                if !entry.is_expired(now) {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn entry_keys(&self, pattern: &KeyPattern, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        self.gate().await?;
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .values()
            .filter(|e| !e.is_expired(now) && pattern.matches(&e.key))
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn entry_totals(&self, now: DateTime<Utc>) -> Result<EntryTotals, StoreError> {
        self.gate().await?;
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|e| !e.is_expired(now))
            .fold(EntryTotals::default(), |acc, e| EntryTotals {
                count: acc.count + 1,
                approx_bytes: acc.approx_bytes + e.size_bytes,
            }))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.gate().await?;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok((before - entries.len()) as u64)
    }
}

/// Stand-in used when the database cannot be reached at start-up.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineStore;

impl OfflineStore {
    fn unavailable<T>() -> Result<T, StoreError> {
        Err(StoreError::Unavailable("durable store offline".to_string()))
    }
}

#[async_trait]
impl DurableStore for OfflineStore {
    async fn read(&self, _table: &str, _filter: &RowFilter) -> Result<Vec<Value>, StoreError> {
        Self::unavailable()
    }

    async fn write(&self, _table: &str, _rows: &[Value]) -> Result<u64, StoreError> {
        Self::unavailable()
    }

    async fn read_entry(&self, _key: &str, _now: DateTime<Utc>) -> Result<Option<CacheEntry>, StoreError> {
        Self::unavailable()
    }

    async fn write_entry(&self, _entry: &CacheEntry) -> Result<(), StoreError> {
        Self::unavailable()
    }

    async fn delete_entries(&self, _pattern: &KeyPattern, _now: DateTime<Utc>) -> Result<u64, StoreError> {
        Self::unavailable()
    }

    async fn entry_keys(&self, _pattern: &KeyPattern, _now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        Self::unavailable()
    }

    async fn entry_totals(&self, _now: DateTime<Utc>) -> Result<EntryTotals, StoreError> {
        Self::unavailable()
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64, StoreError> {
        Self::unavailable()
    }
}
