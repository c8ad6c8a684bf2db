//! Postgres durable store over a `sqlx` pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{info, warn};

use super::{Condition, DurableStore, EntryTotals, RowFilter};
use crate::cache::{CacheEntry, DataType, KeyPattern};
use crate::error::StoreError;

/// Postgres-backed durable store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

type EntryRow = (String, Value, String, String, i64, DateTime<Utc>, DateTime<Utc>);

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with exponential backoff between attempts.
    pub async fn connect_with_retry(url: &str, max_retries: u32) -> Result<Self, StoreError> {
        let mut attempt = 0;
        loop {
            match PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await
            {
                Ok(pool) => {
                    info!("Connected to PostgreSQL");
                    return Ok(Self::new(pool));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_retries {
                        return Err(StoreError::Unavailable(format!(
                            "failed to connect to database after {} attempts: {}",
                            max_retries, e
                        )));
                    }
                    warn!("Database connection attempt {} failed: {}. Retrying...", attempt, e);
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
            }
        }
    }

    /// Create the cache table if this database has never hosted one.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value JSONB NOT NULL,
                data_type TEXT NOT NULL,
                sport TEXT NOT NULL,
                size_bytes BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS cache_entries_expires_at_idx ON cache_entries (expires_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn entry_from_row(row: EntryRow) -> Result<CacheEntry, StoreError> {
        let (key, value, data_type, sport, size_bytes, created_at, expires_at) = row;
        let data_type: DataType = data_type.parse().map_err(StoreError::Decode)?;
        Ok(CacheEntry {
            key,
            value,
            data_type,
            sport,
            size_bytes: size_bytes.max(0) as u64,
            created_at,
            expires_at,
        })
    }
}

#[async_trait]
impl DurableStore for PgStore {
    async fn read(&self, table: &str, filter: &RowFilter) -> Result<Vec<Value>, StoreError> {
        filter.validate(table)?;

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT row_to_json(t)::jsonb FROM {} t", table));
        for (i, condition) in filter.conditions.iter().enumerate() {
            qb.push(if i == 0 { " WHERE " } else { " AND " });
            match condition {
                Condition::Eq(column, value) => {
                    qb.push(format!("t.{}::text = ", column));
                    qb.push_bind(value.clone());
                }
                Condition::Gte(column, at) => {
                    qb.push(format!("t.{} >= ", column));
                    qb.push_bind(*at);
                }
                Condition::Lte(column, at) => {
                    qb.push(format!("t.{} <= ", column));
                    qb.push_bind(*at);
                }
                Condition::NotNull(column) => {
                    qb.push(format!("t.{} IS NOT NULL", column));
                }
            }
        }
        if let Some((column, ascending)) = &filter.order_by {
            qb.push(format!(" ORDER BY t.{} {}", column, if *ascending { "ASC" } else { "DESC" }));
        }
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ");
            qb.push_bind(i64::from(limit));
        }

        let rows: Vec<(Value,)> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(row,)| row).collect())
    }

    async fn write(&self, table: &str, rows: &[Value]) -> Result<u64, StoreError> {
        super::validate_identifier(table)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(&format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1)",
            table = table
        ))
        .bind(Value::Array(rows.to_vec()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn read_entry(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, StoreError> {
        let row: Option<EntryRow> = sqlx::query_as(
            r#"
            SELECT key, value, data_type, sport, size_bytes, created_at, expires_at
            FROM cache_entries
            WHERE key = $1 AND expires_at > $2
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::entry_from_row).transpose()
    }

    async fn write_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, data_type, sport, size_bytes, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                data_type = EXCLUDED.data_type,
                sport = EXCLUDED.sport,
                size_bytes = EXCLUDED.size_bytes,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.value)
        .bind(entry.data_type.as_str())
        .bind(&entry.sport)
        .bind(entry.size_bytes as i64)
        .bind(entry.created_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_entries(&self, pattern: &KeyPattern, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let live: i64 = sqlx::query_scalar(
            r#"
            WITH removed AS (
                DELETE FROM cache_entries WHERE key LIKE $1 ESCAPE '\' RETURNING expires_at
            )
            SELECT COUNT(*) FROM removed WHERE expires_at > $2
            "#,
        )
        .bind(pattern.to_like())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(live.max(0) as u64)
    }

    async fn entry_keys(&self, pattern: &KeyPattern, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT key FROM cache_entries
            WHERE key LIKE $1 ESCAPE '\' AND expires_at > $2
            ORDER BY key
            "#,
        )
        .bind(pattern.to_like())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn entry_totals(&self, now: DateTime<Utc>) -> Result<EntryTotals, StoreError> {
        let (count, bytes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0)::BIGINT FROM cache_entries WHERE expires_at > $1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(EntryTotals {
            count: count.max(0) as u64,
            approx_bytes: bytes.max(0) as u64,
        })
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
