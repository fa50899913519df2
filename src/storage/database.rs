//! SQLite document store for proxy test history

use super::PoolSink;
use crate::proxy::models::{CandidateAddress, ProbeResult, WorkingSet};
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Failed proxies not updated for this long are deleted
pub const STALE_AFTER: Duration = Duration::from_secs(7 * 24 * 3600);

/// Only proxies tested this recently are loaded as working
const FRESH_WITHIN: Duration = Duration::from_secs(24 * 3600);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS proxies (
        address      TEXT PRIMARY KEY,
        ip           TEXT NOT NULL,
        port         INTEGER NOT NULL,
        type         TEXT NOT NULL DEFAULT 'http',
        is_working   INTEGER NOT NULL,
        last_tested  TEXT NOT NULL,
        latency_ms   INTEGER NOT NULL DEFAULT 0,
        test_count   INTEGER NOT NULL DEFAULT 0,
        success_rate REAL NOT NULL DEFAULT 0,
        status_code  INTEGER,
        last_error   TEXT,
        created_at   TEXT NOT NULL,
        updated_at   TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_proxies_working ON proxies (is_working, last_tested)",
    "CREATE INDEX IF NOT EXISTS idx_proxies_rank ON proxies (success_rate DESC, latency_ms ASC)",
    "CREATE INDEX IF NOT EXISTS idx_proxies_updated ON proxies (updated_at)",
];

/// Aggregate view of the stored proxies
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStats {
    pub total: i64,
    pub working: i64,
    /// Mean latency over working proxies
    pub avg_latency_ms: Option<f64>,
    pub avg_success_rate: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// SQLite document store keyed by proxy address
#[derive(Clone)]
pub struct ProxyDatabase {
    pool: SqlitePool,
}

impl ProxyDatabase {
    /// Open (creating if missing) the database and ensure the schema exists
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url {}", url))?
            .create_if_missing(true)
            .busy_timeout(timeout);

        // One connection keeps `sqlite::memory:` a single database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(timeout)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to database {}", url))?;

        let db = Self { pool };
        db.migrate().await?;
        info!("Connected to database: {}", url);
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to create proxies table")?;
        }
        Ok(())
    }

    /// Record a batch of probe results in one transaction.
    ///
    /// Every result bumps `test_count`; `success_rate` reflects the
    /// latest test only.
    pub async fn upsert_results(&self, results: &[ProbeResult]) -> Result<u64> {
        self.upsert_results_at(results, Utc::now()).await
    }

    async fn upsert_results_at(&self, results: &[ProbeResult], now: DateTime<Utc>) -> Result<u64> {
        if results.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        let mut written = 0;

        for result in results {
            let (ip, port) = match result.address.endpoint() {
                Ok(endpoint) => endpoint,
                Err(_) => {
                    debug!("Not storing malformed address {}", result.address);
                    continue;
                }
            };

            sqlx::query(
                r#"
                INSERT INTO proxies (
                    address, ip, port, type, is_working, last_tested, latency_ms,
                    test_count, success_rate, status_code, last_error, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, 'http', ?4, ?5, ?6, 1, ?7, ?8, ?9, ?5, ?5)
                ON CONFLICT(address) DO UPDATE SET
                    is_working   = excluded.is_working,
                    last_tested  = excluded.last_tested,
                    latency_ms   = CASE WHEN excluded.is_working
                                        THEN excluded.latency_ms
                                        ELSE proxies.latency_ms END,
                    test_count   = proxies.test_count + 1,
                    success_rate = excluded.success_rate,
                    status_code  = excluded.status_code,
                    last_error   = excluded.last_error,
                    updated_at   = excluded.updated_at
                "#,
            )
            .bind(result.address.as_str())
            .bind(ip)
            .bind(port)
            .bind(result.is_working)
            .bind(now)
            .bind(result.latency_ms() as i64)
            .bind(if result.is_working { 1.0_f64 } else { 0.0_f64 })
            .bind(result.status_code)
            .bind(result.failure.as_ref().map(|f| f.to_string()))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to upsert proxy {}", result.address))?;

            written += 1;
        }

        tx.commit().await.context("failed to commit proxy results")?;
        info!("Database: processed {} proxy results", written);
        Ok(written)
    }

    /// Working proxies tested within the last day, best first
    pub async fn load_working(&self, limit: usize) -> Result<Vec<CandidateAddress>> {
        self.load_working_since(Utc::now() - chrono_duration(FRESH_WITHIN)?, limit)
            .await
    }

    async fn load_working_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CandidateAddress>> {
        let rows = sqlx::query(
            r#"
            SELECT address FROM proxies
            WHERE is_working = 1 AND last_tested >= ?1
            ORDER BY success_rate DESC, latency_ms ASC, address ASC
            LIMIT ?2
            "#,
        )
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to query working proxies")?;

        rows.iter()
            .map(|row| -> Result<CandidateAddress> {
                let address: String = row.try_get("address")?;
                Ok(CandidateAddress::new(address))
            })
            .collect()
    }

    pub async fn stats(&self) -> Result<ProxyStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COALESCE(SUM(is_working), 0) AS working,
                   AVG(CASE WHEN is_working = 1 THEN latency_ms END) AS avg_latency_ms,
                   AVG(success_rate) AS avg_success_rate
            FROM proxies
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to get proxy stats")?;

        Ok(ProxyStats {
            total: row.try_get("total")?,
            working: row.try_get("working")?,
            avg_latency_ms: row.try_get("avg_latency_ms")?,
            avg_success_rate: row.try_get("avg_success_rate")?,
            timestamp: Utc::now(),
        })
    }

    /// Delete failed proxies not updated within `max_age`
    pub async fn cleanup_stale(&self, max_age: Duration) -> Result<u64> {
        self.cleanup_before(Utc::now() - chrono_duration(max_age)?)
            .await
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM proxies WHERE is_working = 0 AND updated_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("failed to cleanup old proxies")?
            .rows_affected();

        if deleted > 0 {
            info!("Cleaned up {} old non-working proxies", deleted);
        }
        Ok(deleted)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl PoolSink for ProxyDatabase {
    fn name(&self) -> &str {
        "database"
    }

    async fn persist(&self, _working_set: &WorkingSet, results: &[ProbeResult]) -> Result<()> {
        self.upsert_results(results).await?;
        self.cleanup_stale(STALE_AFTER).await?;
        Ok(())
    }
}

fn chrono_duration(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration).context("duration out of range")
}
