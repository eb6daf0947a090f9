//! Content-addressed analysis result cache with TTL (SQLite).
//!
//! Keys are fingerprints computed by the caller over the semantic inputs of
//! an analysis, never wall-clock time, so identical requests from different
//! callers converge on the same entry. Expiry is lazy: a stale row counts as
//! a miss on read whether or not it has been physically removed.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row as _;
use sqlx::SqlitePool;

/// Fingerprint-keyed result cache.
pub struct ResultCache {
    pool: SqlitePool,
}

impl ResultCache {
    /// Create a new result cache.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the cache table.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache (
                fingerprint TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL,
                expires_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create cache table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache(expires_at)")
            .execute(&self.pool)
            .await
            .context("failed to create cache expiry index")?;

        Ok(())
    }

    /// Look up a payload by fingerprint. Expired entries are misses.
    pub async fn get(&self, fingerprint: &str) -> Result<Option<String>> {
        self.get_at(fingerprint, Utc::now()).await
    }

    /// [`get`](ResultCache::get) against an explicit clock.
    pub async fn get_at(&self, fingerprint: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let row = sqlx::query("SELECT payload, expires_at FROM cache WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read cache entry")?;

        let Some(row) = row else {
            tracing::debug!(fingerprint, "cache miss");
            return Ok(None);
        };

        let expires_at: DateTime<Utc> = row
            .try_get("expires_at")
            .context("failed to read cache expiry")?;
        if now >= expires_at {
            tracing::debug!(fingerprint, "cache entry expired, treating as miss");
            return Ok(None);
        }

        tracing::debug!(fingerprint, "cache hit");
        Ok(row.try_get("payload").ok())
    }

    /// Store a payload, overwriting any previous entry for the fingerprint
    /// and restarting its TTL.
    pub async fn set(&self, fingerprint: &str, payload: &str, ttl_seconds: u64) -> Result<()> {
        self.set_at(fingerprint, payload, ttl_seconds, Utc::now()).await
    }

    /// [`set`](ResultCache::set) against an explicit clock.
    pub async fn set_at(
        &self,
        fingerprint: &str,
        payload: &str,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if fingerprint.is_empty() {
            return Err(ConfigError::Invalid("cache fingerprint must not be empty".into()).into());
        }
        if ttl_seconds == 0 {
            return Err(ConfigError::Invalid("cache TTL must be positive".into()).into());
        }

        let expires_at = now + Duration::seconds(ttl_seconds as i64);

        sqlx::query(
            r#"
            INSERT INTO cache (fingerprint, payload, created_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                payload = excluded.payload,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(fingerprint)
        .bind(payload)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("failed to write cache entry")?;

        Ok(())
    }

    /// Remove expired entries. Idempotent; returns the number removed.
    /// Driven by an external sweep, never spawned from here.
    pub async fn evict_expired(&self) -> Result<u64> {
        self.evict_expired_at(Utc::now()).await
    }

    /// [`evict_expired`](ResultCache::evict_expired) against an explicit clock.
    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .context("failed to evict expired cache entries")?;

        let removed = result.rows_affected();
        if removed > 0 {
            tracing::info!(removed, "evicted expired cache entries");
        }
        Ok(removed)
    }

    /// Drop every entry, live or expired. Returns the number removed.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache")
            .execute(&self.pool)
            .await
            .context("failed to clear cache")?;

        Ok(result.rows_affected())
    }

    /// Count of entries still live at `now`.
    pub async fn live_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM cache WHERE expires_at > ?")
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .context("failed to count cache entries")?;

        Ok(row.try_get("count").unwrap_or(0))
    }
}
