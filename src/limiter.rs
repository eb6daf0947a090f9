//! Shared per-key rate limiting ("debounce") backed by SQLite.
//!
//! One row per operation key. Scope and operation-type isolation come purely
//! from key composition (e.g. `"analyze:<chat_id>"`), a single flat namespace
//! rather than nested state. Check calls never mutate; a permitted caller is
//! expected to follow up with [`RateLimiter::mark_executed`] once it has
//! committed to the operation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::Row as _;
use sqlx::SqlitePool;

/// Per-key rate limiter over a shared persistent store.
pub struct RateLimiter {
    pool: SqlitePool,
}

impl RateLimiter {
    /// Create a new rate limiter.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the rate-limit table.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limit (
                operation TEXT PRIMARY KEY,
                last_execution TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create rate_limit table")?;

        Ok(())
    }

    /// Ask whether `operation` may run now under the given cooldown.
    ///
    /// Returns `(true, 0.0)` when permitted, `(false, remaining_seconds)` with
    /// a strictly positive remainder otherwise. Never mutates state, so
    /// repeated checks without an intervening [`mark_executed`] all agree.
    ///
    /// [`mark_executed`]: RateLimiter::mark_executed
    pub async fn try_acquire(&self, operation: &str, cooldown_seconds: u64) -> Result<(bool, f64)> {
        self.try_acquire_at(operation, cooldown_seconds, Utc::now()).await
    }

    /// [`try_acquire`](RateLimiter::try_acquire) against an explicit clock.
    pub async fn try_acquire_at(
        &self,
        operation: &str,
        cooldown_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<(bool, f64)> {
        validate_key_and_cooldown(operation, cooldown_seconds)?;

        let Some(last) = self.last_execution(operation).await? else {
            tracing::debug!(operation, "no previous execution, permitting");
            return Ok((true, 0.0));
        };

        let elapsed = (now - last).num_milliseconds() as f64 / 1000.0;
        if elapsed >= cooldown_seconds as f64 {
            tracing::debug!(operation, elapsed, "cooldown elapsed, permitting");
            Ok((true, 0.0))
        } else {
            let remaining = cooldown_seconds as f64 - elapsed;
            tracing::debug!(operation, remaining, "within cooldown, denying");
            Ok((false, remaining))
        }
    }

    /// Read-only remainder of the cooldown window, for status reporting.
    pub async fn remaining_time(&self, operation: &str, cooldown_seconds: u64) -> Result<f64> {
        let (_, remaining) = self.try_acquire(operation, cooldown_seconds).await?;
        Ok(remaining)
    }

    /// Record that `operation` ran now, creating the row if absent.
    ///
    /// Call only after committing to the operation. A speculative mark would
    /// under-permit future legitimate requests.
    pub async fn mark_executed(&self, operation: &str) -> Result<()> {
        self.mark_executed_at(operation, Utc::now()).await
    }

    /// [`mark_executed`](RateLimiter::mark_executed) against an explicit clock.
    pub async fn mark_executed_at(&self, operation: &str, now: DateTime<Utc>) -> Result<()> {
        if operation.is_empty() {
            return Err(ConfigError::Invalid("operation key must not be empty".into()).into());
        }

        sqlx::query(
            r#"
            INSERT INTO rate_limit (operation, last_execution)
            VALUES (?, ?)
            ON CONFLICT(operation) DO UPDATE SET last_execution = excluded.last_execution
            "#,
        )
        .bind(operation)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to record execution")?;

        Ok(())
    }

    async fn last_execution(&self, operation: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_execution FROM rate_limit WHERE operation = ?")
            .bind(operation)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read last execution")?;

        Ok(row.and_then(|r| r.try_get::<DateTime<Utc>, _>("last_execution").ok()))
    }
}

fn validate_key_and_cooldown(operation: &str, cooldown_seconds: u64) -> Result<()> {
    if operation.is_empty() {
        return Err(ConfigError::Invalid("operation key must not be empty".into()).into());
    }
    if cooldown_seconds == 0 {
        return Err(ConfigError::Invalid("cooldown must be positive".into()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_limiter() -> RateLimiter {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");

        let limiter = RateLimiter::new(pool);
        limiter.initialize().await.expect("schema should initialize");
        limiter
    }

    #[tokio::test]
    async fn check_only_calls_are_non_mutating() {
        let limiter = setup_limiter().await;

        let first = limiter.try_acquire("analyze:1", 300).await.unwrap();
        let second = limiter.try_acquire("analyze:1", 300).await.unwrap();

        assert_eq!(first, (true, 0.0));
        assert_eq!(second, (true, 0.0));
    }

    #[tokio::test]
    async fn cooldown_window_boundaries() {
        let limiter = setup_limiter().await;
        let t0 = Utc::now();

        limiter.mark_executed_at("analyze:1", t0).await.unwrap();

        let (permitted, remaining) = limiter
            .try_acquire_at("analyze:1", 300, t0 + Duration::seconds(299))
            .await
            .unwrap();
        assert!(!permitted);
        assert!((remaining - 1.0).abs() < 0.01, "remaining = {remaining}");

        let (permitted, remaining) = limiter
            .try_acquire_at("analyze:1", 300, t0 + Duration::seconds(300))
            .await
            .unwrap();
        assert!(permitted);
        assert_eq!(remaining, 0.0);
    }

    #[tokio::test]
    async fn distinct_keys_never_interfere() {
        let limiter = setup_limiter().await;
        let t0 = Utc::now();

        limiter.mark_executed_at("analyze:1", t0).await.unwrap();

        let (other_scope, _) = limiter
            .try_acquire_at("analyze:2", 300, t0 + Duration::seconds(1))
            .await
            .unwrap();
        let (other_operation, _) = limiter
            .try_acquire_at("horoscope:1", 300, t0 + Duration::seconds(1))
            .await
            .unwrap();

        assert!(other_scope);
        assert!(other_operation);
    }

    #[tokio::test]
    async fn mark_overwrites_previous_execution() {
        let limiter = setup_limiter().await;
        let t0 = Utc::now();

        limiter.mark_executed_at("analyze:1", t0).await.unwrap();
        limiter
            .mark_executed_at("analyze:1", t0 + Duration::seconds(600))
            .await
            .unwrap();

        // The second mark restarts the window from t0 + 600.
        let (permitted, remaining) = limiter
            .try_acquire_at("analyze:1", 300, t0 + Duration::seconds(650))
            .await
            .unwrap();
        assert!(!permitted);
        assert!((remaining - 250.0).abs() < 0.01, "remaining = {remaining}");
    }

    #[tokio::test]
    async fn remaining_time_reports_without_mutating() {
        let limiter = setup_limiter().await;

        assert_eq!(limiter.remaining_time("analyze:1", 300).await.unwrap(), 0.0);

        limiter.mark_executed("analyze:1").await.unwrap();
        let remaining = limiter.remaining_time("analyze:1", 300).await.unwrap();
        assert!(remaining > 0.0 && remaining <= 300.0);
    }

    #[tokio::test]
    async fn rejects_empty_key_and_zero_cooldown() {
        let limiter = setup_limiter().await;

        assert!(limiter.try_acquire("", 300).await.is_err());
        assert!(limiter.try_acquire("analyze:1", 0).await.is_err());
        assert!(limiter.mark_executed("").await.is_err());
    }
}
