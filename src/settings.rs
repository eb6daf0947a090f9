//! Runtime-adjustable settings (SQLite).
//!
//! Admin commands change these while the bot runs; values here override the
//! corresponding environment defaults. Readers fall back to the default when
//! a key was never set.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use sqlx::Row as _;
use sqlx::SqlitePool;

const STORAGE_PERIOD_HOURS: &str = "storage_period_hours";
const ANALYSIS_PERIOD_HOURS: &str = "analysis_period_hours";
const COLLECTION_ENABLED: &str = "collection_enabled";

/// Key-value store for admin-adjustable settings.
pub struct SettingsStore {
    pool: SqlitePool,
}

impl SettingsStore {
    /// Create a new settings store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the settings table.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create settings table")?;

        Ok(())
    }

    /// Message retention override, if one was set at runtime.
    pub async fn storage_period_hours(&self) -> Result<Option<u32>> {
        self.get_hours(STORAGE_PERIOD_HOURS).await
    }

    pub async fn set_storage_period_hours(&self, hours: u32) -> Result<()> {
        self.set_hours(STORAGE_PERIOD_HOURS, hours).await
    }

    /// Default analysis window override, if one was set at runtime.
    pub async fn analysis_period_hours(&self) -> Result<Option<u32>> {
        self.get_hours(ANALYSIS_PERIOD_HOURS).await
    }

    pub async fn set_analysis_period_hours(&self, hours: u32) -> Result<()> {
        self.set_hours(ANALYSIS_PERIOD_HOURS, hours).await
    }

    /// Whether message collection is running. Defaults to enabled.
    pub async fn collection_enabled(&self) -> Result<bool> {
        Ok(self.get(COLLECTION_ENABLED).await?.as_deref() != Some("0"))
    }

    pub async fn set_collection_enabled(&self, enabled: bool) -> Result<()> {
        self.set(COLLECTION_ENABLED, if enabled { "1" } else { "0" })
            .await
    }

    async fn get_hours(&self, key: &str) -> Result<Option<u32>> {
        Ok(self.get(key).await?.and_then(|raw| raw.parse().ok()))
    }

    async fn set_hours(&self, key: &str, hours: u32) -> Result<()> {
        if hours == 0 {
            return Err(ConfigError::Invalid(format!("{key} must be positive")).into());
        }
        self.set(key, &hours.to_string()).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM bot_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read setting")?;

        Ok(row.and_then(|r| r.try_get("value").ok()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_settings (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("failed to write setting")?;

        Ok(())
    }
}
