//! Recapbot CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use recapbot::analysis::{AnalysisOrchestrator, OrchestratorSettings};
use recapbot::backend::OpenAiBackend;
use recapbot::bot::AppState;
use recapbot::cache::ResultCache;
use recapbot::delivery::DeliveryCoordinator;
use recapbot::limiter::RateLimiter;
use recapbot::settings::SettingsStore;
use recapbot::store::MessageStore;
use recapbot::transport::TelegramTransport;
use std::sync::Arc;
use teloxide::Bot;
use teloxide::prelude::Requester as _;
use tracing_subscriber::EnvFilter;

/// How often the retention sweep runs.
const SWEEP_INTERVAL_SECS: u64 = 3600;

#[derive(Parser)]
#[command(name = "recapbot")]
#[command(about = "A chat-analysis bot that summarizes recent group activity")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting recapbot...");

    let config = recapbot::config::Config::load()
        .context("failed to load configuration from environment")?;
    tracing::info!(db_path = %config.db_path.display(), "Configuration loaded");

    let pool = recapbot::db::connect(&config.db_path)
        .await
        .context("failed to open database")?;

    let messages = MessageStore::new(pool.clone());
    let cache = ResultCache::new(pool.clone());
    let limiter = RateLimiter::new(pool.clone());
    let settings = SettingsStore::new(pool.clone());
    messages.initialize().await?;
    cache.initialize().await?;
    limiter.initialize().await?;
    settings.initialize().await?;
    tracing::info!("Database schema initialized");

    let backend = Arc::new(OpenAiBackend::new(
        config.backend.api_key.clone(),
        config.backend.base_url.clone(),
        config.backend.model.clone(),
        config.backend.max_tokens,
    ));

    let orchestrator = AnalysisOrchestrator::new(
        MessageStore::new(pool.clone()),
        ResultCache::new(pool.clone()),
        RateLimiter::new(pool.clone()),
        backend,
        OrchestratorSettings {
            cooldown_seconds: config.analysis.cooldown_seconds,
            cache_ttl_seconds: config.analysis.cache_ttl_seconds,
            backend_timeout: std::time::Duration::from_secs(config.backend.timeout_seconds),
        },
    );

    let bot = Bot::new(config.bot_token.clone());
    let me = bot.get_me().await.context("failed to fetch bot identity")?;
    let bot_username = me.username().to_string();
    let bot_user_id = me.user.id.0 as i64;
    tracing::info!(%bot_username, "Bot identity resolved");

    let transport = Arc::new(TelegramTransport::new(bot.clone()));
    let coordinator = DeliveryCoordinator::new(transport, config.delivery.max_message_length);

    // Retention sweep: old messages and expired cache entries go together.
    // The admin can override the retention period while the bot runs.
    let sweep_messages = MessageStore::new(pool.clone());
    let sweep_cache = ResultCache::new(pool.clone());
    let sweep_settings = SettingsStore::new(pool.clone());
    let storage_period_hours = config.analysis.storage_period_hours;
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let retention_hours = sweep_settings
                .storage_period_hours()
                .await
                .ok()
                .flatten()
                .unwrap_or(storage_period_hours);
            let cutoff = chrono::Utc::now() - chrono::Duration::hours(retention_hours as i64);
            match sweep_messages.delete_older_than(cutoff).await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "retention sweep removed old messages");
                }
                Ok(_) => {}
                Err(error) => tracing::error!(%error, "retention sweep failed"),
            }
            if let Err(error) = sweep_cache.evict_expired().await {
                tracing::error!(%error, "cache eviction failed");
            }
        }
    });

    let state = Arc::new(AppState {
        orchestrator,
        coordinator,
        messages,
        cache,
        settings,
        admin_id: config.admin_id,
        default_window_hours: config.analysis.default_window_hours,
        deep_window_hours: config.analysis.deep_window_hours,
        preferred_mode: config.delivery.preferred_mode,
        bot_username,
        bot_user_id,
    });

    tracing::info!("Dispatcher starting");
    recapbot::bot::run(bot, state).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
