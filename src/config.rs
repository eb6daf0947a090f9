//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use crate::format::RenderMode;
use anyhow::Context as _;

/// Recapbot configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token.
    pub bot_token: String,

    /// Telegram user id allowed to bypass the analysis cooldown.
    pub admin_id: i64,

    /// SQLite database path.
    pub db_path: std::path::PathBuf,

    /// Summarization backend settings.
    pub backend: BackendConfig,

    /// Analysis pipeline settings.
    pub analysis: AnalysisConfig,

    /// Delivery settings.
    pub delivery: DeliveryConfig,
}

/// Summarization backend (OpenAI-compatible API) configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// API key.
    pub api_key: String,

    /// Base URL of the chat-completions API.
    pub base_url: String,

    /// Model name.
    pub model: String,

    /// Completion token cap.
    pub max_tokens: u32,

    /// Upper bound on a single backend call, in seconds.
    pub timeout_seconds: u64,
}

/// Analysis pipeline configuration.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisConfig {
    /// Default window analyzed by `/recap` with no argument, in hours.
    pub default_window_hours: u32,

    /// Window analyzed by `/deep_recap`, in hours.
    pub deep_window_hours: u32,

    /// Minimum interval between analyses of the same chat, in seconds.
    pub cooldown_seconds: u64,

    /// How long a computed analysis stays reusable, in seconds.
    pub cache_ttl_seconds: u64,

    /// How long collected messages are retained, in hours.
    pub storage_period_hours: u32,
}

/// Delivery configuration.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryConfig {
    /// Render mode attempted first.
    pub preferred_mode: RenderMode,

    /// Maximum characters per outgoing message.
    pub max_message_length: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        let bot_token = required_env("BOT_TOKEN")?;
        let admin_id = required_env("ADMIN_ID")?
            .parse::<i64>()
            .map_err(|_| ConfigError::Invalid("ADMIN_ID must be an integer".into()))?;

        let db_path = match std::env::var("DB_PATH") {
            Ok(path) => std::path::PathBuf::from(path),
            Err(_) => {
                let data_dir = dirs::data_dir()
                    .map(|d| d.join("recapbot"))
                    .unwrap_or_else(|| std::path::PathBuf::from("./data"));
                std::fs::create_dir_all(&data_dir).with_context(|| {
                    format!("failed to create data directory: {}", data_dir.display())
                })?;
                data_dir.join("recapbot.db")
            }
        };

        let backend = BackendConfig {
            api_key: required_env("OPENAI_API_KEY")?,
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            max_tokens: int_env("MAX_TOKENS", 4000)?,
            timeout_seconds: int_env("BACKEND_TIMEOUT_SECONDS", 120)?,
        };

        let analysis = AnalysisConfig {
            default_window_hours: int_env("ANALYSIS_PERIOD_HOURS", 24)?,
            deep_window_hours: int_env("DEEP_ANALYSIS_PERIOD_HOURS", 12)?,
            cooldown_seconds: int_env("COOLDOWN_SECONDS", 300)?,
            cache_ttl_seconds: int_env("CACHE_TTL_SECONDS", 3600)?,
            storage_period_hours: int_env("STORAGE_PERIOD_HOURS", 168)?,
        };

        // HTML by default: the markdown tiers escape backend-emitted spans to
        // literal text, only the HTML tier converts them.
        let preferred_mode = match std::env::var("PREFERRED_PARSE_MODE").as_deref() {
            Ok("MarkdownV2") => RenderMode::MarkdownV2,
            Ok("HTML") | Err(_) => RenderMode::Html,
            Ok("Markdown") => RenderMode::Markdown,
            Ok(other) => {
                return Err(ConfigError::Invalid(format!(
                    "PREFERRED_PARSE_MODE must be Markdown, MarkdownV2, or HTML, got: {other}"
                ))
                .into());
            }
        };

        let delivery = DeliveryConfig {
            preferred_mode,
            max_message_length: int_env("MAX_MESSAGE_LENGTH", 4096)?,
        };

        let config = Self {
            bot_token,
            admin_id,
            db_path,
            backend,
            analysis,
            delivery,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would corrupt limiter or cache state downstream.
    fn validate(&self) -> Result<()> {
        if self.analysis.cooldown_seconds == 0 {
            return Err(ConfigError::Invalid("COOLDOWN_SECONDS must be positive".into()).into());
        }
        if self.analysis.cache_ttl_seconds == 0 {
            return Err(ConfigError::Invalid("CACHE_TTL_SECONDS must be positive".into()).into());
        }
        if self.analysis.default_window_hours == 0
            || self.analysis.deep_window_hours == 0
            || self.analysis.storage_period_hours == 0
        {
            return Err(ConfigError::Invalid("analysis periods must be positive".into()).into());
        }
        if self.delivery.max_message_length == 0 {
            return Err(ConfigError::Invalid("MAX_MESSAGE_LENGTH must be positive".into()).into());
        }
        Ok(())
    }
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ConfigError::MissingKey(key.to_string()).into())
}

fn int_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(format!("{key} must be an integer, got: {raw}")).into()),
        Err(_) => Ok(default),
    }
}
