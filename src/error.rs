//! Top-level error types for recapbot.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading and validation errors.
///
/// Malformed operation keys and non-positive cooldown/TTL values are rejected
/// here, before any limiter or cache state is touched.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Summarization backend failures.
///
/// None of these consume the caller's rate-limit window or populate the
/// result cache.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend rate limit exceeded")]
    RateLimited,

    #[error("backend rejected credentials")]
    InvalidCredentials,

    #[error("analysis input too large for backend")]
    ContentTooLarge,

    #[error("backend network error: {0}")]
    Network(String),

    #[error("backend call timed out after {0}s")]
    Timeout(u64),
}

/// Chat transport failures.
///
/// `CannotRenderMarkup` advances the delivery fallback chain; everything else
/// aborts it.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport cannot render the requested markup")]
    CannotRenderMarkup,

    #[error("message exceeds the transport length limit")]
    TooLong,

    #[error("transport error: {0}")]
    Other(String),
}
