//! Recapbot: a chat-analysis bot that summarizes recent group activity on
//! demand, with shared rate limiting, content-addressed result caching, and a
//! three-tier formatting fallback for delivery.

pub mod analysis;
pub mod backend;
pub mod bot;
pub mod cache;
pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod format;
pub mod limiter;
pub mod settings;
pub mod store;
pub mod transport;

pub use error::{Error, Result};

/// Scope identifier: the chat within which rate limiting and caching are
/// independently tracked. Matches Telegram's signed 64-bit chat ids.
pub type ScopeId = i64;
