//! Chat transport trait and the Telegram adapter.

use crate::ScopeId;
use crate::error::TransportError;
use crate::format::RenderMode;
use async_trait::async_trait;
use teloxide::payloads::SendMessageSetters as _;
use teloxide::prelude::*;
use teloxide::types::{ChatId, ParseMode};

/// Delivery surface for formatted text. A `CannotRenderMarkup` error is the
/// signal that advances the formatting fallback chain.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, scope_id: ScopeId, text: &str, mode: RenderMode)
        -> Result<(), TransportError>;
}

/// Transport over the Telegram Bot API.
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn to_parse_mode(mode: RenderMode) -> Option<ParseMode> {
    match mode {
        RenderMode::Markdown => Some(ParseMode::Markdown),
        RenderMode::MarkdownV2 => Some(ParseMode::MarkdownV2),
        RenderMode::Html => Some(ParseMode::Html),
        RenderMode::Plain => None,
    }
}

fn map_error(error: teloxide::RequestError) -> TransportError {
    use teloxide::ApiError;

    match &error {
        teloxide::RequestError::Api(ApiError::CantParseEntities(_)) => {
            TransportError::CannotRenderMarkup
        }
        teloxide::RequestError::Api(ApiError::MessageIsTooLong) => TransportError::TooLong,
        _ => TransportError::Other(error.to_string()),
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(
        &self,
        scope_id: ScopeId,
        text: &str,
        mode: RenderMode,
    ) -> Result<(), TransportError> {
        let mut request = self.bot.send_message(ChatId(scope_id), text);
        if let Some(parse_mode) = to_parse_mode(mode) {
            request = request.parse_mode(parse_mode);
        }

        request.await.map(|_| ()).map_err(map_error)
    }
}
