//! Telegram front-end: message collection, the recap and question commands,
//! and the admin runtime controls.

use crate::analysis::{
    AnalysisKind, AnalysisOrchestrator, AnalysisOutcome, AnalysisRequest, QuestionRequest,
};
use crate::cache::ResultCache;
use crate::delivery::DeliveryCoordinator;
use crate::format::RenderMode;
use crate::settings::SettingsStore;
use crate::store::{ChatRecord, MessageStore};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{MessageReactionUpdated, ReactionType};
use teloxide::utils::command::BotCommands;

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Longest recap window a requester may ask for, in hours.
const MAX_WINDOW_HOURS: u32 = 168;

/// Shared state for all handlers.
pub struct AppState {
    pub orchestrator: AnalysisOrchestrator,
    pub coordinator: DeliveryCoordinator,
    pub messages: MessageStore,
    pub cache: ResultCache,
    pub settings: SettingsStore,
    pub admin_id: i64,
    pub default_window_hours: u32,
    pub deep_window_hours: u32,
    pub preferred_mode: RenderMode,
    /// Identity of this bot, for mention and reply-to-bot detection.
    pub bot_username: String,
    pub bot_user_id: i64,
}

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Recapbot commands:")]
enum Command {
    #[command(description = "summarize recent chat activity, e.g. /recap 12")]
    Recap(String),
    #[command(rename = "deep_recap", description = "closer look at the recent window")]
    DeepRecap,
    #[command(description = "ask a question about the chat, e.g. /ask who broke the build?")]
    Ask(String),
    #[command(description = "show collection statistics")]
    Stats,
    #[command(description = "show this help")]
    Help,
    #[command(rename = "set_storage", description = "admin: set message retention in hours")]
    SetStorage(String),
    #[command(rename = "set_analysis", description = "admin: set the default recap window in hours")]
    SetAnalysis(String),
    #[command(rename = "stop_collection", description = "admin: stop collecting messages")]
    StopCollection,
    #[command(rename = "start_collection", description = "admin: resume collecting messages")]
    StartCollection,
    #[command(rename = "clear_db", description = "admin: drop all collected messages")]
    ClearDb,
}

/// Run the dispatcher until shutdown.
pub async fn run(bot: Bot, state: Arc<AppState>) {
    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(handle_command),
                )
                .branch(
                    dptree::filter(|msg: Message, state: Arc<AppState>| {
                        addressed_to_bot(&msg, &state)
                    })
                    .endpoint(handle_addressed_message),
                )
                .branch(dptree::endpoint(collect_message)),
        )
        .branch(Update::filter_message_reaction_updated().endpoint(handle_reaction));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    state: Arc<AppState>,
) -> HandlerResult {
    match cmd {
        Command::Recap(args) => handle_recap(&msg, &args, &state).await,
        Command::DeepRecap => handle_deep_recap(&msg, &state).await,
        Command::Ask(args) => handle_ask(&bot, &msg, &args, &state).await,
        Command::Stats => handle_stats(&bot, &msg, &state).await,
        Command::Help => {
            bot.send_message(msg.chat.id, Command::descriptions().to_string())
                .await?;
            Ok(())
        }
        admin_cmd => {
            let requester_id = msg.from.as_ref().map(|user| user.id.0 as i64).unwrap_or(0);
            if requester_id != state.admin_id {
                tracing::debug!(requester_id, "ignoring admin command from non-admin");
                return Ok(());
            }
            handle_admin_command(&bot, &msg, admin_cmd, &state).await
        }
    }
}

async fn handle_admin_command(
    bot: &Bot,
    msg: &Message,
    cmd: Command,
    state: &AppState,
) -> HandlerResult {
    let reply = match cmd {
        Command::SetStorage(args) => match parse_hours(&args) {
            Some(hours) => match state.settings.set_storage_period_hours(hours).await {
                Ok(()) => format!("Message retention set to {hours} hours."),
                Err(error) => {
                    tracing::error!(%error, "failed to set storage period");
                    "Failed to update the setting.".to_string()
                }
            },
            None => "Usage: /set_storage <hours>".to_string(),
        },
        Command::SetAnalysis(args) => match parse_hours(&args) {
            Some(hours) => match state.settings.set_analysis_period_hours(hours).await {
                Ok(()) => format!("Default recap window set to {hours} hours."),
                Err(error) => {
                    tracing::error!(%error, "failed to set analysis period");
                    "Failed to update the setting.".to_string()
                }
            },
            None => "Usage: /set_analysis <hours>".to_string(),
        },
        Command::StopCollection => match state.settings.set_collection_enabled(false).await {
            Ok(()) => "Message collection stopped.".to_string(),
            Err(error) => {
                tracing::error!(%error, "failed to stop collection");
                "Failed to update the setting.".to_string()
            }
        },
        Command::StartCollection => match state.settings.set_collection_enabled(true).await {
            Ok(()) => "Message collection started.".to_string(),
            Err(error) => {
                tracing::error!(%error, "failed to start collection");
                "Failed to update the setting.".to_string()
            }
        },
        Command::ClearDb => {
            // Cached analyses describe the cleared messages, they go too.
            match tokio::try_join!(state.messages.clear(), state.cache.clear()) {
                Ok((removed, _)) => {
                    tracing::info!(removed, "database cleared by admin");
                    format!("Database cleared, {removed} messages removed.")
                }
                Err(error) => {
                    tracing::error!(%error, "failed to clear database");
                    "Failed to clear the database.".to_string()
                }
            }
        }
        // Non-admin commands never reach here.
        _ => return Ok(()),
    };

    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

fn parse_hours(args: &str) -> Option<u32> {
    args.trim().parse::<u32>().ok().filter(|hours| *hours > 0)
}

async fn handle_recap(msg: &Message, args: &str, state: &AppState) -> HandlerResult {
    // The admin may have overridden the default window at runtime.
    let default_hours = state
        .settings
        .analysis_period_hours()
        .await
        .ok()
        .flatten()
        .unwrap_or(state.default_window_hours);

    let window_hours = match parse_window(args, default_hours) {
        Some(hours) => hours,
        None => {
            state
                .coordinator
                .deliver(
                    msg.chat.id.0,
                    &AnalysisOutcome::Delivered {
                        text: format!(
                            "Usage: /recap [hours], where hours is 1-{MAX_WINDOW_HOURS}."
                        ),
                        served_from_cache: false,
                    },
                    RenderMode::Plain,
                )
                .await;
            return Ok(());
        }
    };

    run_recap(msg, window_hours, AnalysisKind::Recap, state).await
}

async fn handle_deep_recap(msg: &Message, state: &AppState) -> HandlerResult {
    run_recap(msg, state.deep_window_hours, AnalysisKind::DeepRecap, state).await
}

async fn run_recap(
    msg: &Message,
    window_hours: u32,
    kind: AnalysisKind,
    state: &AppState,
) -> HandlerResult {
    let requester_id = msg.from.as_ref().map(|user| user.id.0 as i64).unwrap_or(0);
    let request = AnalysisRequest {
        scope_id: msg.chat.id.0,
        window_hours,
        kind,
        requester_id,
        bypass_limiter: requester_id == state.admin_id,
    };

    tracing::info!(
        scope_id = request.scope_id,
        window_hours,
        ?kind,
        requester_id,
        bypass = request.bypass_limiter,
        "recap requested"
    );

    let outcome = state.orchestrator.request_analysis(&request).await;
    let outcome = decorate_recap(outcome, window_hours);

    let report = state
        .coordinator
        .deliver(request.scope_id, &outcome, state.preferred_mode)
        .await;

    if report.succeeded {
        tracing::info!(
            scope_id = request.scope_id,
            mode = ?report.mode_used,
            chunks = report.chunk_count,
            "recap delivered"
        );
    } else {
        tracing::error!(
            scope_id = request.scope_id,
            reason = report.failure_reason.as_deref(),
            "recap delivery failed"
        );
    }
    Ok(())
}

async fn handle_ask(bot: &Bot, msg: &Message, args: &str, state: &AppState) -> HandlerResult {
    let question = args.trim();
    if question.is_empty() {
        bot.send_message(msg.chat.id, "Usage: /ask <your question>")
            .await?;
        return Ok(());
    }

    run_question(msg, question, state).await
}

/// Handle a non-command message addressed to the bot, either by @-mention or
/// by replying to one of the bot's own messages.
async fn handle_addressed_message(msg: Message, state: Arc<AppState>) -> HandlerResult {
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let question = match mention_question(text, &state.bot_username) {
        Some(stripped) if !stripped.is_empty() => stripped,
        Some(_) => {
            state
                .coordinator
                .deliver(
                    msg.chat.id.0,
                    &AnalysisOutcome::Delivered {
                        text: format!("Ask me something: @{} <your question>", state.bot_username),
                        served_from_cache: false,
                    },
                    RenderMode::Plain,
                )
                .await;
            return Ok(());
        }
        None => text.trim().to_string(),
    };

    run_question(&msg, &question, &state).await
}

async fn run_question(msg: &Message, question: &str, state: &AppState) -> HandlerResult {
    let requester_id = msg.from.as_ref().map(|user| user.id.0 as i64).unwrap_or(0);
    let reply_context = msg.reply_to_message().and_then(|quoted| {
        let author = quoted
            .from
            .as_ref()
            .map(|user| user.username.clone().unwrap_or_else(|| user.first_name.clone()))
            .unwrap_or_else(|| "unknown".to_string());
        quoted.text().map(|text| format!("@{author}: {text}"))
    });

    let request = QuestionRequest {
        scope_id: msg.chat.id.0,
        question: question.to_string(),
        context_window_hours: state.default_window_hours,
        requester_id,
        reply_context,
        bypass_limiter: requester_id == state.admin_id,
    };

    tracing::info!(
        scope_id = request.scope_id,
        requester_id,
        question_length = question.len(),
        has_reply_context = request.reply_context.is_some(),
        "question received"
    );

    let outcome = state.orchestrator.answer_question(&request).await;
    let report = state
        .coordinator
        .deliver(request.scope_id, &outcome, state.preferred_mode)
        .await;

    if !report.succeeded {
        tracing::error!(
            scope_id = request.scope_id,
            reason = report.failure_reason.as_deref(),
            "answer delivery failed"
        );
    }
    Ok(())
}

/// Whether a plain group message is addressed to the bot and should be
/// answered instead of collected.
fn addressed_to_bot(msg: &Message, state: &AppState) -> bool {
    if !(msg.chat.is_group() || msg.chat.is_supergroup()) {
        return false;
    }
    let Some(text) = msg.text() else {
        return false;
    };
    if text.starts_with('/') {
        return false;
    }

    if mention_question(text, &state.bot_username).is_some() {
        return true;
    }
    msg.reply_to_message()
        .and_then(|quoted| quoted.from.as_ref())
        .is_some_and(|author| author.id.0 as i64 == state.bot_user_id)
}

/// If `text` mentions `@username`, return it with the mention removed.
/// Case-insensitive; `@username2` does not match `@username`.
fn mention_question(text: &str, username: &str) -> Option<String> {
    if username.is_empty() {
        return None;
    }
    let pattern = format!(r"(?i)@{}\b", regex::escape(username));
    let found = Regex::new(&pattern).ok()?.find(text)?;
    let stripped = format!("{}{}", &text[..found.start()], &text[found.end()..]);
    Some(stripped.trim().to_string())
}

/// Wrap a computed recap with its window header and cache footnote.
///
/// The header and footer carry no markup markers: the strict markdown tiers
/// escape markers to literal characters, so decorated text must read the same
/// under every render mode.
fn decorate_recap(outcome: AnalysisOutcome, window_hours: u32) -> AnalysisOutcome {
    match outcome {
        AnalysisOutcome::Delivered {
            text,
            served_from_cache,
        } => {
            let footer = if served_from_cache {
                "\n\ngenerated by AI from cache"
            } else {
                "\n\ngenerated by AI"
            };
            AnalysisOutcome::Delivered {
                text: format!("Chat recap, last {window_hours}h\n\n{text}{footer}"),
                served_from_cache,
            }
        }
        other => other,
    }
}

fn parse_window(args: &str, default_hours: u32) -> Option<u32> {
    let trimmed = args.trim();
    if trimmed.is_empty() {
        return Some(default_hours);
    }
    trimmed
        .parse::<u32>()
        .ok()
        .filter(|hours| (1..=MAX_WINDOW_HOURS).contains(hours))
}

async fn handle_stats(bot: &Bot, msg: &Message, state: &AppState) -> HandlerResult {
    let message_count = state.messages.count().await.unwrap_or(0);
    let cache_entries = state.cache.live_count().await.unwrap_or(0);
    let collecting = state.settings.collection_enabled().await.unwrap_or(true);

    bot.send_message(
        msg.chat.id,
        format!(
            "Messages collected: {message_count}\nCached analyses: {cache_entries}\nCollection active: {}",
            if collecting { "yes" } else { "no" }
        ),
    )
    .await?;
    Ok(())
}

/// Collect ordinary group messages for later analysis.
async fn collect_message(msg: Message, state: Arc<AppState>) -> HandlerResult {
    if !(msg.chat.is_group() || msg.chat.is_supergroup()) {
        return Ok(());
    }
    // An unreadable toggle collects anyway.
    if let Ok(false) = state.settings.collection_enabled().await {
        return Ok(());
    }
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(author) = msg.from.as_ref() else {
        return Ok(());
    };

    let record = ChatRecord {
        message_id: msg.id.0 as i64,
        chat_id: msg.chat.id.0,
        author_id: author.id.0 as i64,
        author_name: author
            .username
            .clone()
            .unwrap_or_else(|| author.first_name.clone()),
        text: text.to_string(),
        timestamp: msg.date,
        reactions: BTreeMap::new(),
        reply_to_message_id: msg.reply_to_message().map(|reply| reply.id.0 as i64),
    };

    if let Err(error) = state.messages.insert(&record).await {
        tracing::error!(chat_id = record.chat_id, %error, "failed to store message");
    }
    Ok(())
}

/// Fold one user's reaction change into the stored per-message counts.
async fn handle_reaction(update: MessageReactionUpdated, state: Arc<AppState>) -> HandlerResult {
    let chat_id = update.chat.id.0;
    let message_id = update.message_id.0 as i64;

    let emojis = |reactions: &[ReactionType]| -> Vec<String> {
        reactions
            .iter()
            .filter_map(|reaction| match reaction {
                ReactionType::Emoji { emoji } => Some(emoji.clone()),
                _ => None,
            })
            .collect()
    };
    let old_emojis = emojis(&update.old_reaction);
    let new_emojis = emojis(&update.new_reaction);

    let mut counts = match state.messages.reactions_for(chat_id, message_id).await {
        Ok(counts) => counts,
        Err(error) => {
            tracing::error!(chat_id, message_id, %error, "failed to read reactions");
            return Ok(());
        }
    };

    for emoji in &new_emojis {
        if !old_emojis.contains(emoji) {
            *counts.entry(emoji.clone()).or_insert(0) += 1;
        }
    }
    for emoji in &old_emojis {
        if !new_emojis.contains(emoji) {
            match counts.get_mut(emoji) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    counts.remove(emoji);
                }
                None => {}
            }
        }
    }

    if let Err(error) = state
        .messages
        .update_reactions(chat_id, message_id, &counts)
        .await
    {
        tracing::error!(chat_id, message_id, %error, "failed to update reactions");
    }
    Ok(())
}
