//! Analysis orchestration: rate limiter, result cache, and summarization
//! backend composed into the at-most-one-per-window pipeline.
//!
//! Every decision re-reads the shared stores; nothing is held in memory
//! across calls. Two same-scope requests that race past the limiter check
//! before either marks it executed can both reach the backend gate; the
//! cooldown is an anti-spam measure, not a lock, and serializing scopes
//! behind the slow backend call would cost more than the duplicate work.

use crate::ScopeId;
use crate::backend::{self, Summarizer};
use crate::cache::ResultCache;
use crate::error::{BackendError, Result};
use crate::limiter::RateLimiter;
use crate::store::{ChatRecord, MessageStore};
use chrono::{Duration, Utc};
use sha2::{Digest as _, Sha256};
use std::sync::Arc;

/// Reply when the requested window holds no messages at all.
pub const EMPTY_WINDOW_NOTICE: &str = "No messages to analyze in the requested period.";

/// Which command family an analysis belongs to. Each kind cools down on its
/// own limiter key, so one never blocks the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisKind {
    Recap,
    DeepRecap,
}

impl AnalysisKind {
    fn key_prefix(self) -> &'static str {
        match self {
            AnalysisKind::Recap => "analyze",
            AnalysisKind::DeepRecap => "deep",
        }
    }
}

/// A single analysis request. Never persisted.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub scope_id: ScopeId,
    pub window_hours: u32,
    pub kind: AnalysisKind,
    pub requester_id: i64,
    /// Privileged callers skip their own limiter check. The shared cooldown
    /// record is left untouched either way.
    pub bypass_limiter: bool,
}

/// A question asked of the bot, answered against recent chat context.
#[derive(Debug, Clone)]
pub struct QuestionRequest {
    pub scope_id: ScopeId,
    pub question: String,
    /// How far back to collect context, in hours.
    pub context_window_hours: u32,
    pub requester_id: i64,
    /// The quoted message, when the question was asked as a reply.
    pub reply_context: Option<String>,
    pub bypass_limiter: bool,
}

/// What a request produced.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Delivered {
        text: String,
        served_from_cache: bool,
    },
    RateLimited {
        remaining_seconds: f64,
    },
    BackendFailed {
        reason: String,
    },
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub cooldown_seconds: u64,
    pub cache_ttl_seconds: u64,
    pub backend_timeout: std::time::Duration,
}

/// Composes the stores and the backend into `request_analysis`.
pub struct AnalysisOrchestrator {
    messages: MessageStore,
    cache: ResultCache,
    limiter: RateLimiter,
    backend: Arc<dyn Summarizer>,
    settings: OrchestratorSettings,
}

impl AnalysisOrchestrator {
    pub fn new(
        messages: MessageStore,
        cache: ResultCache,
        limiter: RateLimiter,
        backend: Arc<dyn Summarizer>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            messages,
            cache,
            limiter,
            backend,
            settings,
        }
    }

    /// Produce an analysis for the requested scope and window.
    ///
    /// Infrastructure failures (store unreachable) surface as
    /// `BackendFailed`: nothing was mutated and the caller may retry.
    pub async fn request_analysis(&self, request: &AnalysisRequest) -> AnalysisOutcome {
        match self.run(request).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(scope_id = request.scope_id, %error, "analysis failed on infrastructure");
                AnalysisOutcome::BackendFailed {
                    reason: error.to_string(),
                }
            }
        }
    }

    async fn run(&self, request: &AnalysisRequest) -> Result<AnalysisOutcome> {
        let since = Utc::now() - Duration::hours(request.window_hours as i64);
        let records = self.messages.fetch_since(request.scope_id, since).await?;

        if records.is_empty() {
            tracing::debug!(scope_id = request.scope_id, "empty analysis window");
            return Ok(AnalysisOutcome::Delivered {
                text: EMPTY_WINDOW_NOTICE.to_string(),
                served_from_cache: false,
            });
        }

        let fingerprint = fingerprint(request.scope_id, request.window_hours, &records);

        // A cache hit is not new work; it must never be blocked by the
        // limiter, and it does not touch the limiter either.
        if let Some(cached) = self.cache.get(&fingerprint).await? {
            tracing::info!(scope_id = request.scope_id, "serving analysis from cache");
            return Ok(AnalysisOutcome::Delivered {
                text: cached,
                served_from_cache: true,
            });
        }

        let operation_key = operation_key(request.kind.key_prefix(), request.scope_id);
        if !request.bypass_limiter {
            let (permitted, remaining_seconds) = self
                .limiter
                .try_acquire(&operation_key, self.settings.cooldown_seconds)
                .await?;
            if !permitted {
                tracing::debug!(
                    scope_id = request.scope_id,
                    remaining_seconds,
                    "analysis within cooldown"
                );
                return Ok(AnalysisOutcome::RateLimited { remaining_seconds });
            }
        }

        // No lock is held here: the backend call is the slowest step and
        // must not serialize unrelated scopes.
        let prompt = backend::build_prompt(&records, request.window_hours);
        let summary = match tokio::time::timeout(
            self.settings.backend_timeout,
            self.backend.summarize(&prompt),
        )
        .await
        {
            Ok(Ok(summary)) => summary,
            Ok(Err(error)) => {
                tracing::warn!(scope_id = request.scope_id, %error, "summarization backend failed");
                return Ok(AnalysisOutcome::BackendFailed {
                    reason: error.to_string(),
                });
            }
            Err(_) => {
                let error = BackendError::Timeout(self.settings.backend_timeout.as_secs());
                tracing::warn!(scope_id = request.scope_id, %error, "summarization backend timed out");
                return Ok(AnalysisOutcome::BackendFailed {
                    reason: error.to_string(),
                });
            }
        };

        // Cache before marking the limiter: a failure between the two leaves
        // a reusable result rather than a consumed window with nothing to
        // show for it.
        self.cache
            .set(&fingerprint, &summary, self.settings.cache_ttl_seconds)
            .await?;
        if !request.bypass_limiter {
            self.limiter.mark_executed(&operation_key).await?;
        }

        tracing::info!(
            scope_id = request.scope_id,
            record_count = records.len(),
            "analysis completed"
        );
        Ok(AnalysisOutcome::Delivered {
            text: summary,
            served_from_cache: false,
        })
    }

    /// Answer a question against recent chat context.
    ///
    /// Questions cool down on their own `ask:` key and are never cached: the
    /// same question can deserve a different answer as the chat moves on.
    pub async fn answer_question(&self, request: &QuestionRequest) -> AnalysisOutcome {
        match self.run_question(request).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(scope_id = request.scope_id, %error, "question failed on infrastructure");
                AnalysisOutcome::BackendFailed {
                    reason: error.to_string(),
                }
            }
        }
    }

    async fn run_question(&self, request: &QuestionRequest) -> Result<AnalysisOutcome> {
        let operation_key = operation_key("ask", request.scope_id);
        if !request.bypass_limiter {
            let (permitted, remaining_seconds) = self
                .limiter
                .try_acquire(&operation_key, self.settings.cooldown_seconds)
                .await?;
            if !permitted {
                tracing::debug!(
                    scope_id = request.scope_id,
                    remaining_seconds,
                    "question within cooldown"
                );
                return Ok(AnalysisOutcome::RateLimited { remaining_seconds });
            }
        }

        let since = Utc::now() - Duration::hours(request.context_window_hours as i64);
        let records = self.messages.fetch_since(request.scope_id, since).await?;

        let prompt = backend::build_question_prompt(
            &request.question,
            &records,
            request.reply_context.as_deref(),
        );
        let answer = match tokio::time::timeout(
            self.settings.backend_timeout,
            self.backend.summarize(&prompt),
        )
        .await
        {
            Ok(Ok(answer)) => answer,
            Ok(Err(error)) => {
                tracing::warn!(scope_id = request.scope_id, %error, "question backend failed");
                return Ok(AnalysisOutcome::BackendFailed {
                    reason: error.to_string(),
                });
            }
            Err(_) => {
                let error = BackendError::Timeout(self.settings.backend_timeout.as_secs());
                tracing::warn!(scope_id = request.scope_id, %error, "question backend timed out");
                return Ok(AnalysisOutcome::BackendFailed {
                    reason: error.to_string(),
                });
            }
        };

        if !request.bypass_limiter {
            self.limiter.mark_executed(&operation_key).await?;
        }

        tracing::info!(
            scope_id = request.scope_id,
            context_records = records.len(),
            "question answered"
        );
        Ok(AnalysisOutcome::Delivered {
            text: answer,
            served_from_cache: false,
        })
    }
}

fn operation_key(prefix: &str, scope_id: ScopeId) -> String {
    format!("{prefix}:{scope_id}")
}

/// Deterministic digest over the semantic inputs of an analysis: the scope,
/// the window width, and the content of every record considered. Wall-clock
/// time is deliberately excluded so identical inputs collide.
fn fingerprint(scope_id: ScopeId, window_hours: u32, records: &[ChatRecord]) -> String {
    let mut ordered: Vec<&ChatRecord> = records.iter().collect();
    ordered.sort_by_key(|r| (r.chat_id, r.message_id));

    let mut hasher = Sha256::new();
    hasher.update(scope_id.to_le_bytes());
    hasher.update(window_hours.to_le_bytes());
    for record in ordered {
        let reactions = serde_json::to_string(&record.reactions).unwrap_or_default();
        hasher.update(record.chat_id.to_le_bytes());
        hasher.update(record.message_id.to_le_bytes());
        hasher.update(record.text.as_bytes());
        hasher.update([0x1f]);
        hasher.update(reactions.as_bytes());
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}
