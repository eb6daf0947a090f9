//! Summarization backend: an OpenAI-compatible chat-completions API.

use crate::error::BackendError;
use crate::store::ChatRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Anything that can turn an analysis prompt into generated text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str) -> Result<String, BackendError>;
}

/// Build the analysis prompt from a window of collected messages.
pub fn build_prompt(records: &[ChatRecord], window_hours: u32) -> String {
    let mut lines = Vec::with_capacity(records.len());
    for record in records {
        let mut line = format!(
            "[{}] {}: {}",
            record.timestamp.format("%m-%d %H:%M"),
            record.author_name,
            record.text
        );
        if !record.reactions.is_empty() {
            let reactions: Vec<String> = record
                .reactions
                .iter()
                .map(|(emoji, count)| format!("{emoji} x{count}"))
                .collect();
            line.push_str(&format!(" [reactions: {}]", reactions.join(", ")));
        }
        if let Some(reply_to) = record.reply_to_message_id {
            line.push_str(&format!(" [reply to #{reply_to}]"));
        }
        lines.push(line);
    }

    format!(
        "Analyze the following group-chat messages from the last {window_hours} hours \
         and produce a concise recap.\n\n\
         MESSAGES:\n{}\n\n\
         Cover, in order: the main discussion topics, the messages that drew the most \
         replies or reactions (naming their authors), and a one-line overall mood \
         assessment. Format section headings in *bold*. Keep it short. Start directly \
         with the first section, no preamble.",
        lines.join("\n")
    )
}

/// Build the prompt answering a user question against recent chat context.
/// `reply_context` carries the quoted message when the question was a reply.
pub fn build_question_prompt(
    question: &str,
    records: &[ChatRecord],
    reply_context: Option<&str>,
) -> String {
    let mut prompt = String::new();

    if !records.is_empty() {
        prompt.push_str("RECENT CHAT MESSAGES:\n");
        for record in records {
            prompt.push_str(&format!(
                "[{}] {}: {}\n",
                record.timestamp.format("%m-%d %H:%M"),
                record.author_name,
                record.text
            ));
        }
        prompt.push('\n');
    }
    if let Some(quoted) = reply_context {
        prompt.push_str(&format!("QUOTED MESSAGE:\n{quoted}\n\n"));
    }

    prompt.push_str(&format!(
        "QUESTION: {question}\n\n\
         Answer the question in at most 5 sentences. Use the chat messages \
         above when the question refers to the conversation; give precedence \
         to the quoted message if one is present. Answer directly, no preamble."
    ));
    prompt
}

/// Summarizer over an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiBackend {
    pub fn new(api_key: String, base_url: String, model: String, max_tokens: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            max_tokens,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[async_trait]
impl Summarizer for OpenAiBackend {
    async fn summarize(&self, prompt: &str) -> Result<String, BackendError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => BackendError::InvalidCredentials,
                429 => BackendError::RateLimited,
                413 => BackendError::ContentTooLarge,
                400 if body.contains("context_length") || body.contains("maximum context") => {
                    BackendError::ContentTooLarge
                }
                _ => BackendError::Network(format!("unexpected status {status}: {body}")),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Network(format!("malformed completion response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| BackendError::Network("empty completion response".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone as _, Utc};
    use std::collections::BTreeMap;

    #[test]
    fn prompt_includes_authors_reactions_and_replies() {
        let mut reactions = BTreeMap::new();
        reactions.insert("👍".to_string(), 2);

        let records = vec![
            ChatRecord {
                message_id: 1,
                chat_id: 42,
                author_id: 1,
                author_name: "alice".into(),
                text: "anyone up for lunch?".into(),
                timestamp: Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).unwrap(),
                reactions,
                reply_to_message_id: None,
            },
            ChatRecord {
                message_id: 2,
                chat_id: 42,
                author_id: 2,
                author_name: "bob".into(),
                text: "sure".into(),
                timestamp: Utc.with_ymd_and_hms(2026, 3, 5, 12, 1, 0).unwrap(),
                reactions: BTreeMap::new(),
                reply_to_message_id: Some(1),
            },
        ];

        let prompt = build_prompt(&records, 6);
        assert!(prompt.contains("last 6 hours"));
        assert!(prompt.contains("[03-05 12:00] alice: anyone up for lunch? [reactions: 👍 x2]"));
        assert!(prompt.contains("[03-05 12:01] bob: sure [reply to #1]"));
    }

    #[test]
    fn question_prompt_carries_context_and_quote() {
        let records = vec![ChatRecord {
            message_id: 1,
            chat_id: 42,
            author_id: 1,
            author_name: "alice".into(),
            text: "deploy is at noon".into(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 5, 11, 0, 0).unwrap(),
            reactions: BTreeMap::new(),
            reply_to_message_id: None,
        }];

        let prompt =
            build_question_prompt("when is the deploy?", &records, Some("@alice: deploy is at noon"));
        assert!(prompt.contains("[03-05 11:00] alice: deploy is at noon"));
        assert!(prompt.contains("QUOTED MESSAGE:\n@alice: deploy is at noon"));
        assert!(prompt.contains("QUESTION: when is the deploy?"));

        // No context collected yet: the question still stands alone.
        let bare = build_question_prompt("what is rust?", &[], None);
        assert!(!bare.contains("RECENT CHAT MESSAGES"));
        assert!(bare.contains("QUESTION: what is rust?"));
    }
}
