//! Delivery coordination: drives a planned render-fallback chain against the
//! transport and reports the final outcome.
//!
//! The chain is `preferred markup -> alternate markup -> plain`, advancing
//! only on a transport "cannot render" rejection. Chunks accepted before an
//! advance are never re-sent; the rest of the message continues at the next
//! mode. Any other transport error aborts immediately.

use crate::ScopeId;
use crate::analysis::AnalysisOutcome;
use crate::error::TransportError;
use crate::format::{self, RenderMode};
use crate::transport::Transport;
use std::sync::Arc;

/// Fixed notice for a failed backend run.
pub const BACKEND_FAILURE_NOTICE: &str =
    "Sorry, the analysis could not be completed right now. Please try again later.";

/// Final outcome of one delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub mode_used: Option<RenderMode>,
    pub chunk_count: usize,
    pub succeeded: bool,
    pub failure_reason: Option<String>,
}

impl DeliveryReport {
    fn success(mode: RenderMode, chunk_count: usize) -> Self {
        Self {
            mode_used: Some(mode),
            chunk_count,
            succeeded: true,
            failure_reason: None,
        }
    }

    fn failure(mode: Option<RenderMode>, chunk_count: usize, reason: String) -> Self {
        Self {
            mode_used: mode,
            chunk_count,
            succeeded: false,
            failure_reason: Some(reason),
        }
    }
}

/// Sends analysis outcomes through the transport with formatting fallback.
pub struct DeliveryCoordinator {
    transport: Arc<dyn Transport>,
    max_message_length: usize,
}

impl DeliveryCoordinator {
    pub fn new(transport: Arc<dyn Transport>, max_message_length: usize) -> Self {
        Self {
            transport,
            max_message_length,
        }
    }

    /// Deliver an analysis outcome to `scope_id`.
    ///
    /// Rate-limit and backend-failure notices go out as plain informational
    /// text; only `Delivered` payloads run the markup fallback chain.
    pub async fn deliver(
        &self,
        scope_id: ScopeId,
        outcome: &AnalysisOutcome,
        preferred: RenderMode,
    ) -> DeliveryReport {
        match outcome {
            AnalysisOutcome::RateLimited { remaining_seconds } => {
                let notice = format!(
                    "Too many requests. The last analysis ran recently; try again in {}.",
                    format_wait_time(*remaining_seconds)
                );
                self.send_plain_notice(scope_id, &notice).await
            }
            AnalysisOutcome::BackendFailed { reason } => {
                tracing::warn!(scope_id, %reason, "delivering backend-failure notice");
                self.send_plain_notice(scope_id, BACKEND_FAILURE_NOTICE).await
            }
            AnalysisOutcome::Delivered { text, .. } => {
                self.deliver_with_fallback(scope_id, text, preferred).await
            }
        }
    }

    async fn send_plain_notice(&self, scope_id: ScopeId, notice: &str) -> DeliveryReport {
        match self.transport.send(scope_id, notice, RenderMode::Plain).await {
            Ok(()) => DeliveryReport::success(RenderMode::Plain, 1),
            Err(error) => DeliveryReport::failure(Some(RenderMode::Plain), 0, error.to_string()),
        }
    }

    async fn deliver_with_fallback(
        &self,
        scope_id: ScopeId,
        text: &str,
        preferred: RenderMode,
    ) -> DeliveryReport {
        let attempts = format::render_with_fallback(text, preferred, self.max_message_length);
        let final_index = attempts.len() - 1;
        let mut sent = 0usize;

        for (index, attempt) in attempts.iter().enumerate() {
            let mut rejected = false;
            while sent < attempt.chunks.len() {
                match self
                    .transport
                    .send(scope_id, &attempt.chunks[sent], attempt.mode)
                    .await
                {
                    Ok(()) => sent += 1,
                    Err(TransportError::CannotRenderMarkup) if index < final_index => {
                        tracing::warn!(
                            scope_id,
                            mode = %attempt.mode,
                            chunk = sent,
                            "markup rejected, advancing fallback chain"
                        );
                        rejected = true;
                        break;
                    }
                    Err(TransportError::CannotRenderMarkup) => {
                        // Even plain text was refused. Leave a truncated
                        // plain notice rather than nothing at all.
                        tracing::error!(scope_id, "all render modes rejected");
                        self.send_truncated_notice(scope_id, text).await;
                        return DeliveryReport::failure(
                            Some(attempt.mode),
                            sent,
                            "all render modes rejected by transport".into(),
                        );
                    }
                    Err(error) => {
                        tracing::error!(scope_id, %error, "transport error aborted delivery");
                        return DeliveryReport::failure(Some(attempt.mode), sent, error.to_string());
                    }
                }
            }
            if !rejected {
                return DeliveryReport::success(attempt.mode, sent);
            }
        }

        // Unreachable while the chain ends in Plain; kept for a future tier.
        DeliveryReport::failure(None, sent, "fallback chain exhausted".into())
    }

    async fn send_truncated_notice(&self, scope_id: ScopeId, text: &str) {
        let plain = format::strip_markup(text);
        let excerpt: String = plain
            .chars()
            .take(self.max_message_length.saturating_sub(64))
            .collect();
        let notice = format!("The recap could not be formatted. Plain excerpt:\n{excerpt}");
        if let Err(error) = self
            .transport
            .send(scope_id, &notice, RenderMode::Plain)
            .await
        {
            tracing::error!(scope_id, %error, "truncated plain notice was also rejected");
        }
    }
}

/// Render a wait duration as `"2h 30m 15s"`, dropping leading zero-valued
/// components and always showing at least seconds.
pub fn format_wait_time(seconds: f64) -> String {
    let total = seconds.max(0.0).ceil() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Decide = Box<dyn Fn(usize, RenderMode) -> Result<(), TransportError> + Send + Sync>;

    struct MockTransport {
        decide: Decide,
        attempts: Mutex<usize>,
        accepted: Mutex<Vec<(RenderMode, String)>>,
    }

    impl MockTransport {
        fn new(
            decide: impl Fn(usize, RenderMode) -> Result<(), TransportError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                decide: Box::new(decide),
                attempts: Mutex::new(0),
                accepted: Mutex::new(Vec::new()),
            })
        }

        fn accepted(&self) -> Vec<(RenderMode, String)> {
            self.accepted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(
            &self,
            _scope_id: ScopeId,
            text: &str,
            mode: RenderMode,
        ) -> Result<(), TransportError> {
            let index = {
                let mut attempts = self.attempts.lock().unwrap();
                let index = *attempts;
                *attempts += 1;
                index
            };
            let result = (self.decide)(index, mode);
            if result.is_ok() {
                self.accepted.lock().unwrap().push((mode, text.to_string()));
            }
            result
        }
    }

    fn delivered(text: &str) -> AnalysisOutcome {
        AnalysisOutcome::Delivered {
            text: text.into(),
            served_from_cache: false,
        }
    }

    #[tokio::test]
    async fn preferred_mode_accepted_first_try() {
        let transport = MockTransport::new(|_, _| Ok(()));
        let coordinator = DeliveryCoordinator::new(transport.clone(), 4096);

        let report = coordinator
            .deliver(1, &delivered("all good"), RenderMode::Markdown)
            .await;

        assert_eq!(report, DeliveryReport::success(RenderMode::Markdown, 1));
        assert_eq!(transport.accepted()[0].0, RenderMode::Markdown);
    }

    #[tokio::test]
    async fn markup_rejection_falls_back_to_html_with_literal_specials() {
        let transport = MockTransport::new(|_, mode| match mode {
            RenderMode::Markdown => Err(TransportError::CannotRenderMarkup),
            _ => Ok(()),
        });
        let coordinator = DeliveryCoordinator::new(transport.clone(), 4096);

        let report = coordinator
            .deliver(1, &delivered("*unclosed [bracket"), RenderMode::Markdown)
            .await;

        assert_eq!(report, DeliveryReport::success(RenderMode::Html, 1));
        // The HTML tier carries the asterisk and bracket as literal text.
        assert_eq!(
            transport.accepted(),
            vec![(RenderMode::Html, "*unclosed [bracket".to_string())]
        );
    }

    #[tokio::test]
    async fn double_rejection_lands_on_plain() {
        let transport = MockTransport::new(|_, mode| match mode {
            RenderMode::Plain => Ok(()),
            _ => Err(TransportError::CannotRenderMarkup),
        });
        let coordinator = DeliveryCoordinator::new(transport.clone(), 4096);

        let report = coordinator
            .deliver(1, &delivered("*bold* text"), RenderMode::Markdown)
            .await;

        assert_eq!(report, DeliveryReport::success(RenderMode::Plain, 1));
        assert_eq!(
            transport.accepted(),
            vec![(RenderMode::Plain, "bold text".to_string())]
        );
    }

    #[tokio::test]
    async fn accepted_chunks_are_not_resent_after_fallback() {
        // Two chunks per mode; Markdown is rejected only at its second chunk.
        let transport = MockTransport::new({
            let markdown_calls = std::sync::atomic::AtomicUsize::new(0);
            move |_, mode| {
                if mode == RenderMode::Markdown {
                    let call =
                        markdown_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if call >= 1 {
                        return Err(TransportError::CannotRenderMarkup);
                    }
                }
                Ok(())
            }
        });
        let coordinator = DeliveryCoordinator::new(transport.clone(), 7);

        // Splits as ["hello\n\n", "world"] in every mode.
        let report = coordinator
            .deliver(1, &delivered("hello\n\nworld"), RenderMode::Markdown)
            .await;

        assert_eq!(report, DeliveryReport::success(RenderMode::Html, 2));
        assert_eq!(
            transport.accepted(),
            vec![
                (RenderMode::Markdown, "hello\n\n".to_string()),
                (RenderMode::Html, "world".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn other_transport_error_aborts_the_chain() {
        let transport = MockTransport::new(|index, _| {
            if index == 0 {
                Ok(())
            } else {
                Err(TransportError::Other("network down".into()))
            }
        });
        let coordinator = DeliveryCoordinator::new(transport.clone(), 7);

        let report = coordinator
            .deliver(1, &delivered("hello\n\nworld"), RenderMode::Markdown)
            .await;

        assert!(!report.succeeded);
        assert_eq!(report.chunk_count, 1);
        assert_eq!(report.mode_used, Some(RenderMode::Markdown));
        assert!(report.failure_reason.unwrap().contains("network down"));
        // No fallback tier was attempted.
        assert_eq!(transport.accepted().len(), 1);
    }

    #[tokio::test]
    async fn plain_rejection_is_terminal_with_truncated_notice() {
        let transport = MockTransport::new(|_, _| Err(TransportError::CannotRenderMarkup));
        let coordinator = DeliveryCoordinator::new(transport.clone(), 4096);

        let report = coordinator
            .deliver(1, &delivered("*text*"), RenderMode::Markdown)
            .await;

        assert!(!report.succeeded);
        assert_eq!(report.mode_used, Some(RenderMode::Plain));
        assert!(report.failure_reason.unwrap().contains("all render modes"));
    }

    #[tokio::test]
    async fn rate_limited_outcome_sends_plain_wait_notice() {
        let transport = MockTransport::new(|_, _| Ok(()));
        let coordinator = DeliveryCoordinator::new(transport.clone(), 4096);

        let report = coordinator
            .deliver(
                1,
                &AnalysisOutcome::RateLimited {
                    remaining_seconds: 45.0,
                },
                RenderMode::Markdown,
            )
            .await;

        assert_eq!(report, DeliveryReport::success(RenderMode::Plain, 1));
        let accepted = transport.accepted();
        assert_eq!(accepted[0].0, RenderMode::Plain);
        assert!(accepted[0].1.contains("45s"));
    }

    #[tokio::test]
    async fn backend_failure_outcome_sends_apology() {
        let transport = MockTransport::new(|_, _| Ok(()));
        let coordinator = DeliveryCoordinator::new(transport.clone(), 4096);

        let report = coordinator
            .deliver(
                1,
                &AnalysisOutcome::BackendFailed {
                    reason: "boom".into(),
                },
                RenderMode::Markdown,
            )
            .await;

        assert_eq!(report, DeliveryReport::success(RenderMode::Plain, 1));
        assert_eq!(transport.accepted()[0].1, BACKEND_FAILURE_NOTICE);
    }

    #[test]
    fn wait_time_formatting() {
        assert_eq!(format_wait_time(9015.0), "2h 30m 15s");
        assert_eq!(format_wait_time(2730.0), "45m 30s");
        assert_eq!(format_wait_time(45.0), "45s");
        assert_eq!(format_wait_time(0.0), "0s");
        // Leading zero components only are dropped; interior zeros stay.
        assert_eq!(format_wait_time(7205.0), "2h 0m 5s");
    }
}
