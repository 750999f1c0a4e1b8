//! Event handlers, one per event category, all behind `EventHandler`.
//!
//! Handlers format notifications and push them through the `Outbox`, which
//! owns the per-call timeout and the bounded retry policy. Failure isolation
//! between sibling handlers is the router's job, not the handler's.

pub mod customer_data;
pub mod high_priority;
pub mod invalid_data;
pub mod meeting;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SendError;
use crate::events::{CustomerEvent, ValidationResult};
use crate::retry::RetryConfig;
use crate::senders::{Ack, ChannelKind, NotificationSender};

pub use customer_data::CustomerDataEventHandler;
pub use high_priority::HighPriorityEventHandler;
pub use invalid_data::InvalidCustomerDataEventHandler;
pub use meeting::MeetingScheduledEventHandler;

// ── Handler contract ────────────────────────────────────────────────

/// Result of one handler run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum HandlerOutcome {
    /// Channels that delivered successfully.
    Sent(Vec<ChannelKind>),
    Failed(String),
}

impl HandlerOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent(_))
    }

    /// Collapse per-channel delivery results: any success means `Sent` with
    /// the channels that worked; otherwise `Failed` with every error.
    pub fn from_deliveries(results: Vec<(ChannelKind, Result<Ack, SendError>)>) -> Self {
        if results.is_empty() {
            return Self::Failed("no channel attempted".into());
        }
        let sent: Vec<ChannelKind> = results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(kind, _)| *kind)
            .collect();
        if !sent.is_empty() {
            return Self::Sent(sent);
        }
        let reasons: Vec<String> = results
            .into_iter()
            .filter_map(|(kind, r)| r.err().map(|e| format!("{kind}: {e}")))
            .collect();
        Self::Failed(reasons.join("; "))
    }
}

/// Extra context a handler may need beyond the event itself.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    /// Topic the message arrived on.
    pub topic: String,
    /// Validation reasons when the event was rejected.
    pub validation_reasons: Vec<String>,
    /// Raw body, kept when the message could not be decoded.
    pub raw_body: Option<String>,
}

impl DispatchContext {
    pub fn from_verdict(topic: &str, verdict: &ValidationResult) -> Self {
        Self {
            topic: topic.to_string(),
            validation_reasons: verdict.reasons().to_vec(),
            raw_body: None,
        }
    }

    pub fn undecodable(topic: &str, reason: String, raw_body: String) -> Self {
        Self {
            topic: topic.to_string(),
            validation_reasons: vec![format!("undecodable: {reason}")],
            raw_body: Some(raw_body),
        }
    }
}

/// Business action for one event category.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name used in logs and reports.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &CustomerEvent, ctx: &DispatchContext) -> HandlerOutcome;
}

// ── Outbox ──────────────────────────────────────────────────────────

/// Shared delivery front for handlers: picks the transport, bounds each call
/// with a timeout and retries transient failures with backoff.
#[derive(Clone)]
pub struct Outbox {
    email: Option<Arc<dyn NotificationSender>>,
    chat: Option<Arc<dyn NotificationSender>>,
    retry: RetryConfig,
    send_timeout: Duration,
    abort: CancellationToken,
}

impl Outbox {
    pub fn new(retry: RetryConfig, send_timeout: Duration) -> Self {
        Self {
            email: None,
            chat: None,
            retry,
            send_timeout,
            abort: CancellationToken::new(),
        }
    }

    pub fn with_email(mut self, sender: Arc<dyn NotificationSender>) -> Self {
        self.email = Some(sender);
        self
    }

    pub fn with_chat(mut self, sender: Arc<dyn NotificationSender>) -> Self {
        self.chat = Some(sender);
        self
    }

    /// Give up pending retries once `token` is cancelled.
    ///
    /// This must not be the consumer's shutdown token: retries keep running
    /// through the drain and are only cut off when the drain expires.
    pub fn with_abort(mut self, token: CancellationToken) -> Self {
        self.abort = token;
        self
    }

    pub fn has(&self, kind: ChannelKind) -> bool {
        self.sender(kind).is_some()
    }

    fn sender(&self, kind: ChannelKind) -> Option<&Arc<dyn NotificationSender>> {
        match kind {
            ChannelKind::Email => self.email.as_ref(),
            ChannelKind::Chat => self.chat.as_ref(),
        }
    }

    /// Deliver one notification with timeout and bounded retry.
    ///
    /// `AuthFailure` and `RecipientRejected` are returned on first sight.
    /// A cancelled abort token ends the retry loop with `SendError::Aborted`.
    pub async fn deliver(
        &self,
        kind: ChannelKind,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<Ack, SendError> {
        let Some(sender) = self.sender(kind) else {
            return Err(SendError::TransportUnavailable {
                channel: kind.to_string(),
                reason: "transport not configured".into(),
            });
        };

        let aborted = || SendError::Aborted {
            channel: kind.to_string(),
        };

        let mut attempt = 0;
        loop {
            if self.abort.is_cancelled() {
                return Err(aborted());
            }
            attempt += 1;
            let result =
                match tokio::time::timeout(self.send_timeout, sender.send(recipient, subject, body))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SendError::Timeout {
                        channel: kind.to_string(),
                        timeout: self.send_timeout,
                    }),
                };

            let err = match result {
                Ok(ack) => {
                    debug!(channel = %kind, recipient, attempt, "Delivered");
                    return Ok(ack);
                }
                Err(e) => e,
            };

            if !err.is_retryable() || !self.retry.should_retry(attempt) {
                return Err(err);
            }

            let mut delay = self.retry.delay_for(attempt);
            if let SendError::RateLimited {
                retry_after: Some(after),
                ..
            } = &err
            {
                delay = delay.max(*after).min(self.retry.max_delay.max(delay));
            }
            warn!(
                channel = %kind,
                attempt,
                kind = err.kind(),
                delay_ms = delay.as_millis() as u64,
                "Send failed, retrying"
            );

            tokio::select! {
                _ = self.abort.cancelled() => {
                    warn!(channel = %kind, attempt, last = %err, "Send abandoned during backoff");
                    return Err(aborted());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

// ── Shared formatting helpers ───────────────────────────────────────

/// `label: value` line for a payload field, skipped when the field is blank.
pub(crate) fn detail_line(event: &CustomerEvent, label: &str, field: &str) -> Option<String> {
    event.field(field).map(|value| format!("{label}: {value}"))
}

/// Correlation footer appended to every notification body.
pub(crate) fn trace_footer(event: &CustomerEvent) -> String {
    format!(
        "Reference: {} (received {})",
        event.stream_id().unwrap_or("n/a"),
        event.received_at().format("%Y-%m-%d %H:%M UTC")
    )
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let email = RecordingSender::failing_with(
            ChannelKind::Email,
            vec![unavailable("email"), unavailable("email")],
        );
        let chat = RecordingSender::new(ChannelKind::Chat);
        let outbox = outbox(&email, &chat);

        let ack = outbox
            .deliver(ChannelKind::Email, "dana@x.com", "Hi", "Body")
            .await
            .unwrap();
        assert_eq!(ack.recipient, "dana@x.com");
        assert_eq!(email.calls(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let email = RecordingSender::failing_with(
            ChannelKind::Email,
            vec![unavailable("email"), unavailable("email"), unavailable("email")],
        );
        let chat = RecordingSender::new(ChannelKind::Chat);
        let err = outbox(&email, &chat)
            .deliver(ChannelKind::Email, "dana@x.com", "Hi", "Body")
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::TransportUnavailable { .. }));
        assert_eq!(email.calls(), 3);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let email = RecordingSender::failing_with(
            ChannelKind::Email,
            vec![SendError::AuthFailure {
                channel: "email".into(),
                reason: "535".into(),
            }],
        );
        let chat = RecordingSender::new(ChannelKind::Chat);
        let err = outbox(&email, &chat)
            .deliver(ChannelKind::Email, "dana@x.com", "Hi", "Body")
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::AuthFailure { .. }));
        assert_eq!(email.calls(), 1);
    }

    #[tokio::test]
    async fn slow_sender_times_out() {
        struct Stalled;

        #[async_trait]
        impl NotificationSender for Stalled {
            fn channel(&self) -> ChannelKind {
                ChannelKind::Chat
            }
            async fn send(&self, _: &str, _: &str, _: &str) -> Result<Ack, SendError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                unreachable!("timeout fires first")
            }
        }

        let outbox = Outbox::new(RetryConfig::immediate(1), Duration::from_millis(20))
            .with_chat(Arc::new(Stalled));
        let err = outbox
            .deliver(ChannelKind::Chat, "+15551234567", "", "Body")
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Timeout { .. }));
    }

    #[tokio::test]
    async fn missing_transport_fails_without_panic() {
        let outbox = Outbox::new(RetryConfig::immediate(3), Duration::from_secs(1));
        assert!(!outbox.has(ChannelKind::Email));
        let err = outbox
            .deliver(ChannelKind::Email, "dana@x.com", "Hi", "Body")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[tokio::test]
    async fn abort_token_cuts_backoff_short() {
        let email = RecordingSender::failing_with(ChannelKind::Email, vec![unavailable("email")]);
        let abort = CancellationToken::new();
        let outbox = Outbox::new(
            RetryConfig::for_senders().with_initial_delay(Duration::from_secs(30)),
            Duration::from_secs(1),
        )
        .with_email(email.clone())
        .with_abort(abort.clone());

        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            outbox.deliver(ChannelKind::Email, "dana@x.com", "Hi", "Body"),
        )
        .await
        .expect("backoff should end when aborted")
        .unwrap_err();
        assert!(matches!(err, SendError::Aborted { .. }));
        assert!(!err.is_retryable());
        assert_eq!(email.calls(), 1);
    }

    #[tokio::test]
    async fn already_aborted_outbox_sends_nothing() {
        let email = RecordingSender::new(ChannelKind::Email);
        let abort = CancellationToken::new();
        abort.cancel();
        let chat = RecordingSender::new(ChannelKind::Chat);
        let err = outbox(&email, &chat)
            .with_abort(abort)
            .deliver(ChannelKind::Email, "dana@x.com", "Hi", "Body")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "aborted");
        assert_eq!(email.calls(), 0);
    }

    #[test]
    fn outcome_from_mixed_deliveries() {
        let ok = Ok(Ack {
            channel: ChannelKind::Chat,
            recipient: "+1".into(),
            provider_id: None,
        });
        let outcome = HandlerOutcome::from_deliveries(vec![
            (ChannelKind::Email, Err(unavailable("email"))),
            (ChannelKind::Chat, ok),
        ]);
        assert_eq!(outcome, HandlerOutcome::Sent(vec![ChannelKind::Chat]));
    }

    #[test]
    fn outcome_when_everything_failed() {
        let outcome =
            HandlerOutcome::from_deliveries(vec![(ChannelKind::Email, Err(unavailable("email")))]);
        match outcome {
            HandlerOutcome::Failed(reason) => assert!(reason.starts_with("email:")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
