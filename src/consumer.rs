//! The consumer loop: subscribe, take one message at a time, validate,
//! dispatch, acknowledge.
//!
//! ```text
//! Stopped → Subscribing → Listening ⇄ Processing → Stopping → Stopped
//!                ↑             │
//!                └── closed ───┘
//! ```
//!
//! Nothing a single message does can end the loop. The only fatal error is
//! running out of subscribe attempts.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{Delivery, MessageBus, Subscription};
use crate::context::RelayContext;
use crate::error::SubscriptionError;
use crate::events::{CustomerEvent, EventType, validate};
use crate::handlers::DispatchContext;
use crate::health::{ConsumerState, HealthMonitor};
use crate::retry::RetryConfig;
use crate::router::{DispatchRouter, HandlerReport};

/// Summary of one processed message, published to `ConsumerLoop::reports`.
#[derive(Debug, Clone, Serialize)]
pub struct MessageReport {
    pub delivery_id: u64,
    pub topic: String,
    pub event_type: EventType,
    pub stream_id: Option<String>,
    /// False for undecodable bodies and rejected records.
    pub valid: bool,
    pub reasons: Vec<String>,
    pub handlers: Vec<HandlerReport>,
}

impl MessageReport {
    pub fn failures(&self) -> usize {
        self.handlers
            .iter()
            .filter(|r| !r.outcome.is_sent())
            .count()
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|r| r.handler).collect()
    }
}

enum ListenExit {
    Shutdown,
    Closed,
}

pub struct ConsumerLoop {
    bus: Arc<dyn MessageBus>,
    router: DispatchRouter,
    topics: Vec<String>,
    subscribe_retry: RetryConfig,
    drain_timeout: Duration,
    send_abort: CancellationToken,
    health: Arc<HealthMonitor>,
    reports: broadcast::Sender<MessageReport>,
}

impl ConsumerLoop {
    pub fn new(ctx: &RelayContext, bus: Arc<dyn MessageBus>) -> Self {
        Self::with_router(ctx, bus, DispatchRouter::from_context(ctx))
    }

    pub fn with_router(ctx: &RelayContext, bus: Arc<dyn MessageBus>, router: DispatchRouter) -> Self {
        let (reports, _) = broadcast::channel(64);
        Self {
            bus,
            router,
            topics: ctx.config.topics.clone(),
            subscribe_retry: ctx.config.subscribe_retry.clone(),
            drain_timeout: ctx.config.drain_timeout,
            send_abort: ctx.send_abort.clone(),
            health: ctx.health.clone(),
            reports,
        }
    }

    /// Observe per-message reports as they complete.
    pub fn reports(&self) -> broadcast::Receiver<MessageReport> {
        self.reports.subscribe()
    }

    /// Run until `shutdown` is cancelled or subscribing is exhausted.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SubscriptionError> {
        let result = self.run_until_stopped(&shutdown).await;
        self.health.set_state(ConsumerState::Stopped);
        match &result {
            Ok(()) => info!("Consumer stopped"),
            Err(e) => error!(error = %e, "Consumer stopped on fatal subscription error"),
        }
        result
    }

    async fn run_until_stopped(&self, shutdown: &CancellationToken) -> Result<(), SubscriptionError> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            self.health.set_state(ConsumerState::Subscribing);
            let Some(mut sub) = self.subscribe_with_backoff(shutdown).await? else {
                return Ok(());
            };

            self.health.set_state(ConsumerState::Listening);
            info!(topics = ?self.topics, "Consumer listening");

            match self.listen(sub.as_mut(), shutdown).await {
                ListenExit::Shutdown => {
                    self.health.set_state(ConsumerState::Stopping);
                    sub.close().await;
                    return Ok(());
                }
                ListenExit::Closed => {
                    warn!("Subscription closed by the bus; re-subscribing");
                }
            }
        }
    }

    /// `Ok(None)` when shutdown arrives while waiting to retry.
    async fn subscribe_with_backoff(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<Box<dyn Subscription>>, SubscriptionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.bus.subscribe(&self.topics).await {
                Ok(sub) => {
                    debug!(attempt, "Subscribed");
                    return Ok(Some(sub));
                }
                Err(e) => e,
            };

            if !self.subscribe_retry.should_retry(attempt) {
                return Err(SubscriptionError::Exhausted {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }

            let delay = self.subscribe_retry.delay_for(attempt);
            warn!(
                attempt,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Subscribe failed, retrying"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn listen(&self, sub: &mut dyn Subscription, shutdown: &CancellationToken) -> ListenExit {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return ListenExit::Shutdown,
                next = sub.next() => match next {
                    Some(delivery) => delivery,
                    None => return ListenExit::Closed,
                },
            };

            self.health.set_state(ConsumerState::Processing);

            let work = AssertUnwindSafe(self.process(&delivery)).catch_unwind();
            tokio::pin!(work);

            let finished = tokio::select! {
                result = &mut work => Some(result),
                _ = shutdown.cancelled() => {
                    info!(
                        topic = %delivery.topic,
                        drain_ms = self.drain_timeout.as_millis() as u64,
                        "Shutdown requested; draining in-flight message"
                    );
                    tokio::time::timeout(self.drain_timeout, &mut work).await.ok()
                }
            };

            match finished {
                Some(Ok(_)) if self.send_abort.is_cancelled() => {
                    warn!(
                        id = delivery.id,
                        topic = %delivery.topic,
                        "Sends were aborted; message not acknowledged"
                    );
                    return ListenExit::Shutdown;
                }
                Some(Ok(report)) => {
                    sub.ack(&delivery).await;
                    self.record(report);
                }
                Some(Err(_)) => {
                    // Panicked messages are acked too; redelivery would panic again.
                    error!(
                        id = delivery.id,
                        topic = %delivery.topic,
                        "Message processing panicked"
                    );
                    sub.ack(&delivery).await;
                    self.health.record_failure(Utc::now());
                }
                None => {
                    self.send_abort.cancel();
                    warn!(
                        id = delivery.id,
                        topic = %delivery.topic,
                        "In-flight message abandoned after drain timeout; not acknowledged"
                    );
                    return ListenExit::Shutdown;
                }
            }

            if shutdown.is_cancelled() {
                return ListenExit::Shutdown;
            }
            self.health.set_state(ConsumerState::Listening);
        }
    }

    /// Decode, validate, route and dispatch a single delivery.
    pub async fn process(&self, delivery: &Delivery) -> MessageReport {
        let event = match CustomerEvent::from_envelope(&delivery.topic, &delivery.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    id = delivery.id,
                    topic = %delivery.topic,
                    error = %e,
                    "Undecodable message routed to invalid-data handler"
                );
                let event = CustomerEvent::undecodable(&delivery.topic);
                let ctx = DispatchContext::undecodable(
                    &delivery.topic,
                    e.to_string(),
                    String::from_utf8_lossy(&delivery.body).into_owned(),
                );
                let handlers = self
                    .router
                    .dispatch(self.router.invalid_data(), &event, &ctx)
                    .await;
                return MessageReport {
                    delivery_id: delivery.id,
                    topic: delivery.topic.clone(),
                    event_type: event.event_type().clone(),
                    stream_id: None,
                    valid: false,
                    reasons: ctx.validation_reasons,
                    handlers,
                };
            }
        };

        info!(
            stream_id = ?event.stream_id(),
            event_type = %event.event_type(),
            topic = %delivery.topic,
            "Processing event"
        );

        let verdict = validate(event.event_type(), event.payload());
        if !verdict.is_valid() {
            info!(
                stream_id = ?event.stream_id(),
                event_type = %event.event_type(),
                reasons = ?verdict.reasons(),
                "Event failed validation"
            );
        }

        let ctx = DispatchContext::from_verdict(&delivery.topic, &verdict);
        let handlers = self
            .router
            .dispatch(self.router.route_verdict(&event, &verdict), &event, &ctx)
            .await;

        MessageReport {
            delivery_id: delivery.id,
            topic: delivery.topic.clone(),
            event_type: event.event_type().clone(),
            stream_id: event.stream_id().map(str::to_string),
            valid: verdict.is_valid(),
            reasons: ctx.validation_reasons,
            handlers,
        }
    }

    fn record(&self, report: MessageReport) {
        let now = Utc::now();
        let failures = report.failures();
        if failures == 0 {
            self.health.record_processed(now);
        } else {
            for _ in 0..failures {
                self.health.record_failure(now);
            }
        }
        // No observers is the normal case.
        let _ = self.reports.send(report);
    }
}
