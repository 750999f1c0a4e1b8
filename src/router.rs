//! Static event-type → handler routing and isolated concurrent dispatch.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::context::RelayContext;
use crate::error::HandlerError;
use crate::events::{CustomerEvent, EventType, ValidationResult};
use crate::handlers::{
    CustomerDataEventHandler, DispatchContext, EventHandler, HandlerOutcome,
    HighPriorityEventHandler, InvalidCustomerDataEventHandler, MeetingScheduledEventHandler,
};

/// Result of one handler invocation.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerReport {
    pub handler: &'static str,
    pub outcome: HandlerOutcome,
    #[serde(with = "millis")]
    pub elapsed: Duration,
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// The four handler instances the routing table draws from.
pub struct HandlerSet {
    pub customer_data: Arc<dyn EventHandler>,
    pub invalid_data: Arc<dyn EventHandler>,
    pub meeting: Arc<dyn EventHandler>,
    pub high_priority: Arc<dyn EventHandler>,
}

impl HandlerSet {
    /// Production handlers, sharing the context's outbox and recipients.
    pub fn from_context(ctx: &RelayContext) -> Self {
        let outbox = ctx.outbox.clone();
        let recipients = ctx.config.recipients.clone();
        Self {
            customer_data: Arc::new(CustomerDataEventHandler::new(
                outbox.clone(),
                recipients.clone(),
            )),
            invalid_data: Arc::new(InvalidCustomerDataEventHandler::new(
                outbox.clone(),
                recipients.operator_email.clone(),
            )),
            meeting: Arc::new(MeetingScheduledEventHandler::new(
                outbox.clone(),
                recipients.clone(),
            )),
            high_priority: Arc::new(HighPriorityEventHandler::new(outbox, recipients)),
        }
    }
}

pub struct DispatchRouter {
    customer_data: Vec<Arc<dyn EventHandler>>,
    high_priority: Vec<Arc<dyn EventHandler>>,
    meeting: Vec<Arc<dyn EventHandler>>,
    invalid_data: Vec<Arc<dyn EventHandler>>,
    handler_timeout: Duration,
}

impl DispatchRouter {
    pub fn new(handlers: HandlerSet, handler_timeout: Duration) -> Self {
        Self {
            customer_data: vec![handlers.customer_data.clone()],
            high_priority: vec![handlers.customer_data, handlers.high_priority],
            meeting: vec![handlers.meeting],
            invalid_data: vec![handlers.invalid_data],
            handler_timeout,
        }
    }

    pub fn from_context(ctx: &RelayContext) -> Self {
        Self::new(HandlerSet::from_context(ctx), ctx.config.handler_timeout)
    }

    /// Handlers for an event type, in invocation order. Never empty.
    pub fn route(&self, event_type: &EventType) -> &[Arc<dyn EventHandler>] {
        match event_type {
            EventType::CustomerData => &self.customer_data,
            EventType::HighPriorityContact => &self.high_priority,
            EventType::MeetingScheduled => &self.meeting,
            EventType::InvalidCustomerData | EventType::Unknown(_) => &self.invalid_data,
        }
    }

    /// Like `route`, but any rejected record goes to the invalid-data
    /// handler alone.
    pub fn route_verdict(
        &self,
        event: &CustomerEvent,
        verdict: &ValidationResult,
    ) -> &[Arc<dyn EventHandler>] {
        if verdict.is_valid() {
            self.route(event.event_type())
        } else {
            &self.invalid_data
        }
    }

    pub fn invalid_data(&self) -> &[Arc<dyn EventHandler>] {
        &self.invalid_data
    }

    /// Run `handlers` concurrently and collect one report each, in order.
    ///
    /// Each handler is bounded by the handler timeout and guarded against
    /// panics; a bad handler only ever produces a `Failed` report.
    pub async fn dispatch(
        &self,
        handlers: &[Arc<dyn EventHandler>],
        event: &CustomerEvent,
        ctx: &DispatchContext,
    ) -> Vec<HandlerReport> {
        let runs = handlers
            .iter()
            .map(|handler| self.run_one(handler.as_ref(), event, ctx));
        join_all(runs).await
    }

    async fn run_one(
        &self,
        handler: &dyn EventHandler,
        event: &CustomerEvent,
        ctx: &DispatchContext,
    ) -> HandlerReport {
        let name = handler.name();
        let started = Instant::now();
        let guarded = AssertUnwindSafe(handler.handle(event, ctx)).catch_unwind();

        let outcome = match tokio::time::timeout(self.handler_timeout, guarded).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                let err = HandlerError::Panicked {
                    name: name.to_string(),
                    reason: panic_message(panic.as_ref()),
                };
                error!(
                    handler = name,
                    stream_id = ?event.stream_id(),
                    event_type = %event.event_type(),
                    error = %err,
                    "Handler panicked"
                );
                HandlerOutcome::Failed(err.to_string())
            }
            Err(_) => {
                let err = HandlerError::Timeout {
                    name: name.to_string(),
                    timeout: self.handler_timeout,
                };
                warn!(
                    handler = name,
                    stream_id = ?event.stream_id(),
                    event_type = %event.event_type(),
                    "Handler timed out"
                );
                HandlerOutcome::Failed(err.to_string())
            }
        };

        match &outcome {
            HandlerOutcome::Sent(channels) => debug!(
                handler = name,
                stream_id = ?event.stream_id(),
                ?channels,
                "Handler finished"
            ),
            HandlerOutcome::Failed(reason) => warn!(
                handler = name,
                stream_id = ?event.stream_id(),
                event_type = %event.event_type(),
                reason = %reason,
                "Handler failed"
            ),
        }

        HandlerReport {
            handler: name,
            outcome,
            elapsed: started.elapsed(),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
