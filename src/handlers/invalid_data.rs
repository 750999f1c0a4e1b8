//! Operator diagnostic for records that failed validation or decoding.
//!
//! The customer is never contacted from here.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{DispatchContext, EventHandler, HandlerOutcome, Outbox, trace_footer};
use crate::events::CustomerEvent;
use crate::senders::ChannelKind;

pub const SUBJECT: &str = "VALIDATION FAILED - Customer Data Needs Review";

/// Raw bodies longer than this are cut in the diagnostic email.
const RAW_BODY_LIMIT: usize = 4_000;

pub struct InvalidCustomerDataEventHandler {
    outbox: Outbox,
    operator_email: Option<String>,
}

impl InvalidCustomerDataEventHandler {
    pub fn new(outbox: Outbox, operator_email: Option<String>) -> Self {
        Self {
            outbox,
            operator_email,
        }
    }
}

#[async_trait]
impl EventHandler for InvalidCustomerDataEventHandler {
    fn name(&self) -> &'static str {
        "invalid_customer_data"
    }

    async fn handle(&self, event: &CustomerEvent, ctx: &DispatchContext) -> HandlerOutcome {
        let Some(operator) = self.operator_email.as_deref() else {
            warn!(
                stream_id = ?event.stream_id(),
                reasons = ?ctx.validation_reasons,
                "No operator inbox configured; invalid record not reported"
            );
            return HandlerOutcome::Failed("no operator inbox configured".into());
        };

        let body = diagnostic_body(event, ctx);
        let result = self
            .outbox
            .deliver(ChannelKind::Email, operator, SUBJECT, &body)
            .await;
        HandlerOutcome::from_deliveries(vec![(ChannelKind::Email, result)])
    }
}

fn diagnostic_body(event: &CustomerEvent, ctx: &DispatchContext) -> String {
    let mut out = String::from("A customer record could not be processed automatically.\n\n");

    out.push_str(&format!("Event type: {}\n", event.event_type()));
    out.push_str(&format!("Topic: {}\n", ctx.topic));
    out.push_str("\nProblems:\n");
    // A producer-side verdict travels in the payload and leads the list.
    let problems: Vec<&str> = event
        .field("validation_error")
        .into_iter()
        .chain(ctx.validation_reasons.iter().map(String::as_str))
        .collect();
    if problems.is_empty() {
        out.push_str("  - (none reported)\n");
    }
    for problem in problems {
        out.push_str(&format!("  - {problem}\n"));
    }

    if !event.payload().is_empty() {
        out.push_str("\nFields received:\n");
        for (key, value) in event.payload() {
            let shown = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("  {key}: {shown}\n"));
        }
    }

    if let Some(raw) = &ctx.raw_body {
        out.push_str("\nRaw message:\n");
        if raw.chars().count() > RAW_BODY_LIMIT {
            out.extend(raw.chars().take(RAW_BODY_LIMIT));
            out.push_str("\n[truncated]");
        } else {
            out.push_str(raw);
        }
        out.push('\n');
    }

    out.push('\n');
    out.push_str(&trace_footer(event));
    out
}
