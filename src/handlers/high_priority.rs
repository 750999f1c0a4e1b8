//! Escalation for urgent callers: operator email plus a chat page.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{DispatchContext, EventHandler, HandlerOutcome, Outbox, detail_line, trace_footer};
use crate::config::Recipients;
use crate::events::CustomerEvent;
use crate::senders::ChannelKind;

pub struct HighPriorityEventHandler {
    outbox: Outbox,
    recipients: Recipients,
}

impl HighPriorityEventHandler {
    pub fn new(outbox: Outbox, recipients: Recipients) -> Self {
        Self { outbox, recipients }
    }
}

#[async_trait]
impl EventHandler for HighPriorityEventHandler {
    fn name(&self) -> &'static str {
        "high_priority"
    }

    async fn handle(&self, event: &CustomerEvent, _ctx: &DispatchContext) -> HandlerOutcome {
        let name = event.field("name").unwrap_or("Unknown caller");
        let phone = event.field("phone").unwrap_or("no phone given");
        let mut results = Vec::new();

        if let Some(operator) = self.recipients.operator_email.as_deref() {
            let subject = format!("[URGENT] HIGH PRIORITY: {name}");
            let body = escalation_body(event, name);
            let result = self
                .outbox
                .deliver(ChannelKind::Email, operator, &subject, &body)
                .await;
            results.push((ChannelKind::Email, result));
        }

        if let Some(pager) = self.recipients.escalation_chat.as_deref() {
            let reason = event.field("reason").unwrap_or("no reason given");
            let body = format!("URGENT: {name} ({phone}) needs a call back. {reason}");
            let result = self.outbox.deliver(ChannelKind::Chat, pager, "", &body).await;
            results.push((ChannelKind::Chat, result));
        }

        if results.is_empty() {
            warn!(stream_id = ?event.stream_id(), "No escalation recipient configured");
            return HandlerOutcome::Failed("no escalation recipient configured".into());
        }

        let outcome = HandlerOutcome::from_deliveries(results);
        if outcome.is_sent() {
            info!(stream_id = ?event.stream_id(), "High-priority contact escalated");
        }
        outcome
    }
}

fn escalation_body(event: &CustomerEvent, name: &str) -> String {
    let mut lines = vec![
        format!("{name} was flagged as high priority and needs an immediate call back."),
        String::new(),
    ];
    lines.extend(
        [
            ("Phone", "phone"),
            ("Email", "email"),
            ("Reason", "reason"),
            ("Urgency", "urgency"),
            ("Notes", "notes"),
        ]
        .iter()
        .filter_map(|(label, field)| detail_line(event, label, field)),
    );
    lines.push(String::new());
    lines.push(trace_footer(event));
    lines.join("\n")
}
