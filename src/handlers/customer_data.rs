//! Confirmation to the customer after a call captured their details, plus a
//! new-contact notice for the operator.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{DispatchContext, EventHandler, HandlerOutcome, Outbox, detail_line, trace_footer};
use crate::config::Recipients;
use crate::events::{CustomerEvent, EventType};
use crate::senders::ChannelKind;

pub struct CustomerDataEventHandler {
    outbox: Outbox,
    recipients: Recipients,
}

impl CustomerDataEventHandler {
    pub fn new(outbox: Outbox, recipients: Recipients) -> Self {
        Self { outbox, recipients }
    }
}

#[async_trait]
impl EventHandler for CustomerDataEventHandler {
    fn name(&self) -> &'static str {
        "customer_data"
    }

    async fn handle(&self, event: &CustomerEvent, _ctx: &DispatchContext) -> HandlerOutcome {
        let name = event.field("name").unwrap_or("there");
        let wants_chat = event
            .field("contact_method")
            .is_some_and(|m| m.eq_ignore_ascii_case("whatsapp"));
        let mut results = Vec::new();

        match event.field("email") {
            Some(email) => {
                let subject = format!("Thanks for calling, {name}");
                let body = confirmation_body(event, name);
                let result = self
                    .outbox
                    .deliver(ChannelKind::Email, email, &subject, &body)
                    .await;
                results.push((ChannelKind::Email, result));
            }
            None => warn!(
                stream_id = ?event.stream_id(),
                "Customer record has no email; skipping confirmation"
            ),
        }

        if wants_chat {
            if let Some(phone) = event.field("phone") {
                let body = format!(
                    "Hi {name}, thanks for calling. We have your details and will be in touch shortly."
                );
                let result = self.outbox.deliver(ChannelKind::Chat, phone, "", &body).await;
                results.push((ChannelKind::Chat, result));
            }
        }

        // Escalated contacts reach the operator through the high-priority handler.
        if *event.event_type() != EventType::HighPriorityContact {
            if let Some(operator) = self.recipients.operator_email.as_deref() {
                let subject = format!("New Customer Contact: {name}");
                let body = operator_body(event);
                let result = self
                    .outbox
                    .deliver(ChannelKind::Email, operator, &subject, &body)
                    .await;
                results.push((ChannelKind::Email, result));
            }
            if wants_chat {
                if let Some(operator) = self.recipients.operator_chat.as_deref() {
                    let body = operator_chat_body(event);
                    let result = self.outbox.deliver(ChannelKind::Chat, operator, "", &body).await;
                    results.push((ChannelKind::Chat, result));
                }
            }
        }

        if results.is_empty() {
            debug!(
                stream_id = ?event.stream_id(),
                "No contact channel for this customer and no operator configured"
            );
            return HandlerOutcome::Sent(Vec::new());
        }

        let outcome = HandlerOutcome::from_deliveries(results);
        if outcome.is_sent() {
            info!(stream_id = ?event.stream_id(), "Customer contact notices sent");
        }
        outcome
    }
}

const DETAIL_FIELDS: [(&str, &str); 5] = [
    ("Name", "name"),
    ("Phone", "phone"),
    ("Email", "email"),
    ("Reason", "reason"),
    ("Preferred contact", "contact_method"),
];

fn confirmation_body(event: &CustomerEvent, name: &str) -> String {
    let mut lines = vec![
        format!("Hi {name},"),
        String::new(),
        "Thanks for calling. We've recorded the following details:".to_string(),
        String::new(),
    ];
    lines.extend(
        DETAIL_FIELDS
            .iter()
            .filter_map(|(label, field)| detail_line(event, label, field)),
    );
    lines.push(String::new());
    lines.push("Someone from our team will follow up soon.".to_string());
    lines.push(String::new());
    lines.push(trace_footer(event));
    lines.join("\n")
}

fn operator_body(event: &CustomerEvent) -> String {
    let mut lines = vec!["A new customer contact came in.".to_string(), String::new()];
    lines.extend(
        DETAIL_FIELDS
            .iter()
            .chain(&[("Address", "address"), ("Notes", "notes")])
            .filter_map(|(label, field)| detail_line(event, label, field)),
    );
    lines.push(format!(
        "Urgency: {}",
        event.field("urgency").unwrap_or("medium")
    ));
    lines.push(String::new());
    lines.push(trace_footer(event));
    lines.join("\n")
}

fn operator_chat_body(event: &CustomerEvent) -> String {
    format!(
        "New contact: {} ({}) prefers WhatsApp. {}",
        event.field("name").unwrap_or("Unknown caller"),
        event.field("phone").unwrap_or("no phone given"),
        event.field("reason").unwrap_or("no reason given")
    )
}
