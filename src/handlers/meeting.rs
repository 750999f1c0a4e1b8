//! Meeting confirmations.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

use super::{DispatchContext, EventHandler, HandlerOutcome, Outbox, detail_line, trace_footer};
use crate::config::Recipients;
use crate::events::CustomerEvent;
use crate::senders::ChannelKind;

/// Naive layouts accepted for `time`; read as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// Parse a meeting time: RFC 3339, or one of the naive layouts as UTC.
pub fn parse_meeting_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(raw, layout).ok())
        .map(|naive| naive.and_utc())
}

pub struct MeetingScheduledEventHandler {
    outbox: Outbox,
    recipients: Recipients,
}

impl MeetingScheduledEventHandler {
    pub fn new(outbox: Outbox, recipients: Recipients) -> Self {
        Self { outbox, recipients }
    }
}

#[async_trait]
impl EventHandler for MeetingScheduledEventHandler {
    fn name(&self) -> &'static str {
        "meeting_scheduled"
    }

    async fn handle(&self, event: &CustomerEvent, _ctx: &DispatchContext) -> HandlerOutcome {
        let raw_time = event.field("time").unwrap_or_default();
        let Some(at) = parse_meeting_time(raw_time) else {
            warn!(
                stream_id = ?event.stream_id(),
                time = raw_time,
                "Meeting time could not be parsed; nothing sent"
            );
            return HandlerOutcome::Failed("unparseable time".into());
        };

        let name = event.field("name").unwrap_or("Unknown caller");
        let when = at.format("%A %d %B %Y at %H:%M UTC").to_string();
        let mut results = Vec::new();

        if let Some(operator) = self.recipients.operator_email.as_deref() {
            let subject = format!("Meeting Scheduled: {name}");
            let body = operator_body(event, name, &when);
            let result = self
                .outbox
                .deliver(ChannelKind::Email, operator, &subject, &body)
                .await;
            results.push((ChannelKind::Email, result));
        }

        if let Some(customer) = event.field("email") {
            let subject = "Your meeting is confirmed";
            let body = format!(
                "Hi {name},\n\nYour meeting is booked for {when}.\n\
                 Reply to this email if you need to change it.\n\n{}",
                trace_footer(event)
            );
            let result = self
                .outbox
                .deliver(ChannelKind::Email, customer, subject, &body)
                .await;
            results.push((ChannelKind::Email, result));
        }

        if let Some(chat) = self.recipients.operator_chat.as_deref() {
            let body = format!("Meeting scheduled with {name} for {when}.");
            let result = self.outbox.deliver(ChannelKind::Chat, chat, "", &body).await;
            results.push((ChannelKind::Chat, result));
        }

        if results.is_empty() {
            return HandlerOutcome::Failed("no meeting recipient configured".into());
        }
        HandlerOutcome::from_deliveries(results)
    }
}

fn operator_body(event: &CustomerEvent, name: &str, when: &str) -> String {
    let mut lines = vec![format!("{name} booked a meeting for {when}."), String::new()];
    lines.extend(
        [
            ("Phone", "phone"),
            ("Email", "email"),
            ("Reason", "reason"),
            ("Notes", "notes"),
        ]
        .iter()
        .filter_map(|(label, field)| detail_line(event, label, field)),
    );
    lines.push(String::new());
    lines.push(trace_footer(event));
    lines.join("\n")
}
