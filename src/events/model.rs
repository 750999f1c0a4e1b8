//! Customer event types and envelope decoding.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DeserializationError;

/// Field name → value mapping carried by every event.
pub type Payload = serde_json::Map<String, Value>;

// ── Event type ──────────────────────────────────────────────────────

/// Declared category of a customer event.
///
/// Anything the relay does not recognise lands in `Unknown`, which routes to
/// the invalid-data handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    CustomerData,
    InvalidCustomerData,
    MeetingScheduled,
    HighPriorityContact,
    Unknown(String),
}

impl EventType {
    /// All recognised types, in routing-table order.
    pub fn known() -> [EventType; 4] {
        [
            Self::CustomerData,
            Self::InvalidCustomerData,
            Self::MeetingScheduled,
            Self::HighPriorityContact,
        ]
    }

    /// Parse a wire name. Never fails; unrecognised names become `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "customer_data" => Self::CustomerData,
            "invalid_customer_data" | "customer_data_invalid" => Self::InvalidCustomerData,
            "meeting_scheduled" => Self::MeetingScheduled,
            "high_priority_contact" | "high_priority" => Self::HighPriorityContact,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Canonical wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::CustomerData => "customer_data",
            Self::InvalidCustomerData => "invalid_customer_data",
            Self::MeetingScheduled => "meeting_scheduled",
            Self::HighPriorityContact => "high_priority_contact",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl From<String> for EventType {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) if raw.is_empty() => write!(f, "<none>"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

// ── Field canonicalization ──────────────────────────────────────────

/// Long-form producer field names and the canonical names they map to.
const FIELD_ALIASES: &[(&str, &str)] = &[
    ("full_name", "name"),
    ("client_name", "name"),
    ("customer_name", "name"),
    ("phone_number", "phone"),
    ("preferred_time", "time"),
    ("meeting_time", "time"),
    ("preferred_contact", "contact_method"),
    ("preferred_contact_method", "contact_method"),
    ("additional_notes", "notes"),
    ("reason_calling", "reason"),
];

/// Rename alias fields onto their canonical names.
///
/// A canonical key that is already present wins; the alias is then kept
/// under its original name so nothing is lost.
pub fn canonicalize(mut payload: Payload) -> Payload {
    for (alias, canonical) in FIELD_ALIASES {
        if payload.contains_key(*canonical) {
            continue;
        }
        if let Some(value) = payload.remove(*alias) {
            payload.insert((*canonical).to_string(), value);
        }
    }
    payload
}

// ── Customer event ──────────────────────────────────────────────────

/// The unit flowing through the pipeline.
///
/// Built once when a message comes off the channel and only handed out by
/// shared reference afterwards, so none of its fields change after creation.
#[derive(Debug, Clone, Serialize)]
pub struct CustomerEvent {
    event_type: EventType,
    payload: Payload,
    received_at: DateTime<Utc>,
    stream_id: Option<String>,
    event_id: Option<String>,
    topic: String,
}

impl CustomerEvent {
    /// Create an event received now.
    pub fn new(event_type: EventType, payload: Payload, stream_id: Option<String>) -> Self {
        Self {
            event_type,
            payload: canonicalize(payload),
            received_at: Utc::now(),
            stream_id,
            event_id: None,
            topic: String::new(),
        }
    }

    /// Placeholder for a body that could not be decoded at all.
    pub fn undecodable(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            ..Self::new(EventType::Unknown(String::new()), Payload::new(), None)
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Decode a raw channel body. `received_at` is stamped here, never taken
    /// from the producer's `timestamp`.
    pub fn from_envelope(topic: &str, body: &[u8]) -> Result<Self, DeserializationError> {
        let value: Value = serde_json::from_slice(body)?;
        let Value::Object(mut envelope) = value else {
            return Err(DeserializationError::NotAnObject);
        };

        let event_type = match envelope.get("event_type") {
            Some(Value::String(raw)) => EventType::parse(raw),
            _ => return Err(DeserializationError::MissingEventType),
        };

        let payload = match envelope.remove("payload").or_else(|| envelope.remove("data")) {
            Some(Value::Object(map)) => map,
            None | Some(Value::Null) => Payload::new(),
            Some(_) => return Err(DeserializationError::PayloadNotAnObject),
        };

        let stream_id = envelope.get("stream_id").and_then(id_string);
        let event_id = envelope.get("event_id").and_then(id_string);

        let mut event = Self::new(event_type, payload, stream_id).with_topic(topic);
        event.event_id = event_id;
        Ok(event)
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// String value of a payload field, trimmed; `None` when absent, empty or
    /// not a string.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Correlation ids may arrive as strings or numbers.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_and_legacy_names() {
        assert_eq!(EventType::parse("customer_data"), EventType::CustomerData);
        assert_eq!(
            EventType::parse("customer_data_invalid"),
            EventType::InvalidCustomerData
        );
        assert_eq!(
            EventType::parse("high_priority"),
            EventType::HighPriorityContact
        );
        assert_eq!(
            EventType::parse("email_request"),
            EventType::Unknown("email_request".into())
        );
    }

    #[test]
    fn event_type_serializes_as_wire_name() {
        let json = serde_json::to_string(&EventType::MeetingScheduled).unwrap();
        assert_eq!(json, "\"meeting_scheduled\"");
        let parsed: EventType = serde_json::from_str("\"mystery\"").unwrap();
        assert_eq!(parsed, EventType::Unknown("mystery".into()));
    }

    #[test]
    fn canonicalize_maps_long_names() {
        let payload = json!({"full_name": "Dana", "phone_number": "+15551234567"});
        let Value::Object(map) = payload else { unreachable!() };
        let out = canonicalize(map);
        assert_eq!(out.get("name"), Some(&json!("Dana")));
        assert_eq!(out.get("phone"), Some(&json!("+15551234567")));
        assert!(!out.contains_key("full_name"));
    }

    #[test]
    fn canonical_key_wins_over_alias() {
        let payload = json!({"name": "Dana", "full_name": "Dana Scully"});
        let Value::Object(map) = payload else { unreachable!() };
        let out = canonicalize(map);
        assert_eq!(out.get("name"), Some(&json!("Dana")));
        assert_eq!(out.get("full_name"), Some(&json!("Dana Scully")));
    }

    #[test]
    fn decodes_envelope_with_payload() {
        let body = br#"{"event_type":"customer_data","stream_id":"MZ123","event_id":"e-1","payload":{"name":"Dana"}}"#;
        let event = CustomerEvent::from_envelope("customer:data:new", body).unwrap();
        assert_eq!(event.event_type(), &EventType::CustomerData);
        assert_eq!(event.stream_id(), Some("MZ123"));
        assert_eq!(event.event_id(), Some("e-1"));
        assert_eq!(event.topic(), "customer:data:new");
        assert_eq!(event.field("name"), Some("Dana"));
    }

    #[test]
    fn decodes_legacy_data_key() {
        let body = br#"{"event_type":"meeting_scheduled","timestamp":"2020-01-01T00:00:00","data":{"client_name":"Dana"}}"#;
        let event = CustomerEvent::from_envelope("t", body).unwrap();
        assert_eq!(event.field("name"), Some("Dana"));
        // Producer timestamp is ignored in favour of the consumer clock.
        assert!(event.received_at() > DateTime::parse_from_rfc3339("2021-01-01T00:00:00Z").unwrap());
    }

    #[test]
    fn missing_payload_is_empty() {
        let event = CustomerEvent::from_envelope("t", br#"{"event_type":"customer_data"}"#).unwrap();
        assert!(event.payload().is_empty());
    }

    #[test]
    fn rejects_bad_envelopes() {
        assert!(matches!(
            CustomerEvent::from_envelope("t", b"not json"),
            Err(DeserializationError::Json(_))
        ));
        assert!(matches!(
            CustomerEvent::from_envelope("t", b"[1,2]"),
            Err(DeserializationError::NotAnObject)
        ));
        assert!(matches!(
            CustomerEvent::from_envelope("t", br#"{"payload":{}}"#),
            Err(DeserializationError::MissingEventType)
        ));
        assert!(matches!(
            CustomerEvent::from_envelope("t", br#"{"event_type":"customer_data","payload":"x"}"#),
            Err(DeserializationError::PayloadNotAnObject)
        ));
    }

    #[test]
    fn field_ignores_blank_and_non_strings() {
        let body = br#"{"event_type":"customer_data","payload":{"name":"  ","phone":5551234567}}"#;
        let event = CustomerEvent::from_envelope("t", body).unwrap();
        assert_eq!(event.field("name"), None);
        assert_eq!(event.field("phone"), None);
    }

    #[test]
    fn undecodable_displays_placeholder_type() {
        let event = CustomerEvent::undecodable("t");
        assert_eq!(event.event_type().to_string(), "<none>");
        assert!(!event.event_type().is_known());
    }
}
