//! Payload validation against per-type field rules.
//!
//! Validation is pure and total: every input produces a `ValidationResult`,
//! and reasons come out in field-declaration order so callers can compare
//! exact lists.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::model::{EventType, Payload};

/// Phone after separators are stripped: optional `+`, 10 to 15 digits.
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?\d{10,15}$").expect("static regex"));

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s.]+$").expect("static regex"));

const CONTACT_METHODS: &[&str] = &["whatsapp", "email", "phone"];
const URGENCY_LEVELS: &[&str] = &["low", "medium", "high", "urgent"];

/// Outcome of validating a payload. Invalid payloads are kept so they can
/// still be routed to the invalid-data path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ValidationResult {
    Valid(Payload),
    Invalid {
        reasons: Vec<String>,
        payload: Payload,
    },
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Reasons for rejection; empty when valid.
    pub fn reasons(&self) -> &[String] {
        match self {
            Self::Valid(_) => &[],
            Self::Invalid { reasons, .. } => reasons,
        }
    }

    pub fn payload(&self) -> &Payload {
        match self {
            Self::Valid(payload) | Self::Invalid { payload, .. } => payload,
        }
    }
}

// ── Field rules ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum FieldCheck {
    /// Non-empty string, 2..=100 characters after trimming.
    Name,
    Phone,
    Email,
    /// Any non-empty string.
    Text,
    /// Case-insensitive member of a fixed set.
    OneOf(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
struct FieldRule {
    field: &'static str,
    required: bool,
    check: FieldCheck,
}

const fn required(field: &'static str, check: FieldCheck) -> FieldRule {
    FieldRule {
        field,
        required: true,
        check,
    }
}

const fn optional(field: &'static str, check: FieldCheck) -> FieldRule {
    FieldRule {
        field,
        required: false,
        check,
    }
}

const CUSTOMER_DATA_RULES: &[FieldRule] = &[
    required("name", FieldCheck::Name),
    required("phone", FieldCheck::Phone),
    required("email", FieldCheck::Email),
    optional("contact_method", FieldCheck::OneOf(CONTACT_METHODS)),
    optional("urgency", FieldCheck::OneOf(URGENCY_LEVELS)),
];

const HIGH_PRIORITY_RULES: &[FieldRule] = &[
    required("name", FieldCheck::Name),
    required("phone", FieldCheck::Phone),
    optional("email", FieldCheck::Email),
    optional("contact_method", FieldCheck::OneOf(CONTACT_METHODS)),
    optional("urgency", FieldCheck::OneOf(URGENCY_LEVELS)),
];

// The time is only shape-checked here; parsing belongs to the meeting handler.
const MEETING_RULES: &[FieldRule] = &[
    required("name", FieldCheck::Name),
    required("time", FieldCheck::Text),
    optional("email", FieldCheck::Email),
    optional("phone", FieldCheck::Phone),
];

const INVALID_DATA_RULES: &[FieldRule] = &[];

fn rules_for(event_type: &EventType) -> Option<&'static [FieldRule]> {
    match event_type {
        EventType::CustomerData => Some(CUSTOMER_DATA_RULES),
        EventType::HighPriorityContact => Some(HIGH_PRIORITY_RULES),
        EventType::MeetingScheduled => Some(MEETING_RULES),
        EventType::InvalidCustomerData => Some(INVALID_DATA_RULES),
        EventType::Unknown(_) => None,
    }
}

/// Names of the fields `event_type` requires, in declaration order.
pub fn required_fields(event_type: &EventType) -> Vec<&'static str> {
    rules_for(event_type)
        .unwrap_or_default()
        .iter()
        .filter(|rule| rule.required)
        .map(|rule| rule.field)
        .collect()
}

// ── Validation ──────────────────────────────────────────────────────

/// Validate `payload` against the rules for `event_type`.
pub fn validate(event_type: &EventType, payload: &Payload) -> ValidationResult {
    let Some(rules) = rules_for(event_type) else {
        return ValidationResult::Invalid {
            reasons: vec![format!("unknown event_type: {}", event_type.as_str())],
            payload: payload.clone(),
        };
    };

    let mut reasons = Vec::new();
    for rule in rules {
        match payload.get(rule.field) {
            None | Some(Value::Null) => {
                if rule.required {
                    reasons.push(format!("missing: {}", rule.field));
                }
            }
            Some(value) => {
                if let Err(detail) = check_value(rule.check, value) {
                    reasons.push(format!("malformed: {} ({detail})", rule.field));
                }
            }
        }
    }

    if reasons.is_empty() {
        ValidationResult::Valid(payload.clone())
    } else {
        ValidationResult::Invalid {
            reasons,
            payload: payload.clone(),
        }
    }
}

fn check_value(check: FieldCheck, value: &Value) -> Result<(), String> {
    let Some(raw) = value.as_str() else {
        return Err("expected a string".into());
    };
    let text = raw.trim();

    match check {
        FieldCheck::Name => {
            let len = text.chars().count();
            if len == 0 {
                Err("must not be empty".into())
            } else if !(2..=100).contains(&len) {
                Err("expected 2-100 characters".into())
            } else {
                Ok(())
            }
        }
        FieldCheck::Phone => {
            let cleaned: String = text
                .chars()
                .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
                .collect();
            if PHONE_RE.is_match(&cleaned) {
                Ok(())
            } else {
                Err("expected 10-15 digits with optional leading +".into())
            }
        }
        FieldCheck::Email => {
            if EMAIL_RE.is_match(text) {
                Ok(())
            } else {
                Err("expected an address like name@example.com".into())
            }
        }
        FieldCheck::Text => {
            if text.is_empty() {
                Err("must not be empty".into())
            } else {
                Ok(())
            }
        }
        FieldCheck::OneOf(allowed) => {
            if allowed.iter().any(|a| a.eq_ignore_ascii_case(text)) {
                Ok(())
            } else {
                Err(format!("expected one of {}", allowed.join(", ")))
            }
        }
    }
}
