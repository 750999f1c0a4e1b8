//! Error types for call-relay.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] DeserializationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// A raw channel message could not be turned into an event envelope.
#[derive(Debug, thiserror::Error)]
pub enum DeserializationError {
    #[error("Body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Body is not a JSON object")]
    NotAnObject,

    #[error("Envelope has no event_type")]
    MissingEventType,

    #[error("Envelope payload is not a JSON object")]
    PayloadNotAnObject,
}

/// Outbound notification failures, one variant per transport error kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Authentication failed on {channel}: {reason}")]
    AuthFailure { channel: String, reason: String },

    #[error("Recipient {recipient} rejected on {channel}: {reason}")]
    RecipientRejected {
        channel: String,
        recipient: String,
        reason: String,
    },

    #[error("Transport {channel} unavailable: {reason}")]
    TransportUnavailable { channel: String, reason: String },

    #[error("Send on {channel} timed out after {timeout:?}")]
    Timeout { channel: String, timeout: Duration },

    #[error("Rate limited on {channel}, retry after {retry_after:?}")]
    RateLimited {
        channel: String,
        retry_after: Option<Duration>,
    },

    #[error("Send on {channel} abandoned at shutdown")]
    Aborted { channel: String },
}

impl SendError {
    /// Transient kinds are worth another attempt; auth and recipient
    /// rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable { .. } | Self::Timeout { .. } | Self::RateLimited { .. }
        )
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthFailure { .. } => "auth_failure",
            Self::RecipientRejected { .. } => "recipient_rejected",
            Self::TransportUnavailable { .. } => "transport_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// Failures raised while running a single handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Handler {name} panicked: {reason}")]
    Panicked { name: String, reason: String },

    #[error("Handler {name} failed: {reason}")]
    Failed { name: String, reason: String },
}

/// Channel subscription failures. Only exhaustion is fatal.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Failed to subscribe to {topics:?}: {reason}")]
    Connect { topics: Vec<String>, reason: String },

    #[error("Subscription closed: {0}")]
    Closed(String),

    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Gave up subscribing after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}
