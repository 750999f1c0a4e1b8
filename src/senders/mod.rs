//! Outbound notification transports.
//!
//! Each sender is a narrow wrapper over one transport. Credentials and the
//! sender identity are fixed at construction; `send` makes exactly one
//! attempt and reports a typed `SendError`. Retries belong to the caller.

pub mod email;
pub mod whatsapp;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::SendError;

pub use email::{EmailConfig, EmailSender};
pub use whatsapp::{ChatConfig, WhatsAppSender};

/// Kind of outbound channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Chat,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Chat => "chat",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport acknowledgement for a delivered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub channel: ChannelKind,
    pub recipient: String,
    /// Provider-side message id, when the transport returns one.
    pub provider_id: Option<String>,
}

/// One outbound notification transport.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    fn channel(&self) -> ChannelKind;

    /// Deliver one message. Makes a single attempt.
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<Ack, SendError>;
}
