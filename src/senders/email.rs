//! Email sender: SMTP via lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use super::{Ack, ChannelKind, NotificationSender};
use crate::config::{non_empty_var, parse_var};
use crate::error::{ConfigError, SendError};

const CHANNEL: &str = "email";

// ── Configuration ───────────────────────────────────────────────────

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// Socket timeout handed to the SMTP client.
    pub timeout: Duration,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `Ok(None)` if `SMTP_HOST` is not set (email disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(smtp_host) = non_empty_var("SMTP_HOST") else {
            return Ok(None);
        };

        let username = non_empty_var("SMTP_USERNAME").unwrap_or_default();
        let password = non_empty_var("SMTP_PASSWORD").unwrap_or_default();
        let from_address = non_empty_var("SMTP_FROM").unwrap_or_else(|| username.clone());
        if from_address.is_empty() {
            return Err(ConfigError::MissingEnvVar("SMTP_FROM".into()));
        }

        Ok(Some(Self {
            smtp_host,
            smtp_port: parse_var("SMTP_PORT", 587)?,
            username,
            password: SecretString::from(password),
            from_address,
            timeout: Duration::from_millis(parse_var("RELAY_SEND_TIMEOUT_MS", 5_000u64)?),
        }))
    }
}

// ── Sender ──────────────────────────────────────────────────────────

/// Sends plain-text mail through one long-lived SMTP transport.
pub struct EmailSender {
    transport: SmtpTransport,
    from: Mailbox,
    timeout: Duration,
}

impl EmailSender {
    pub fn new(config: &EmailConfig) -> Result<Self, ConfigError> {
        let from: Mailbox =
            config
                .from_address
                .parse()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "SMTP_FROM".into(),
                    message: format!("{e}"),
                })?;

        // Port 465 speaks implicit TLS; everything else upgrades via STARTTLS.
        let builder = if config.smtp_port == 465 {
            SmtpTransport::relay(&config.smtp_host)
        } else {
            SmtpTransport::starttls_relay(&config.smtp_host)
        }
        .map_err(|e| ConfigError::InvalidValue {
            key: "SMTP_HOST".into(),
            message: format!("SMTP relay error: {e}"),
        })?;

        let mut builder = builder
            .port(config.smtp_port)
            .timeout(Some(config.timeout));
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            timeout: config.timeout,
        })
    }

    fn build_message(&self, recipient: &str, subject: &str, body: &str) -> Result<Message, SendError> {
        let to: Mailbox = recipient.parse().map_err(|e| SendError::RecipientRejected {
            channel: CHANNEL.into(),
            recipient: recipient.to_string(),
            reason: format!("Invalid address: {e}"),
        })?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| SendError::RecipientRejected {
                channel: CHANNEL.into(),
                recipient: recipient.to_string(),
                reason: format!("Failed to build email: {e}"),
            })
    }
}

#[async_trait]
impl NotificationSender for EmailSender {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<Ack, SendError> {
        let message = self.build_message(recipient, subject, body)?;
        let transport = self.transport.clone();

        let response = tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| SendError::TransportUnavailable {
                channel: CHANNEL.into(),
                reason: format!("SMTP task failed: {e}"),
            })?
            .map_err(|e| self.classify(&e, recipient))?;

        let provider_id = response.message().next().map(str::to_string);
        tracing::info!(recipient, code = %response.code(), "Email sent");

        Ok(Ack {
            channel: ChannelKind::Email,
            recipient: recipient.to_string(),
            provider_id,
        })
    }
}

impl EmailSender {
    fn classify(&self, err: &lettre::transport::smtp::Error, recipient: &str) -> SendError {
        if err.is_timeout() {
            return SendError::Timeout {
                channel: CHANNEL.into(),
                timeout: self.timeout,
            };
        }
        let code = err.status().map(|c| c.to_string());
        classify_reply_code(code.as_deref(), recipient, &err.to_string())
    }
}

/// Map an SMTP reply code onto a send error kind.
pub fn classify_reply_code(code: Option<&str>, recipient: &str, reason: &str) -> SendError {
    match code {
        Some("530" | "534" | "535") => SendError::AuthFailure {
            channel: CHANNEL.into(),
            reason: reason.to_string(),
        },
        Some("550" | "551" | "553") => SendError::RecipientRejected {
            channel: CHANNEL.into(),
            recipient: recipient.to_string(),
            reason: reason.to_string(),
        },
        _ => SendError::TransportUnavailable {
            channel: CHANNEL.into(),
            reason: reason.to_string(),
        },
    }
}
