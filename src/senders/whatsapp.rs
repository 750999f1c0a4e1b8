//! WhatsApp sender over a Twilio-compatible Messages REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{Ack, ChannelKind, NotificationSender};
use crate::config::{non_empty_var, parse_var};
use crate::error::{ConfigError, SendError};

const CHANNEL: &str = "chat";

/// Maximum body length the messaging API accepts for WhatsApp.
const WHATSAPP_MAX_MESSAGE_LENGTH: usize = 1600;

const DEFAULT_API_BASE: &str = "https://api.twilio.com";

// ── Configuration ───────────────────────────────────────────────────

/// Messaging API configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub api_base: String,
    pub account_sid: String,
    pub auth_token: SecretString,
    /// Sender number, with or without the `whatsapp:` prefix.
    pub from_number: String,
    pub timeout: Duration,
}

impl ChatConfig {
    /// Build config from environment variables.
    /// Returns `Ok(None)` if `CHAT_ACCOUNT_SID` is not set (chat disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(account_sid) = non_empty_var("CHAT_ACCOUNT_SID") else {
            return Ok(None);
        };
        let auth_token = non_empty_var("CHAT_AUTH_TOKEN")
            .ok_or_else(|| ConfigError::MissingEnvVar("CHAT_AUTH_TOKEN".into()))?;
        let from_number = non_empty_var("CHAT_FROM")
            .ok_or_else(|| ConfigError::MissingEnvVar("CHAT_FROM".into()))?;

        Ok(Some(Self {
            api_base: non_empty_var("CHAT_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.into()),
            account_sid,
            auth_token: SecretString::from(auth_token),
            from_number,
            timeout: Duration::from_millis(parse_var("RELAY_SEND_TIMEOUT_MS", 5_000u64)?),
        }))
    }
}

// ── Sender ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: Option<String>,
}

/// Sends WhatsApp messages through the provider's REST API.
pub struct WhatsAppSender {
    config: ChatConfig,
    client: reqwest::Client,
}

impl WhatsAppSender {
    pub fn new(config: ChatConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "CHAT_API_BASE".into(),
                message: format!("HTTP client error: {e}"),
            })?;
        Ok(Self { config, client })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl NotificationSender for WhatsAppSender {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Chat
    }

    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<Ack, SendError> {
        let to = whatsapp_address(recipient);
        let from = whatsapp_address(&self.config.from_number);
        let text = if subject.is_empty() {
            body.to_string()
        } else {
            format!("*{subject}*\n\n{body}")
        };
        let text = truncate_message(&text, WHATSAPP_MAX_MESSAGE_LENGTH);

        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&[("To", to.as_str()), ("From", from.as_str()), ("Body", text.as_str())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SendError::Timeout {
                        channel: CHANNEL.into(),
                        timeout: self.config.timeout,
                    }
                } else {
                    SendError::TransportUnavailable {
                        channel: CHANNEL.into(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let detail = resp.text().await.unwrap_or_default();
            return Err(classify_status(
                status,
                retry_after,
                self.config.timeout,
                recipient,
                &detail,
            ));
        }

        let provider_id = resp
            .json::<MessageResource>()
            .await
            .ok()
            .and_then(|m| m.sid);
        tracing::info!(recipient = %to, sid = ?provider_id, "WhatsApp message sent");

        Ok(Ack {
            channel: ChannelKind::Chat,
            recipient: recipient.to_string(),
            provider_id,
        })
    }
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Prefix a number with `whatsapp:` unless it already has it.
pub fn whatsapp_address(number: &str) -> String {
    let number = number.trim();
    if number.starts_with("whatsapp:") {
        number.to_string()
    } else {
        format!("whatsapp:{number}")
    }
}

/// Cut `text` to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate_message(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(1);
    let mut out: String = text.chars().take(keep).collect();
    out.push('…');
    out
}

/// Map a non-success API status onto a send error kind.
///
/// `timeout` is the client timeout, reported when the API or its gateway
/// timed out.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    timeout: Duration,
    recipient: &str,
    detail: &str,
) -> SendError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SendError::AuthFailure {
            channel: CHANNEL.into(),
            reason: format!("{status}: {detail}"),
        },
        StatusCode::TOO_MANY_REQUESTS => SendError::RateLimited {
            channel: CHANNEL.into(),
            retry_after,
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => SendError::Timeout {
            channel: CHANNEL.into(),
            timeout,
        },
        s if s.is_client_error() => SendError::RecipientRejected {
            channel: CHANNEL.into(),
            recipient: recipient.to_string(),
            reason: format!("{status}: {detail}"),
        },
        _ => SendError::TransportUnavailable {
            channel: CHANNEL.into(),
            reason: format!("{status}: {detail}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Router;
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use tokio::net::TcpListener;

    fn config_for(api_base: String) -> ChatConfig {
        ChatConfig {
            api_base,
            account_sid: "AC123".into(),
            auth_token: SecretString::from("token".to_string()),
            from_number: "+15550000000".into(),
            timeout: Duration::from_secs(2),
        }
    }

    /// Serve a single fixed response on a random port; returns the base URL.
    async fn mock_api(status: StatusCode, body: &'static str) -> String {
        let app = Router::new().route(
            "/2010-04-01/Accounts/{sid}/Messages.json",
            post(move |headers: HeaderMap| async move {
                let mut resp = (status, body).into_response();
                if status == StatusCode::TOO_MANY_REQUESTS {
                    resp.headers_mut()
                        .insert(RETRY_AFTER, "7".parse().expect("header value"));
                }
                assert!(headers.contains_key("authorization"));
                resp
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    #[test]
    fn address_prefix_added_once() {
        assert_eq!(whatsapp_address("+15551234567"), "whatsapp:+15551234567");
        assert_eq!(whatsapp_address("whatsapp:+1555"), "whatsapp:+1555");
    }

    #[test]
    fn truncate_respects_limit() {
        let long = "a".repeat(2000);
        let cut = truncate_message(&long, WHATSAPP_MAX_MESSAGE_LENGTH);
        assert_eq!(cut.chars().count(), WHATSAPP_MAX_MESSAGE_LENGTH);
        assert!(cut.ends_with('…'));
        assert_eq!(truncate_message("short", 10), "short");
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, Duration::from_secs(10), "x", ""),
            SendError::AuthFailure { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, Duration::from_secs(10), "x", "bad number"),
            SendError::RecipientRejected { .. }
        ));
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, None, Duration::from_secs(10), "x", "")
            .is_retryable());
        assert_eq!(
            classify_status(
                StatusCode::TOO_MANY_REQUESTS,
                Some(Duration::from_secs(3)),
                Duration::from_secs(10),
                "x",
                ""
            ),
            SendError::RateLimited {
                channel: "chat".into(),
                retry_after: Some(Duration::from_secs(3)),
            }
        );
    }

    #[test]
    fn gateway_timeouts_map_to_timeout() {
        for status in [StatusCode::REQUEST_TIMEOUT, StatusCode::GATEWAY_TIMEOUT] {
            let err = classify_status(status, None, Duration::from_secs(10), "x", "");
            assert_eq!(
                err,
                SendError::Timeout {
                    channel: "chat".into(),
                    timeout: Duration::from_secs(10),
                },
                "{status}"
            );
            assert!(err.is_retryable());
        }
    }

    #[tokio::test]
    async fn send_returns_provider_sid() {
        let base = mock_api(StatusCode::CREATED, r#"{"sid":"SM42"}"#).await;
        let sender = WhatsAppSender::new(config_for(base)).unwrap();
        let ack = sender.send("+15551234567", "Hi", "Body").await.unwrap();
        assert_eq!(ack.channel, ChannelKind::Chat);
        assert_eq!(ack.provider_id.as_deref(), Some("SM42"));
    }

    #[tokio::test]
    async fn send_maps_rate_limit_with_retry_after() {
        let base = mock_api(StatusCode::TOO_MANY_REQUESTS, "slow down").await;
        let sender = WhatsAppSender::new(config_for(base)).unwrap();
        let err = sender.send("+15551234567", "", "Body").await.unwrap_err();
        assert_eq!(
            err,
            SendError::RateLimited {
                channel: "chat".into(),
                retry_after: Some(Duration::from_secs(7)),
            }
        );
    }

    #[tokio::test]
    async fn gateway_timeout_reports_client_timeout() {
        let base = mock_api(StatusCode::GATEWAY_TIMEOUT, "upstream timed out").await;
        let sender = WhatsAppSender::new(config_for(base)).unwrap();
        let err = sender.send("+15551234567", "", "Body").await.unwrap_err();
        assert_eq!(
            err,
            SendError::Timeout {
                channel: "chat".into(),
                timeout: Duration::from_secs(2),
            }
        );
    }

    #[tokio::test]
    async fn unreachable_api_is_transport_unavailable() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sender = WhatsAppSender::new(config_for(format!("http://{addr}"))).unwrap();
        let err = sender.send("+15551234567", "", "Body").await.unwrap_err();
        assert!(matches!(err, SendError::TransportUnavailable { .. }));
    }
}
