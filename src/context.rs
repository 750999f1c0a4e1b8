//! Process-wide dependencies, built once at start-up and passed explicitly.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RelayConfig;
use crate::error::ConfigError;
use crate::handlers::Outbox;
use crate::health::HealthMonitor;
use crate::senders::{ChatConfig, EmailConfig, EmailSender, NotificationSender, WhatsAppSender};

/// Everything the router, handlers and consumer share.
#[derive(Clone)]
pub struct RelayContext {
    pub config: RelayConfig,
    pub outbox: Outbox,
    pub health: Arc<HealthMonitor>,
    /// Cancelled once to stop taking new messages.
    pub shutdown: CancellationToken,
    /// Cancelled by the consumer when the drain timeout expires; pending
    /// send retries give up at that point.
    pub send_abort: CancellationToken,
}

impl RelayContext {
    /// Assemble a context around already-built senders. Either transport may
    /// be absent; handlers then report that channel as failed.
    pub fn new(
        config: RelayConfig,
        email: Option<Arc<dyn NotificationSender>>,
        chat: Option<Arc<dyn NotificationSender>>,
    ) -> Self {
        let send_abort = CancellationToken::new();
        let mut outbox = Outbox::new(config.send_retry.clone(), config.send_timeout)
            .with_abort(send_abort.clone());
        if let Some(email) = email {
            outbox = outbox.with_email(email);
        }
        if let Some(chat) = chat {
            outbox = outbox.with_chat(chat);
        }

        Self {
            health: Arc::new(HealthMonitor::new(config.failure_window)),
            config,
            outbox,
            shutdown: CancellationToken::new(),
            send_abort,
        }
    }

    /// Build the production senders from their configs.
    pub fn from_configs(
        config: RelayConfig,
        email: Option<EmailConfig>,
        chat: Option<ChatConfig>,
    ) -> Result<Self, ConfigError> {
        let email: Option<Arc<dyn NotificationSender>> = match email {
            Some(cfg) => {
                info!(host = %cfg.smtp_host, port = cfg.smtp_port, "Email transport enabled");
                Some(Arc::new(EmailSender::new(&cfg)?))
            }
            None => None,
        };
        let chat: Option<Arc<dyn NotificationSender>> = match chat {
            Some(cfg) => {
                info!(api = %cfg.api_base, "WhatsApp transport enabled");
                Some(Arc::new(WhatsAppSender::new(cfg)?))
            }
            None => None,
        };
        Ok(Self::new(config, email, chat))
    }
}
