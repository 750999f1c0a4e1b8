use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::TcpListener;

use call_relay::bus::{EventPublisher, InMemoryBus, MessageBus, RedisBus, TopicMap};
use call_relay::config::RelayConfig;
use call_relay::consumer::ConsumerLoop;
use call_relay::context::RelayContext;
use call_relay::error::SubscriptionError;
use call_relay::health::health_routes;
use call_relay::ingest::ingest_routes;
use call_relay::logging::init_logging;
use call_relay::senders::{ChatConfig, EmailConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = RelayConfig::from_env().context("Invalid relay configuration")?;
    let _log_guard = init_logging(config.log_dir.as_deref()).context("Failed to set up logging")?;

    let email = EmailConfig::from_env().context("Invalid SMTP configuration")?;
    let chat = ChatConfig::from_env().context("Invalid chat API configuration")?;
    if email.is_none() {
        tracing::warn!("SMTP_HOST not set; email notifications disabled");
    }
    if chat.is_none() {
        tracing::warn!("CHAT_ACCOUNT_SID not set; WhatsApp notifications disabled");
    }
    if config.recipients.operator_email.is_none() {
        tracing::warn!("OPERATOR_EMAIL not set; invalid records will not be reported");
    }

    let health_port = config.health_port;
    let redis_url = config.redis_url.clone();
    let ctx = RelayContext::from_configs(config, email, chat)?;

    eprintln!("📞 Call Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Bus: {}",
        if redis_url.is_some() { "redis" } else { "in-process" }
    );
    eprintln!("   Topics: {}", ctx.config.topics.join(", "));
    eprintln!("   Health: http://0.0.0.0:{}/health", health_port);
    eprintln!("   Ingest: http://0.0.0.0:{}/events\n", health_port);

    // ── Bus ─────────────────────────────────────────────────────────────
    let bus: Arc<dyn MessageBus> = match redis_url.as_deref() {
        Some(url) => Arc::new(RedisBus::new(url).context("Invalid REDIS_URL")?),
        None => {
            tracing::warn!("REDIS_URL not set; using the in-process bus");
            Arc::new(InMemoryBus::default())
        }
    };
    let publisher = Arc::new(EventPublisher::new(Arc::clone(&bus), TopicMap::default()));

    // ── HTTP: health + ingest ───────────────────────────────────────────
    let app = health_routes(Arc::clone(&ctx.health)).merge(ingest_routes(publisher));
    let listener = TcpListener::bind(("0.0.0.0", health_port))
        .await
        .with_context(|| format!("Failed to bind health port {health_port}"))?;
    let http_shutdown = ctx.shutdown.clone();
    let http = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    // ── Shutdown on Ctrl-C ──────────────────────────────────────────────
    let signal_token = ctx.shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl-C received; shutting down");
                signal_token.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    // ── Consumer ────────────────────────────────────────────────────────
    let consumer = ConsumerLoop::new(&ctx, bus);
    let result = consumer.run(ctx.shutdown.clone()).await;
    ctx.shutdown.cancel();
    let _ = http.await;

    match result {
        Ok(()) => Ok(()),
        Err(e @ SubscriptionError::Exhausted { .. }) => {
            eprintln!("Error: {e}");
            eprintln!("  The message bus could not be reached; check the broker and restart.");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
