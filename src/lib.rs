//! Call Relay: turns voice-call customer events into email and WhatsApp
//! notifications.

pub mod bus;
pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod events;
pub mod handlers;
pub mod health;
pub mod ingest;
pub mod logging;
pub mod retry;
pub mod router;
pub mod senders;
