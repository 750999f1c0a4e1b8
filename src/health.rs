//! Liveness / readiness surface for the consumer.
//!
//! The consumer loop pushes state transitions and per-message results into a
//! shared `HealthMonitor`; `health_routes` exposes a snapshot over HTTP.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// Lifecycle of the consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Stopped,
    Subscribing,
    Listening,
    Processing,
    Stopping,
}

impl ConsumerState {
    /// Ready means a subscription is live.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Listening | Self::Processing)
    }
}

/// Point-in-time health view.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: ConsumerState,
    pub ready: bool,
    pub last_processed_at: Option<DateTime<Utc>>,
    /// Handler failures inside the sliding window.
    pub recent_failures: usize,
    pub failure_window_secs: u64,
    pub uptime_secs: u64,
}

struct HealthInner {
    state: ConsumerState,
    last_processed_at: Option<DateTime<Utc>>,
    failures: VecDeque<DateTime<Utc>>,
}

pub struct HealthMonitor {
    inner: Mutex<HealthInner>,
    window: Duration,
    started: Instant,
}

impl HealthMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(HealthInner {
                state: ConsumerState::Stopped,
                last_processed_at: None,
                failures: VecDeque::new(),
            }),
            window,
            started: Instant::now(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HealthInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, state: ConsumerState) {
        let mut inner = self.lock();
        if inner.state != state {
            debug!(from = ?inner.state, to = ?state, "Consumer state change");
            inner.state = state;
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.lock().state
    }

    pub fn record_processed(&self, at: DateTime<Utc>) {
        self.lock().last_processed_at = Some(at);
    }

    pub fn record_failure(&self, at: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.failures.push_back(at);
        prune(&mut inner.failures, self.window, Utc::now());
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let mut inner = self.lock();
        prune(&mut inner.failures, self.window, Utc::now());
        HealthSnapshot {
            status: inner.state,
            ready: inner.state.is_ready(),
            last_processed_at: inner.last_processed_at,
            recent_failures: inner.failures.len(),
            failure_window_secs: self.window.as_secs(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Drop failures older than `window`. Timestamps arrive roughly in order, so
/// trimming from the front is enough.
fn prune(failures: &mut VecDeque<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) {
    let Ok(window) = chrono::Duration::from_std(window) else {
        return;
    };
    let cutoff = now - window;
    while failures.front().is_some_and(|at| *at < cutoff) {
        failures.pop_front();
    }
}

// ── HTTP surface ────────────────────────────────────────────────────

/// `GET /health` (liveness, always 200) and `GET /ready` (200 or 503).
pub fn health_routes(monitor: Arc<HealthMonitor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(monitor)
}

async fn health(State(monitor): State<Arc<HealthMonitor>>) -> Json<HealthSnapshot> {
    Json(monitor.snapshot())
}

async fn ready(State(monitor): State<Arc<HealthMonitor>>) -> (StatusCode, Json<HealthSnapshot>) {
    let snapshot = monitor.snapshot();
    let status = if snapshot.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn readiness_follows_state() {
        let monitor = HealthMonitor::new(Duration::from_secs(60));
        assert!(!monitor.snapshot().ready);
        monitor.set_state(ConsumerState::Listening);
        assert!(monitor.snapshot().ready);
        monitor.set_state(ConsumerState::Processing);
        assert!(monitor.snapshot().ready);
        monitor.set_state(ConsumerState::Subscribing);
        assert!(!monitor.snapshot().ready);
    }

    #[test]
    fn old_failures_leave_the_window() {
        let monitor = HealthMonitor::new(Duration::from_secs(60));
        let now = Utc::now();
        monitor.record_failure(now - chrono::Duration::seconds(120));
        monitor.record_failure(now);
        assert_eq!(monitor.snapshot().recent_failures, 1);
    }

    #[test]
    fn last_processed_is_reported() {
        let monitor = HealthMonitor::new(Duration::from_secs(60));
        let at = Utc::now();
        monitor.record_processed(at);
        assert_eq!(monitor.snapshot().last_processed_at, Some(at));
    }

    #[tokio::test]
    async fn ready_endpoint_returns_503_until_listening() {
        let monitor = Arc::new(HealthMonitor::new(Duration::from_secs(60)));
        let app = health_routes(monitor.clone());

        let resp = app
            .clone()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        monitor.set_state(ConsumerState::Listening);
        let resp = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_endpoint_is_always_ok() {
        let monitor = Arc::new(HealthMonitor::new(Duration::from_secs(60)));
        let resp = health_routes(monitor)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
