//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bus::TopicMap;
use crate::error::ConfigError;
use crate::retry::RetryConfig;

/// Where operator-facing notifications go.
#[derive(Debug, Clone, Default)]
pub struct Recipients {
    /// Inbox for diagnostics, meeting notices and escalations.
    pub operator_email: Option<String>,
    /// Chat address for meeting notices.
    pub operator_chat: Option<String>,
    /// Chat address paged for high-priority contacts.
    pub escalation_chat: Option<String>,
}

impl Recipients {
    pub fn from_env() -> Self {
        Self {
            operator_email: non_empty_var("OPERATOR_EMAIL"),
            operator_chat: non_empty_var("OPERATOR_CHAT"),
            escalation_chat: non_empty_var("ESCALATION_CHAT")
                .or_else(|| non_empty_var("OPERATOR_CHAT")),
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Redis pub/sub broker. Unset means the in-process bus fed by
    /// `POST /events`.
    pub redis_url: Option<String>,
    /// Topics the consumer subscribes to.
    pub topics: Vec<String>,
    /// Port for the health probe server.
    pub health_port: u16,
    /// Upper bound on a single sender call.
    pub send_timeout: Duration,
    /// Upper bound on a single handler invocation.
    pub handler_timeout: Duration,
    /// How long an in-flight message may keep running after shutdown.
    pub drain_timeout: Duration,
    /// Sliding window for the health failure count.
    pub failure_window: Duration,
    /// Backoff for transient sender failures.
    pub send_retry: RetryConfig,
    /// Backoff for subscription (re)connects.
    pub subscribe_retry: RetryConfig,
    /// Operator addresses.
    pub recipients: Recipients,
    /// Directory for rolling log files (stdout only when unset).
    pub log_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            topics: TopicMap::default().all(),
            health_port: 8081,
            send_timeout: Duration::from_secs(5),
            handler_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            failure_window: Duration::from_secs(300), // 5 minutes
            send_retry: RetryConfig::for_senders(),
            subscribe_retry: RetryConfig::for_subscription(),
            recipients: Recipients::default(),
            log_dir: None,
        }
    }
}

impl RelayConfig {
    /// Build config from environment variables, falling back to defaults for
    /// anything unset. A set-but-unparseable value is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let topics = match non_empty_var("RELAY_TOPICS") {
            Some(raw) => {
                let topics: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if topics.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        key: "RELAY_TOPICS".into(),
                        message: "no topics listed".into(),
                    });
                }
                topics
            }
            None => defaults.topics,
        };

        let send_retry = defaults
            .send_retry
            .clone()
            .with_max_attempts(parse_var(
                "RELAY_SEND_MAX_ATTEMPTS",
                defaults.send_retry.max_attempts,
            )?)
            .with_initial_delay(millis_var(
                "RELAY_SEND_BACKOFF_MS",
                defaults.send_retry.initial_delay,
            )?);
        let subscribe_retry = defaults
            .subscribe_retry
            .clone()
            .with_max_attempts(parse_var(
                "RELAY_SUBSCRIBE_MAX_ATTEMPTS",
                defaults.subscribe_retry.max_attempts,
            )?)
            .with_initial_delay(millis_var(
                "RELAY_SUBSCRIBE_BACKOFF_MS",
                defaults.subscribe_retry.initial_delay,
            )?);

        Ok(Self {
            redis_url: non_empty_var("REDIS_URL"),
            topics,
            health_port: parse_var("RELAY_HEALTH_PORT", defaults.health_port)?,
            send_timeout: millis_var("RELAY_SEND_TIMEOUT_MS", defaults.send_timeout)?,
            handler_timeout: millis_var("RELAY_HANDLER_TIMEOUT_MS", defaults.handler_timeout)?,
            drain_timeout: millis_var("RELAY_DRAIN_TIMEOUT_MS", defaults.drain_timeout)?,
            failure_window: Duration::from_secs(parse_var(
                "RELAY_FAILURE_WINDOW_SECS",
                defaults.failure_window.as_secs(),
            )?),
            send_retry,
            subscribe_retry,
            recipients: Recipients::from_env(),
            log_dir: non_empty_var("RELAY_LOG_DIR").map(PathBuf::from),
        })
    }
}

/// Read an env var, treating empty strings as unset.
pub(crate) fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an env var, or return `default` when it is unset.
pub(crate) fn parse_var<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty_var(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn millis_var(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_var(key, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_bounded() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.topics.len(), 5);
        assert_eq!(cfg.send_timeout, Duration::from_secs(5));
        assert_eq!(cfg.send_retry.max_attempts, 3);
        assert_eq!(cfg.subscribe_retry.max_attempts, 5);
        assert!(cfg.drain_timeout < cfg.handler_timeout);
    }

    #[test]
    fn parse_var_uses_default_when_unset() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::remove_var("CALL_RELAY_TEST_UNSET") };
        assert_eq!(parse_var("CALL_RELAY_TEST_UNSET", 42u32).unwrap(), 42);
    }

    #[test]
    fn parse_var_rejects_garbage() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("CALL_RELAY_TEST_GARBAGE", "ten") };
        let err = parse_var("CALL_RELAY_TEST_GARBAGE", 1u16).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "CALL_RELAY_TEST_GARBAGE"));
    }

    #[test]
    fn empty_var_counts_as_unset() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("CALL_RELAY_TEST_EMPTY", "   ") };
        assert_eq!(non_empty_var("CALL_RELAY_TEST_EMPTY"), None);
    }

    #[test]
    fn send_retry_overrides_keep_the_preset_shape() {
        // SAFETY: no other test reads these variables.
        unsafe {
            std::env::set_var("RELAY_SEND_MAX_ATTEMPTS", "6");
            std::env::set_var("RELAY_SEND_BACKOFF_MS", "50");
        }
        let cfg = RelayConfig::from_env().unwrap();
        unsafe {
            std::env::remove_var("RELAY_SEND_MAX_ATTEMPTS");
            std::env::remove_var("RELAY_SEND_BACKOFF_MS");
        }

        assert_eq!(cfg.send_retry.max_attempts, 6);
        assert_eq!(cfg.send_retry.initial_delay, Duration::from_millis(50));
        assert_eq!(cfg.send_retry.max_delay, RetryConfig::for_senders().max_delay);
        assert_eq!(cfg.subscribe_retry, RetryConfig::for_subscription());
    }
}
