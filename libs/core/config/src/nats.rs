use crate::{env_or_default, env_parse_or, env_required, ConfigError, FromEnv};
use std::time::Duration;

/// NATS JetStream ingestion configuration
#[derive(Clone, Debug)]
pub struct NatsConfig {
    /// Master switch; a disabled worker never touches the broker
    pub enabled: bool,
    pub url: String,
    pub client_name: String,
    /// Stream holding the GitHub/GitLab activity subjects
    pub stream_name: String,
    /// How far back a freshly created consumer starts reading
    pub replay_window_days: u32,
    /// Durable consumer name prefix; `None` means ephemeral consumers
    pub durable_prefix: Option<String>,
    pub ack_wait: Duration,
    pub max_ack_pending: i64,
    /// Seed delay of the reconnect backoff
    pub reconnect_delay: Duration,
    /// Upper bound of a single reconnect backoff step
    pub reconnect_max_delay: Duration,
    pub request_timeout: Duration,
    /// Bound on draining setup/teardown tasks during shutdown
    pub shutdown_timeout: Duration,
}

impl NatsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_durable_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.durable_prefix = Some(prefix.into());
        self
    }

    pub fn with_stream_name(mut self, stream_name: impl Into<String>) -> Self {
        self.stream_name = stream_name.into();
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration, max_delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self.reconnect_max_delay = max_delay;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "nats://localhost:4222".to_string(),
            client_name: "github-ingest".to_string(),
            stream_name: "github".to_string(),
            replay_window_days: 7,
            durable_prefix: None,
            ack_wait: Duration::from_secs(60),
            max_ack_pending: 500,
            reconnect_delay: Duration::from_millis(2_000),
            reconnect_max_delay: Duration::from_millis(60_000),
            request_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl FromEnv for NatsConfig {
    /// NATS_URL is required once NATS_ENABLED is true, everything else has a default
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let enabled = parse_flag("NATS_ENABLED")?;

        let url = if enabled {
            env_required("NATS_URL")?
        } else {
            env_or_default("NATS_URL", &defaults.url)
        };

        let durable_prefix = std::env::var("NATS_DURABLE_CONSUMER_PREFIX")
            .ok()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            enabled,
            url,
            client_name: env_or_default("NATS_CLIENT_NAME", &defaults.client_name),
            stream_name: env_or_default("NATS_STREAM_NAME", &defaults.stream_name),
            replay_window_days: env_parse_or(
                "NATS_CONSUMER_REPLAY_DAYS",
                defaults.replay_window_days,
            )?,
            durable_prefix,
            ack_wait: Duration::from_secs(env_parse_or("NATS_CONSUMER_ACK_WAIT_SECS", 60)?),
            max_ack_pending: env_parse_or(
                "NATS_CONSUMER_MAX_ACK_PENDING",
                defaults.max_ack_pending,
            )?,
            reconnect_delay: Duration::from_millis(env_parse_or("NATS_RECONNECT_DELAY_MS", 2_000)?),
            reconnect_max_delay: Duration::from_millis(env_parse_or(
                "NATS_RECONNECT_MAX_DELAY_MS",
                60_000,
            )?),
            request_timeout: Duration::from_secs(env_parse_or("NATS_REQUEST_TIMEOUT_SECS", 60)?),
            shutdown_timeout: Duration::from_secs(env_parse_or("NATS_SHUTDOWN_TIMEOUT_SECS", 10)?),
        })
    }
}

fn parse_flag(key: &str) -> Result<bool, ConfigError> {
    let raw = env_or_default(key, "false");
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::ParseError {
            key: key.to_string(),
            details: format!("'{}' is not a boolean", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_VARS: [&str; 12] = [
        "NATS_ENABLED",
        "NATS_URL",
        "NATS_CLIENT_NAME",
        "NATS_STREAM_NAME",
        "NATS_CONSUMER_REPLAY_DAYS",
        "NATS_DURABLE_CONSUMER_PREFIX",
        "NATS_CONSUMER_ACK_WAIT_SECS",
        "NATS_CONSUMER_MAX_ACK_PENDING",
        "NATS_RECONNECT_DELAY_MS",
        "NATS_RECONNECT_MAX_DELAY_MS",
        "NATS_REQUEST_TIMEOUT_SECS",
        "NATS_SHUTDOWN_TIMEOUT_SECS",
    ];

    fn unset_all() -> Vec<(&'static str, Option<&'static str>)> {
        ALL_VARS.iter().map(|k| (*k, None)).collect()
    }

    #[test]
    fn test_nats_config_disabled_defaults() {
        temp_env::with_vars(unset_all(), || {
            let config = NatsConfig::from_env().unwrap();
            assert!(!config.enabled);
            assert_eq!(config.url, "nats://localhost:4222");
            assert_eq!(config.stream_name, "github");
            assert_eq!(config.replay_window_days, 7);
            assert!(config.durable_prefix.is_none());
            assert_eq!(config.ack_wait, Duration::from_secs(60));
            assert_eq!(config.max_ack_pending, 500);
        });
    }

    #[test]
    fn test_nats_config_enabled_requires_url() {
        let mut vars = unset_all();
        vars.retain(|(k, _)| *k != "NATS_ENABLED");
        vars.push(("NATS_ENABLED", Some("true")));
        temp_env::with_vars(vars, || {
            let err = NatsConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("NATS_URL"));
            assert!(err.to_string().contains("required"));
        });
    }

    #[test]
    fn test_nats_config_from_env_overrides() {
        temp_env::with_vars(
            [
                ("NATS_ENABLED", Some("1")),
                ("NATS_URL", Some("nats://broker:4222")),
                ("NATS_DURABLE_CONSUMER_PREFIX", Some("  ingest ")),
                ("NATS_CONSUMER_REPLAY_DAYS", Some("3")),
                ("NATS_CONSUMER_ACK_WAIT_SECS", Some("15")),
                ("NATS_CONSUMER_MAX_ACK_PENDING", Some("42")),
                ("NATS_RECONNECT_DELAY_MS", Some("250")),
            ],
            || {
                let config = NatsConfig::from_env().unwrap();
                assert!(config.enabled);
                assert_eq!(config.url, "nats://broker:4222");
                assert_eq!(config.durable_prefix.as_deref(), Some("ingest"));
                assert_eq!(config.replay_window_days, 3);
                assert_eq!(config.ack_wait, Duration::from_secs(15));
                assert_eq!(config.max_ack_pending, 42);
                assert_eq!(config.reconnect_delay, Duration::from_millis(250));
            },
        );
    }

    #[test]
    fn test_nats_config_blank_prefix_is_ephemeral() {
        temp_env::with_var("NATS_DURABLE_CONSUMER_PREFIX", Some("   "), || {
            let config = NatsConfig::from_env().unwrap();
            assert!(config.durable_prefix.is_none());
        });
    }

    #[test]
    fn test_nats_config_invalid_flag() {
        temp_env::with_var("NATS_ENABLED", Some("maybe"), || {
            let err = NatsConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("NATS_ENABLED"));
        });
    }

    #[test]
    fn test_nats_config_builder() {
        let config = NatsConfig::new("nats://example:4222")
            .with_durable_prefix("hephaestus")
            .with_stream_name("events")
            .with_ack_wait(Duration::from_secs(5));

        assert_eq!(config.url, "nats://example:4222");
        assert_eq!(config.durable_prefix.as_deref(), Some("hephaestus"));
        assert_eq!(config.stream_name, "events");
        assert_eq!(config.ack_wait, Duration::from_secs(5));
    }
}
