use crate::{env_or_default, env_parse_optional, env_required, ConfigError, FromEnv};
use std::time::Duration;

/// Message broker configuration
#[derive(Clone)]
pub struct AmqpConfig {
    pub url: String,
    /// Unacknowledged deliveries per consumer
    pub prefetch: u16,
    /// Upper bound for draining one service on shutdown (unbounded if unset)
    pub drain_timeout: Option<Duration>,
}

impl AmqpConfig {
    pub fn new(url: String) -> Self {
        Self {
            url,
            prefetch: 1,
            drain_timeout: None,
        }
    }
}

impl FromEnv for AmqpConfig {
    /// - AMQP_URL: required
    /// - AMQP_PREFETCH: defaults to 1
    /// - AMQP_DRAIN_TIMEOUT_MS: optional
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_required("AMQP_URL")?;
        let prefetch = env_or_default("AMQP_PREFETCH", "1").parse().map_err(|e| {
            ConfigError::ParseError {
                key: "AMQP_PREFETCH".to_string(),
                details: format!("{}", e),
            }
        })?;
        let drain_timeout =
            env_parse_optional::<u64>("AMQP_DRAIN_TIMEOUT_MS")?.map(Duration::from_millis);

        Ok(Self {
            url,
            prefetch,
            drain_timeout,
        })
    }
}

// Credentials stay out of the logs.
impl std::fmt::Debug for AmqpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (scheme, rest) = self.url.split_once("://").unwrap_or(("", &self.url));
        // Unescaped '@' may appear in the password, never in the host.
        let url = match rest.rsplit_once('@') {
            Some((credentials, host)) => match credentials.split_once(':') {
                Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
                None => self.url.clone(),
            },
            None => self.url.clone(),
        };

        f.debug_struct("AmqpConfig")
            .field("url", &url)
            .field("prefetch", &self.prefetch)
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}
