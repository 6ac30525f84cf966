//! Gateway Configuration Settings
//!
//! Configuration types for the tick gateway, loaded from environment variables.
//! Every variable is optional; unparsable values fall back to the default.

use std::time::Duration;

use crate::infrastructure::kis::auth::DEFAULT_REST_URL;
use crate::infrastructure::kis::bridge::DEFAULT_WS_URL;
use crate::infrastructure::kis::{BridgeConfig, HeartbeatConfig, ReconnectConfig};
use crate::infrastructure::quotes::DEFAULT_QUOTE_URL;

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Client WebSocket port.
    pub ws_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_port: 8000,
            health_port: 8082,
        }
    }
}

/// Per-client connection settings.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Interval between server-initiated `ping` frames.
    pub heartbeat_interval: Duration,
    /// Outbound messages buffered per connection before dropping.
    pub queue_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            queue_capacity: 256,
        }
    }
}

/// Upstream KIS connection settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Real-time WebSocket URL.
    pub ws_url: String,
    /// REST base URL used for approval keys.
    pub rest_url: String,
    /// Interval between WebSocket pings.
    pub ping_interval: Duration,
    /// Silence tolerated before the connection is considered dead.
    pub idle_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Consecutive failures before a session is reported failed (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Pause between replayed subscriptions after a reconnect.
    pub resubscribe_delay: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        let reconnect = ReconnectConfig::default();
        let heartbeat = HeartbeatConfig::default();
        let bridge = BridgeConfig::default();
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            rest_url: DEFAULT_REST_URL.to_string(),
            ping_interval: heartbeat.ping_interval,
            idle_timeout: heartbeat.idle_timeout,
            reconnect_delay_initial: reconnect.initial_delay,
            reconnect_delay_max: reconnect.max_delay,
            reconnect_delay_multiplier: reconnect.multiplier,
            max_reconnect_attempts: reconnect.max_attempts,
            resubscribe_delay: bridge.resubscribe_delay,
        }
    }
}

impl UpstreamSettings {
    /// Build the bridge configuration shared by every user session.
    #[must_use]
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            url: self.ws_url.clone(),
            reconnect: ReconnectConfig {
                initial_delay: self.reconnect_delay_initial,
                max_delay: self.reconnect_delay_max,
                multiplier: self.reconnect_delay_multiplier,
                max_attempts: self.max_reconnect_attempts,
                ..ReconnectConfig::default()
            },
            heartbeat: HeartbeatConfig {
                ping_interval: self.ping_interval,
                idle_timeout: self.idle_timeout,
            },
            resubscribe_delay: self.resubscribe_delay,
            ..BridgeConfig::default()
        }
    }
}

/// Fallback poller settings.
#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// Time between polling cycles.
    pub interval: Duration,
    /// Blocking fetch workers.
    pub workers: usize,
    /// Fetches allowed to wait for a worker.
    pub queue_limit: usize,
    /// Base URL of the quote source.
    pub quote_url: String,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            workers: 10,
            queue_limit: 100,
            quote_url: DEFAULT_QUOTE_URL.to_string(),
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Server port settings.
    pub server: ServerSettings,
    /// Client connection settings.
    pub client: ClientSettings,
    /// Upstream KIS settings.
    pub upstream: UpstreamSettings,
    /// Fallback poller settings.
    pub poller: PollerSettings,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value parses but cannot be used (zero workers,
    /// zero intervals, empty URLs).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`GatewayConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        let server = ServerSettings {
            ws_port: env.u16("TICK_GATEWAY_WS_PORT", ServerSettings::default().ws_port),
            health_port: env.u16(
                "TICK_GATEWAY_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let client = ClientSettings {
            heartbeat_interval: env.duration_secs(
                "TICK_GATEWAY_CLIENT_HEARTBEAT_SECS",
                ClientSettings::default().heartbeat_interval,
            ),
            queue_capacity: env.usize(
                "TICK_GATEWAY_CLIENT_QUEUE",
                ClientSettings::default().queue_capacity,
            ),
        };

        let defaults = UpstreamSettings::default();
        let upstream = UpstreamSettings {
            ws_url: env.string("KIS_WS_URL", defaults.ws_url)?,
            rest_url: env.string("KIS_REST_URL", defaults.rest_url)?,
            ping_interval: env.duration_secs("KIS_PING_INTERVAL_SECS", defaults.ping_interval),
            idle_timeout: env.duration_secs("KIS_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            reconnect_delay_initial: env.duration_secs(
                "KIS_RECONNECT_DELAY_INITIAL_SECS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.duration_secs(
                "KIS_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.f64(
                "KIS_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: env.u32(
                "KIS_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            resubscribe_delay: env.duration_millis(
                "KIS_RESUBSCRIBE_DELAY_MS",
                defaults.resubscribe_delay,
            ),
        };

        let defaults = PollerSettings::default();
        let poller = PollerSettings {
            interval: env.duration_millis("TICK_GATEWAY_POLL_INTERVAL_MS", defaults.interval),
            workers: env.usize("TICK_GATEWAY_FETCH_WORKERS", defaults.workers),
            queue_limit: env.usize("TICK_GATEWAY_FETCH_QUEUE", defaults.queue_limit),
            quote_url: env.string("TICK_GATEWAY_QUOTE_URL", defaults.quote_url)?,
        };

        let config = Self {
            server,
            client,
            upstream,
            poller,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poller.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TICK_GATEWAY_FETCH_WORKERS".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.poller.interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "TICK_GATEWAY_POLL_INTERVAL_MS".to_string(),
                reason: "interval must be positive".to_string(),
            });
        }
        if self.client.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "TICK_GATEWAY_CLIENT_HEARTBEAT_SECS".to_string(),
                reason: "interval must be positive".to_string(),
            });
        }
        if self.client.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TICK_GATEWAY_CLIENT_QUEUE".to_string(),
                reason: "queue must hold at least one message".to_string(),
            });
        }
        if self.upstream.ping_interval.is_zero() || self.upstream.idle_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "KIS_PING_INTERVAL_SECS/KIS_IDLE_TIMEOUT_SECS".to_string(),
                reason: "heartbeat timings must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable parsed but is out of range.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Offending variable.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = (self.lookup)(key)?;
        let parsed = raw.trim().parse().ok();
        if parsed.is_none() {
            tracing::warn!(key, value = %raw, "Ignoring unparsable setting, using default");
        }
        parsed
    }

    fn u16(&self, key: &str, default: u16) -> u16 {
        self.parsed(key).unwrap_or(default)
    }

    fn u32(&self, key: &str, default: u32) -> u32 {
        self.parsed(key).unwrap_or(default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        self.parsed(key).unwrap_or(default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.parsed::<f64>(key)
            .filter(|v| v.is_finite() && *v >= 1.0)
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.parsed::<u64>(key).map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.parsed::<u64>(key).map_or(default, Duration::from_millis)
    }

    fn string(&self, key: &str, default: String) -> Result<String, ConfigError> {
        match (self.lookup)(key) {
            None => Ok(default),
            Some(value) if value.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(value) => Ok(value.trim().to_string()),
        }
    }
}
