//! Configuration Module
//!
//! Environment-driven configuration for the gateway, its upstream bridges and
//! the fallback poller.

mod settings;

pub use settings::{
    ClientSettings, ConfigError, GatewayConfig, PollerSettings, ServerSettings, UpstreamSettings,
};
