//! Server configuration.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use waterparty_hub::HubConfig;

use crate::backend::DEFAULT_HISTORY_RETENTION;
use crate::error::ConfigError;

/// Configuration for the waterparty server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `8080`, `0` for auto-assign).
    pub port: u16,
    /// How long shutdown waits for background tasks.
    pub shutdown_timeout_secs: u64,
    /// Chat messages the in-memory backend keeps per chat.
    pub history_retention: usize,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            shutdown_timeout_secs: 10,
            history_retention: DEFAULT_HISTORY_RETENTION,
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `PORT`, `HOST` and the `WP_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(host) = lookup("HOST") {
            let host = host.trim();
            if !host.is_empty() {
                cfg.host = host.to_string();
            }
        }
        override_parsed(&lookup, "PORT", &mut cfg.port)?;
        override_parsed(&lookup, "WP_SHUTDOWN_TIMEOUT_SECS", &mut cfg.shutdown_timeout_secs)?;
        override_parsed(&lookup, "WP_HISTORY_RETENTION", &mut cfg.history_retention)?;
        override_parsed(&lookup, "WP_MAILBOX_CAPACITY", &mut cfg.hub.mailbox_capacity)?;
        override_parsed(&lookup, "WP_MAX_FRAME_SIZE", &mut cfg.hub.max_frame_size)?;
        override_parsed(&lookup, "WP_PONG_WAIT_SECS", &mut cfg.hub.pong_wait_secs)?;
        override_parsed(&lookup, "WP_PING_PERIOD_SECS", &mut cfg.hub.ping_period_secs)?;
        override_parsed(&lookup, "WP_WRITE_WAIT_SECS", &mut cfg.hub.write_wait_secs)?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hub.validate()?;
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn override_parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    slot: &mut T,
) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(());
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    *slot = trimmed.parse().map_err(|e: T::Err| ConfigError::InvalidVar {
        var: var.to_string(),
        value: raw.clone(),
        reason: e.to_string(),
    })?;
    Ok(())
}
