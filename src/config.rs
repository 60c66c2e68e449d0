//! Client configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! [listener]
//! smart_routing = true
//! registration_timeout = "120"
//! registration_timeout_unit = "SECONDS"
//! connection_refresh_interval_ms = 2000
//!
//! [invocation]
//! timeout_ms = 120000
//!
//! [logging]
//! level = "info"
//! ```

use crate::error::{HzlinkError, Result};
use crate::time_unit::{self, TimeUnit, TimeValue};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub invocation: InvocationConfig,
    pub logging: LoggingConfig,
}

/// Listener registration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Register on every member and ask for local events only. When off, the
    /// client is unisocket and receives cluster-wide events on each connection.
    pub smart_routing: bool,
    /// How long `add_listener` waits for a first confirmation.
    pub registration_timeout: TimeValue,
    pub registration_timeout_unit: TimeUnit,
    /// Cadence of the refresh sweep that retries missing registrations.
    pub connection_refresh_interval_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            smart_routing: true,
            registration_timeout: TimeValue::Int(120),
            registration_timeout_unit: TimeUnit::Seconds,
            connection_refresh_interval_ms: 2000,
        }
    }
}

impl ListenerConfig {
    pub fn registration_timeout(&self) -> Result<Duration> {
        time_unit::to_duration(
            self.registration_timeout.clone(),
            self.registration_timeout_unit,
        )
    }

    pub fn connection_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.connection_refresh_interval_ms)
    }
}

/// Per-request settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InvocationConfig {
    /// Upper bound for one request/response round-trip.
    pub timeout_ms: u64,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self { timeout_ms: 120_000 }
    }
}

impl InvocationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load and validate a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            HzlinkError::Config(msg) => {
                HzlinkError::Config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(contents).map_err(|e| HzlinkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.listener
            .registration_timeout()
            .map_err(|e| HzlinkError::Config(format!("listener.registration_timeout: {}", e)))?;
        if self.listener.connection_refresh_interval_ms == 0 {
            return Err(HzlinkError::Config(
                "listener.connection_refresh_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.invocation.timeout_ms == 0 {
            return Err(HzlinkError::Config(
                "invocation.timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
