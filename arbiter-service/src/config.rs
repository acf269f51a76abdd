// SPDX-License-Identifier: GPL-3.0-only

//! Daemon configuration
//!
//! Read from a TOML file; every key is optional and falls back to the
//! built-in default. Command-line flags override the file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use arbiter_broker::BrokerConfig;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{Result, ServiceError};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cosmic-ext-disk-arbiter/arbiter.toml";

const MAX_RESPONSE_TIMEOUT_SECS: u64 = 3600;
const MAX_TIMER_LEEWAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArbiterConfig {
    /// Seconds a session may take to answer an approval
    pub response_timeout_secs: u64,
    pub timer_leeway_ms: u64,
    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub log_level: String,
    pub bus: BusKind,
    /// Track disks and run commands through UDisks2
    pub enable_udisks_feed: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: 10,
            timer_leeway_ms: 500,
            log_level: "info".to_string(),
            bus: BusKind::System,
            enable_udisks_feed: true,
        }
    }
}

impl ArbiterConfig {
    /// Loads `path`, or the default location when `path` is `None`.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// file that was asked for explicitly is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };

        if !explicit && !path.exists() {
            tracing::debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|error| {
            ServiceError::Config(format!("cannot read {}: {error}", path.display()))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|error| ServiceError::Config(error.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.response_timeout_secs == 0 || self.response_timeout_secs > MAX_RESPONSE_TIMEOUT_SECS
        {
            return Err(ServiceError::Config(format!(
                "response_timeout_secs must be between 1 and {MAX_RESPONSE_TIMEOUT_SECS}"
            )));
        }

        if self.timer_leeway_ms > MAX_TIMER_LEEWAY_MS {
            return Err(ServiceError::Config(format!(
                "timer_leeway_ms must not exceed {MAX_TIMER_LEEWAY_MS}"
            )));
        }

        EnvFilter::try_new(&self.log_level).map_err(|error| {
            ServiceError::Config(format!("invalid log_level '{}': {error}", self.log_level))
        })?;

        Ok(())
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            timer_leeway: Duration::from_millis(self.timer_leeway_ms),
        }
    }

    /// Filter directive for the daemon's own crates at the configured level
    pub fn log_directive(&self) -> String {
        format!(
            "arbiter_service={level},arbiter_broker={level},warn",
            level = self.log_level
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ArbiterConfig::from_toml("").expect("parse");
        assert_eq!(config, ArbiterConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.broker_config(), BrokerConfig::default());
    }

    #[test]
    fn keys_override_defaults() {
        let config = ArbiterConfig::from_toml(
            r#"
            response_timeout_secs = 30
            timer_leeway_ms = 0
            log_level = "debug"
            bus = "session"
            enable_udisks_feed = false
            "#,
        )
        .expect("parse");

        assert_eq!(config.bus, BusKind::Session);
        assert!(!config.enable_udisks_feed);
        assert_eq!(config.broker_config().response_timeout, Duration::from_secs(30));
        assert_eq!(
            config.log_directive(),
            "arbiter_service=debug,arbiter_broker=debug,warn"
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(ArbiterConfig::from_toml("response_timeout = 5").is_err());
    }

    #[test]
    fn out_of_range_values_fail_validation() {
        let zero = ArbiterConfig {
            response_timeout_secs: 0,
            ..ArbiterConfig::default()
        };
        assert!(zero.validate().is_err());

        let leeway = ArbiterConfig {
            timer_leeway_ms: MAX_TIMER_LEEWAY_MS + 1,
            ..ArbiterConfig::default()
        };
        assert!(leeway.validate().is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let missing = Path::new("/nonexistent/cosmic-ext-disk-arbiter/arbiter.toml");
        assert!(ArbiterConfig::load(Some(missing)).is_err());
    }
}
