//! Configuration for the messaging subsystem.
//!
//! Loaded from TOML and/or `MESSAGING_*` environment variables; every field
//! has a default so an empty source is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl ConfigError {
    fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            message: message.into(),
        }
    }
}

/// Top-level messaging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Bound on a pairing attempt.
    pub connect_timeout_ms: u64,
    /// Wait after a transparent reconnect before a send re-checks.
    pub send_reconnect_grace_ms: u64,
    /// Country code used for numbers written without one.
    pub country_code: String,
    /// Local leading-zero convention replaced by the country code.
    pub trunk_prefix: String,
    /// Suffix appended to form a destination identifier.
    pub destination_suffix: String,
    /// Minimum rendered QR dimension, in pixels.
    pub qr_size: u32,
    pub reconnect: ReconnectPolicy,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 20_000,
            send_reconnect_grace_ms: 3_000,
            country_code: "92".to_string(),
            trunk_prefix: "0".to_string(),
            destination_suffix: "@s.whatsapp.net".to_string(),
            qr_size: 256,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Reconnect policy for transient drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive reconnects before the tenant is marked failed.
    pub max_attempts: u32,
    /// Symmetric jitter, as a percentage of each delay.
    pub jitter_percent: u8,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            jitter_percent: 20,
        }
    }
}

impl MessagingConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns error if the document is malformed or a value is invalid.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `MESSAGING_*` process environment variables.
    ///
    /// # Errors
    /// Returns error if a variable does not parse or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values produced by `lookup` (keyed by env variable name).
    ///
    /// # Errors
    /// Returns error if a value does not parse or the result is invalid.
    pub fn overlay(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(v) = lookup("MESSAGING_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse_number("connect_timeout_ms", &v)?;
        }
        if let Some(v) = lookup("MESSAGING_SEND_RECONNECT_GRACE_MS") {
            self.send_reconnect_grace_ms = parse_number("send_reconnect_grace_ms", &v)?;
        }
        if let Some(v) = lookup("MESSAGING_COUNTRY_CODE") {
            self.country_code = v.trim().trim_start_matches('+').to_string();
        }
        if let Some(v) = lookup("MESSAGING_TRUNK_PREFIX") {
            self.trunk_prefix = v.trim().to_string();
        }
        if let Some(v) = lookup("MESSAGING_DESTINATION_SUFFIX") {
            self.destination_suffix = v.trim().to_string();
        }
        if let Some(v) = lookup("MESSAGING_QR_SIZE") {
            self.qr_size = parse_number("qr_size", &v)?;
        }
        if let Some(v) = lookup("MESSAGING_RECONNECT_BASE_DELAY_MS") {
            self.reconnect.base_delay_ms = parse_number("reconnect.base_delay_ms", &v)?;
        }
        if let Some(v) = lookup("MESSAGING_RECONNECT_MAX_DELAY_MS") {
            self.reconnect.max_delay_ms = parse_number("reconnect.max_delay_ms", &v)?;
        }
        if let Some(v) = lookup("MESSAGING_RECONNECT_MAX_ATTEMPTS") {
            self.reconnect.max_attempts = parse_number("reconnect.max_attempts", &v)?;
        }
        if let Some(v) = lookup("MESSAGING_RECONNECT_JITTER_PERCENT") {
            self.reconnect.jitter_percent = parse_number("reconnect.jitter_percent", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// Returns the first invalid value found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::invalid("connect_timeout_ms", "must be positive"));
        }
        if self.country_code.is_empty() || !self.country_code.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::invalid(
                "country_code",
                format!("expected digits, got {:?}", self.country_code),
            ));
        }
        if !self.trunk_prefix.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::invalid(
                "trunk_prefix",
                format!("expected digits, got {:?}", self.trunk_prefix),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::invalid(
                "reconnect.max_delay_ms",
                "must not be below base_delay_ms",
            ));
        }
        if self.reconnect.jitter_percent > 100 {
            return Err(ConfigError::invalid(
                "reconnect.jitter_percent",
                "must be at most 100",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn send_reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.send_reconnect_grace_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, format!("{raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        let config = MessagingConfig::from_toml_str("").unwrap();
        assert_eq!(config, MessagingConfig::default());
        assert_eq!(config.connect_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_toml_partial_override() {
        let config = MessagingConfig::from_toml_str(
            r#"
            country_code = "44"

            [reconnect]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.country_code, "44");
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("MESSAGING_COUNTRY_CODE", "+1"),
            ("MESSAGING_CONNECT_TIMEOUT_MS", "5000"),
        ]
        .into_iter()
        .collect();
        let config = MessagingConfig::default()
            .overlay(|k| vars.get(k).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.country_code, "1");
        assert_eq!(config.connect_timeout_ms, 5_000);
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = MessagingConfig::default()
            .overlay(|k| (k == "MESSAGING_QR_SIZE").then(|| "big".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "qr_size", .. }));

        let err = MessagingConfig::from_toml_str("country_code = \"pk\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "country_code", .. }));
    }
}
