//! Configuration validation support

use config::ConfigError;
use serde::{Deserialize, Serialize};

/// Trait for validating configuration values
pub trait ValidateConfig: Serialize + for<'de> Deserialize<'de> {
    /// Validate the configuration
    ///
    /// Returns Ok(()) if valid, or an error describing what's wrong
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Common validation helpers
pub mod validators {
    use config::ConfigError;

    /// Log levels accepted by `server.log_level`
    pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

    /// Validate that a port number is valid (1-65535)
    pub fn validate_port(port: u16, field: &str) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::Message(format!(
                "{field}: port must be between 1 and 65535"
            )));
        }
        Ok(())
    }

    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::Message(format!("{field}: cannot be empty")));
        }
        Ok(())
    }

    /// Validate that a value is within range
    pub fn validate_range<T: PartialOrd + std::fmt::Display>(
        value: T,
        min: T,
        max: T,
        field: &str,
    ) -> Result<(), ConfigError> {
        if value < min || value > max {
            return Err(ConfigError::Message(format!(
                "{field}: must be between {min} and {max}"
            )));
        }
        Ok(())
    }

    /// Validate a `host:port` pair, where host may be a name or an address
    ///
    /// IPv6 hosts must be bracketed (`[::1]:443`).
    pub fn validate_host_port(value: &str, field: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::Message(format!("{field}: expected host:port, got {value:?}"));

        let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
        let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            Some(inner) => inner,
            None if host.contains(':') => return Err(invalid()),
            None => host,
        };
        if host.is_empty() {
            return Err(invalid());
        }

        let port: u16 = port.parse().map_err(|_| invalid())?;
        validate_port(port, field)
    }

    /// Validate a log level (the bare level, not a full filter directive)
    pub fn validate_log_level(level: &str, field: &str) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&level) {
            return Err(ConfigError::Message(format!(
                "{field}: must be one of {LOG_LEVELS:?}"
            )));
        }
        Ok(())
    }
}
