//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (for the `c8y-realtime` binary)
//!
//! [`ClientConfig`] is built once, validated eagerly and then handed to the
//! client by value. Invalid values fail construction instead of being ignored.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RealtimeError, Result};
use crate::protocol::{Advice, Credentials, CONNECTION_TYPE};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Platform address and login
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Protocol engine tuning
    #[serde(default)]
    pub realtime: ClientConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| RealtimeError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| RealtimeError::Config(format!("Failed to parse config: {e}")))
    }

    /// Default config file location (`<config dir>/c8y-realtime/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("c8y-realtime").join("config.toml"))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overlay environment variables on top of this configuration
    pub fn with_env(self) -> Self {
        self.with_vars(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary variable source.
    pub fn with_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup("C8Y_URL") {
            self.connection.url = url;
        }
        if let Some(tenant) = lookup("C8Y_TENANT") {
            self.connection.tenant = tenant;
        }
        if let Some(user) = lookup("C8Y_USER") {
            self.connection.username = user;
        }
        if let Some(password) = lookup("C8Y_PASSWORD") {
            self.connection.password = Some(password);
        }

        if let Some(val) = lookup("C8Y_REALTIME_TIMEOUT_MS") {
            if let Ok(val) = val.parse() {
                self.realtime.timeout_ms = val;
            }
        }
        if let Some(val) = lookup("C8Y_REALTIME_BUFFER") {
            if let Ok(val) = val.parse() {
                self.realtime.buffer_length = val;
            }
        }

        self
    }
}

/// Platform address and login
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Platform URL (`https://tenant.example.com` or a `wss://` endpoint)
    #[serde(default)]
    pub url: String,

    /// Tenant id
    #[serde(default)]
    pub tenant: String,

    /// Login name
    #[serde(default)]
    pub username: String,

    /// Password, usually supplied through `C8Y_PASSWORD`
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl ConnectionConfig {
    /// Build handshake credentials from this section.
    pub fn credentials(&self) -> Result<Credentials> {
        let password = self
            .password
            .as_deref()
            .ok_or_else(|| RealtimeError::Config("password is not set".to_string()))?;

        let credentials = Credentials::new(&self.tenant, &self.username, password);
        credentials.validate()?;
        Ok(credentials)
    }
}

/// Protocol engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bound on every correlated request (handshake, subscribe, unsubscribe)
    pub timeout_ms: u64,

    /// Capacity of the event output and the internal frame queues
    pub buffer_length: usize,

    /// Added to the server-advised connect timeout before a cycle is abandoned
    pub poll_margin_ms: u64,

    /// Bound on the best-effort disconnect sent by `stop`
    pub disconnect_timeout_ms: u64,

    /// Unit system announced in the handshake extension
    pub system_of_units: String,

    /// Long-poll timeout requested in the handshake advice
    pub advice_timeout_ms: u64,

    /// Delay between connect cycles requested in the handshake advice
    pub advice_interval_ms: u64,

    /// Connection types offered during the handshake
    pub supported_connection_types: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            buffer_length: 64,
            poll_margin_ms: 5_000,
            disconnect_timeout_ms: 1_000,
            system_of_units: "metric".to_string(),
            advice_timeout_ms: 60_000,
            advice_interval_ms: 0,
            supported_connection_types: vec![CONNECTION_TYPE.to_string()],
        }
    }
}

impl ClientConfig {
    /// Set the correlated request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the event buffer capacity
    pub fn with_buffer_length(mut self, buffer_length: usize) -> Self {
        self.buffer_length = buffer_length;
        self
    }

    /// Set the safety margin added to the connect timeout
    pub fn with_poll_margin(mut self, margin: Duration) -> Self {
        self.poll_margin_ms = margin.as_millis() as u64;
        self
    }

    /// Set the disconnect bound used by `stop`
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the requested long-poll advice
    pub fn with_advice(mut self, timeout: Duration, interval: Duration) -> Self {
        self.advice_timeout_ms = timeout.as_millis() as u64;
        self.advice_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the unit system
    pub fn with_system_of_units(mut self, units: &str) -> Self {
        self.system_of_units = units.to_string();
        self
    }

    /// Correlated request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Safety margin for connect cycles
    pub fn poll_margin(&self) -> Duration {
        Duration::from_millis(self.poll_margin_ms)
    }

    /// Disconnect bound
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// Advice sent with handshake and connect requests
    pub fn advice(&self) -> Advice {
        Advice::new(self.advice_timeout_ms, self.advice_interval_ms)
    }

    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(RealtimeError::Config("timeout_ms must be positive".into()));
        }
        if self.buffer_length == 0 {
            return Err(RealtimeError::Config(
                "buffer_length must be positive".into(),
            ));
        }
        if self.disconnect_timeout_ms == 0 {
            return Err(RealtimeError::Config(
                "disconnect_timeout_ms must be positive".into(),
            ));
        }
        if self.advice_timeout_ms == 0 && self.poll_margin_ms == 0 {
            return Err(RealtimeError::Config(
                "advice_timeout_ms and poll_margin_ms cannot both be zero".into(),
            ));
        }
        if self.system_of_units.trim().is_empty() {
            return Err(RealtimeError::Config(
                "system_of_units must not be empty".into(),
            ));
        }
        if self.supported_connection_types.is_empty() {
            return Err(RealtimeError::Config(
                "supported_connection_types must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.realtime.timeout(), Duration::from_secs(5));
        assert_eq!(config.realtime.buffer_length, 64);
        assert_eq!(config.realtime.supported_connection_types, vec!["websocket"]);
        assert!(config.realtime.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [connection]
            url = "https://acme.example.com"
            tenant = "t100"
            username = "alice"

            [realtime]
            timeout_ms = 2500
            buffer_length = 8
            system_of_units = "imperial"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.connection.url, "https://acme.example.com");
        assert_eq!(config.connection.tenant, "t100");
        assert!(config.connection.password.is_none());
        assert_eq!(config.realtime.timeout_ms, 2500);
        assert_eq!(config.realtime.buffer_length, 8);
        assert_eq!(config.realtime.system_of_units, "imperial");
        // Unset fields keep their defaults
        assert_eq!(config.realtime.poll_margin_ms, 5_000);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[realtime]\ntimeout_ms = 750").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.realtime.timeout_ms, 750);

        let missing = Config::from_file("/nonexistent/c8y-realtime.toml");
        assert!(matches!(missing, Err(RealtimeError::Config(_))));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("C8Y_URL", "wss://env.example.com"),
            ("C8Y_TENANT", "t7"),
            ("C8Y_USER", "bob"),
            ("C8Y_PASSWORD", "secret"),
            ("C8Y_REALTIME_TIMEOUT_MS", "1200"),
            ("C8Y_REALTIME_BUFFER", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = Config::default().with_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.connection.url, "wss://env.example.com");
        assert_eq!(config.realtime.timeout_ms, 1200);
        // Unparseable values are ignored
        assert_eq!(config.realtime.buffer_length, 64);

        let credentials = config.connection.credentials().unwrap();
        assert_eq!(credentials.tenant(), "t7");
    }

    #[test]
    fn test_credentials_require_password() {
        let connection = ConnectionConfig {
            tenant: "t1".into(),
            username: "alice".into(),
            ..Default::default()
        };
        assert!(matches!(
            connection.credentials(),
            Err(RealtimeError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_invalid_values() {
        assert!(ClientConfig::default().with_buffer_length(0).validate().is_err());
        assert!(ClientConfig::default()
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(ClientConfig::default()
            .with_system_of_units(" ")
            .validate()
            .is_err());

        let no_types = ClientConfig {
            supported_connection_types: Vec::new(),
            ..Default::default()
        };
        assert!(no_types.validate().is_err());
    }
}
