//! Settings type definitions.
//!
//! All types use camelCase JSON and `#[serde(default)]`, so a partial file
//! only needs to name the values it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwitchboardSettings {
    /// Network and connection settings.
    pub server: ServerSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl SwitchboardSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()
    }
}

/// Routes the server always serves besides the WebSocket endpoint.
const RESERVED_PATHS: [&str; 2] = ["/health", "/metrics"];

/// Server network and per-connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (0 = OS-assigned).
    pub port: u16,
    /// Path of the WebSocket endpoint.
    pub endpoint: String,
    /// Maximum number of concurrently open connections.
    pub max_connections: usize,
    /// Heartbeat interval and read deadline in seconds (0 = disabled).
    pub keepalive_secs: u64,
    /// Largest inbound message accepted by the transport, in bytes.
    pub max_message_size: usize,
    /// Accepted `Origin` header values (empty = any).
    pub allowed_origins: Vec<String>,
    /// Whether connections are tracked in the shared registry.
    pub registry_enabled: bool,
    /// Capacity of each connection's unhandled-update stream.
    pub unhandled_buffer: usize,
    /// Capacity of each connection's error-report stream.
    pub error_buffer: usize,
    /// Upper bound for closing a transport, in milliseconds.
    pub close_timeout_ms: u64,
    /// Optional payload-encryption handshake requirements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionSettings>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            endpoint: "/ws".to_string(),
            max_connections: 1024,
            keepalive_secs: 0,
            max_message_size: 16 * 1024 * 1024,
            allowed_origins: Vec::new(),
            registry_enabled: true,
            unhandled_buffer: 64,
            error_buffer: 64,
            close_timeout_ms: 5_000,
            encryption: None,
        }
    }
}

impl ServerSettings {
    /// Keepalive as a duration, `None` when disabled.
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }

    /// Transport close timeout.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether `origin` passes the allow-list.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        origin.is_some_and(|o| self.allowed_origins.iter().any(|a| a == o))
    }

    fn validate(&self) -> Result<()> {
        if !self.endpoint.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "endpoint must start with '/': {}",
                self.endpoint
            )));
        }
        if RESERVED_PATHS.contains(&self.endpoint.as_str()) {
            return Err(SettingsError::InvalidValue(format!(
                "endpoint collides with a built-in route: {}",
                self.endpoint
            )));
        }
        if self.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "maxConnections must be at least 1".to_string(),
            ));
        }
        // broadcast channels panic on zero capacity
        if self.unhandled_buffer == 0 || self.error_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "unhandledBuffer and errorBuffer must be at least 1".to_string(),
            ));
        }
        if let Some(enc) = &self.encryption {
            if enc.method != "rsa-aes" {
                return Err(SettingsError::InvalidValue(format!(
                    "unsupported encryption method: {}",
                    enc.method
                )));
            }
        }
        Ok(())
    }
}

/// Encryption handshake settings.
///
/// Only the handshake requirement is enforced; payloads are never encrypted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncryptionSettings {
    /// Encryption scheme name.
    pub method: String,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            method: "rsa-aes".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(ServerSettings::default()).unwrap();
        assert_eq!(json["maxConnections"], 1024);
        assert_eq!(json["keepaliveSecs"], 0);
        assert_eq!(json["registryEnabled"], true);
        assert!(json.get("encryption").is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: SwitchboardSettings =
            serde_json::from_str(r#"{"server": {"port": 9000}}"#).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.endpoint, "/ws");
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn encryption_section_defaults_method() {
        let settings: ServerSettings = serde_json::from_str(r#"{"encryption": {}}"#).unwrap();
        assert_eq!(settings.encryption, Some(EncryptionSettings::default()));
    }

    #[test]
    fn keepalive_zero_is_disabled() {
        let mut settings = ServerSettings::default();
        assert_eq!(settings.keepalive(), None);
        settings.keepalive_secs = 15;
        assert_eq!(settings.keepalive(), Some(Duration::from_secs(15)));
    }

    #[test]
    fn origin_allow_list() {
        let mut settings = ServerSettings::default();
        assert!(settings.origin_allowed(None));
        assert!(settings.origin_allowed(Some("https://evil.example")));

        settings.allowed_origins = vec!["https://app.example".to_string()];
        assert!(settings.origin_allowed(Some("https://app.example")));
        assert!(!settings.origin_allowed(Some("https://evil.example")));
        assert!(!settings.origin_allowed(None));
    }

    #[test]
    fn bind_addr_joins_host_and_port() {
        let settings = ServerSettings::default();
        assert_eq!(settings.bind_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut settings = SwitchboardSettings::default();
        settings.server.endpoint = "ws".to_string();
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(_)));

        let mut settings = SwitchboardSettings::default();
        settings.server.endpoint = "/health".to_string();
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(msg)) if msg.contains("built-in"));

        let mut settings = SwitchboardSettings::default();
        settings.server.error_buffer = 0;
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(_)));

        let mut settings = SwitchboardSettings::default();
        settings.server.encryption = Some(EncryptionSettings {
            method: "rot13".to_string(),
        });
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(msg)) if msg.contains("rot13"));
    }
}
