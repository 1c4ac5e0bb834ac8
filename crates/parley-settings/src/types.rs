//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every section carries
//! `#[serde(default)]`, so a settings file only needs the keys it changes.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    /// HTTP listener and request limits.
    pub server: ServerSettings,
    /// Per-connection queue and heartbeat tuning.
    pub connection: ConnectionSettings,
    /// Registry actor settings.
    pub hub: HubSettings,
    /// Broker settings.
    pub broker: BrokerSettings,
    /// Token verification.
    pub auth: AuthSettings,
    /// Message store.
    pub store: StoreSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl ParleySettings {
    /// Reject combinations the delivery core cannot run with.
    pub fn validate(&self) -> Result<()> {
        let c = &self.connection;
        if c.queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.queueCapacity must be non-zero".into(),
            ));
        }
        if c.ping_interval_ms == 0 || c.ping_interval_ms >= c.pong_timeout_ms {
            return Err(SettingsError::InvalidValue(format!(
                "connection.pingIntervalMs ({}) must be non-zero and shorter than pongTimeoutMs ({})",
                c.ping_interval_ms, c.pong_timeout_ms
            )));
        }
        if c.write_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.writeTimeoutMs must be non-zero".into(),
            ));
        }
        if self.hub.command_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.commandBuffer must be non-zero".into(),
            ));
        }
        if self.broker.buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "broker.buffer must be non-zero".into(),
            ));
        }
        if self.auth.jwt_secret.is_empty() {
            return Err(SettingsError::InvalidValue("auth.jwtSecret is required".into()));
        }
        if self.server.history_limit == 0 {
            return Err(SettingsError::InvalidValue(
                "server.historyLimit must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (`0` picks a free port).
    pub port: u16,
    /// Largest inbound WebSocket frame accepted from a client.
    pub max_message_size: usize,
    /// Longest message body accepted by `POST /api/chat/messages`.
    pub max_content_len: usize,
    /// Default page size for conversation history.
    pub history_limit: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_size: 4096,
            max_content_len: 4000,
            history_limit: 50,
        }
    }
}

/// Per-connection tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Capacity of each connection's outbound queue.
    pub queue_capacity: usize,
    /// Upper bound on a single frame write.
    pub write_timeout_ms: u64,
    /// Interval between server pings.
    pub ping_interval_ms: u64,
    /// Read deadline; extended by every pong.
    pub pong_timeout_ms: u64,
    /// Join queued payloads into one frame per flush.
    pub coalesce_frames: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            write_timeout_ms: 10_000,
            ping_interval_ms: 54_000,
            pong_timeout_ms: 60_000,
            coalesce_frames: true,
        }
    }
}

/// What to do when a user opens a second connection with the same device label.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateDevicePolicy {
    /// Keep both connections.
    #[default]
    Allow,
    /// Evict the older connection.
    Replace,
}

/// Registry actor settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Capacity of the registry command channel.
    pub command_buffer: usize,
    /// Same-device reconnect handling.
    pub duplicate_device_policy: DuplicateDevicePolicy,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            command_buffer: 1024,
            duplicate_device_policy: DuplicateDevicePolicy::Allow,
        }
    }
}

/// Broker settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Redis url (`redis://host:port/db`) shared by every server process.
    /// Unset means an in-process broker: live delivery stays on this process.
    pub url: Option<String>,
    /// Messages buffered per subscriber before it starts lagging
    /// (in-process broker only).
    pub buffer: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: None,
            buffer: 4096,
        }
    }
}

/// Token verification settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 signing secret.
    pub jwt_secret: String,
    /// Lifetime of tokens minted by `parley issue-token`.
    pub token_ttl_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me".to_string(),
            token_ttl_secs: 86_400,
        }
    }
}

/// Message store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// SQLite file, relative paths resolve against the parley home directory.
    pub db_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: "parley.db".to_string(),
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ParleySettings::default().validate().unwrap();
    }

    #[test]
    fn ping_must_be_shorter_than_pong() {
        let mut settings = ParleySettings::default();
        settings.connection.ping_interval_ms = 60_000;
        settings.connection.pong_timeout_ms = 60_000;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("pingIntervalMs"));
    }

    #[test]
    fn zero_queue_rejected() {
        let mut settings = ParleySettings::default();
        settings.connection.queue_capacity = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn empty_secret_rejected() {
        let mut settings = ParleySettings::default();
        settings.auth.jwt_secret.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn default_ping_is_nine_tenths_of_pong() {
        let c = ConnectionSettings::default();
        assert_eq!(c.ping_interval_ms, c.pong_timeout_ms * 9 / 10);
    }

    #[test]
    fn policy_wire_names() {
        let json = serde_json::to_string(&DuplicateDevicePolicy::Replace).unwrap();
        assert_eq!(json, "\"replace\"");
        let back: DuplicateDevicePolicy = serde_json::from_str("\"allow\"").unwrap();
        assert_eq!(back, DuplicateDevicePolicy::Allow);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: ParleySettings =
            serde_json::from_str(r#"{"hub": {"duplicateDevicePolicy": "replace"}}"#).unwrap();
        assert_eq!(
            settings.hub.duplicate_device_policy,
            DuplicateDevicePolicy::Replace
        );
        assert_eq!(settings.hub.command_buffer, 1024);
        assert_eq!(settings.connection.queue_capacity, 256);
    }
}
