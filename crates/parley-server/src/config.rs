//! Runtime configuration derived from [`ParleySettings`].

use std::time::Duration;

use parley_settings::{DuplicateDevicePolicy, ParleySettings};

use crate::heartbeat::{HeartbeatConfig, HeartbeatError};

/// Upper bound for `?limit=` on history requests.
pub const MAX_HISTORY_LIMIT: usize = 200;

/// Per-connection tuning.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionConfig {
    /// Outbound queue slots; a full queue gets the connection evicted.
    pub queue_capacity: usize,
    /// Deadline for a single frame write.
    pub write_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    /// Join every queued payload into one newline-separated frame.
    pub coalesce_frames: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            write_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            coalesce_frames: true,
        }
    }
}

/// Registry actor settings.
#[derive(Clone, Copy, Debug)]
pub struct HubConfig {
    /// Commands queued before callers wait.
    pub command_buffer: usize,
    /// What to do when one user connects twice with the same device label.
    pub duplicate_policy: DuplicateDevicePolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_buffer: 1024,
            duplicate_policy: DuplicateDevicePolicy::Allow,
        }
    }
}

/// Configuration for the parley server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// `0` asks the OS for a free port.
    pub port: u16,
    /// Largest inbound WebSocket message.
    pub max_message_size: usize,
    /// Largest message body accepted by `POST /api/chat/messages`, in bytes.
    pub max_content_len: usize,
    /// History page size when `?limit=` is absent.
    pub history_limit: usize,
    /// Slots for the in-process broker.
    pub broker_buffer: usize,
    /// How long shutdown waits for background tasks.
    pub shutdown_timeout: Duration,
    pub connection: ConnectionConfig,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 4096,
            max_content_len: 4000,
            history_limit: 50,
            broker_buffer: 4096,
            shutdown_timeout: Duration::from_secs(10),
            connection: ConnectionConfig::default(),
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ParleySettings) -> Result<Self, HeartbeatError> {
        let c = &settings.connection;
        let heartbeat = HeartbeatConfig::new(
            Duration::from_millis(c.ping_interval_ms),
            Duration::from_millis(c.pong_timeout_ms),
        )?;
        Ok(Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_message_size: settings.server.max_message_size,
            max_content_len: settings.server.max_content_len,
            history_limit: settings.server.history_limit.min(MAX_HISTORY_LIMIT),
            broker_buffer: settings.broker.buffer,
            connection: ConnectionConfig {
                queue_capacity: c.queue_capacity,
                write_timeout: Duration::from_millis(c.write_timeout_ms),
                heartbeat,
                coalesce_frames: c.coalesce_frames,
            },
            hub: HubConfig {
                command_buffer: settings.hub.command_buffer,
                duplicate_policy: settings.hub.duplicate_device_policy,
            },
            ..Self::default()
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_default_settings() {
        let cfg = ServerConfig::from_settings(&ParleySettings::default()).unwrap();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8080");
        assert_eq!(cfg.connection.queue_capacity, 256);
        assert_eq!(cfg.connection.write_timeout, Duration::from_secs(10));
        assert_eq!(cfg.connection.heartbeat.pong_timeout(), Duration::from_secs(60));
        assert!(cfg.connection.coalesce_frames);
        assert_eq!(cfg.hub.duplicate_policy, DuplicateDevicePolicy::Allow);
    }

    #[test]
    fn history_limit_is_capped() {
        let mut settings = ParleySettings::default();
        settings.server.history_limit = 10_000;
        let cfg = ServerConfig::from_settings(&settings).unwrap();
        assert_eq!(cfg.history_limit, MAX_HISTORY_LIMIT);
    }

    #[test]
    fn bad_heartbeat_rejected() {
        let mut settings = ParleySettings::default();
        settings.connection.ping_interval_ms = 70_000;
        assert!(ServerConfig::from_settings(&settings).is_err());
    }

    #[test]
    fn default_binds_loopback_ephemeral() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }
}
