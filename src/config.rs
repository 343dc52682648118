//! Session configuration.
//! Durations are (de)serialized as seconds so configs stay readable in JSON.

use crate::error::{Result, SessionError};
use crate::supervisor::Supervisor;
use crate::tuya::Version;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_PORT: u16 = 6668;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(7);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_MALFORMED_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    #[default]
    Tuya,
    Powermax,
}

/// Delay growth between command retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Every attempt waits `command_timeout`.
    #[default]
    Fixed,
    /// Attempt `n` waits `n * command_timeout`.
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub device_id: String,
    pub address: String,
    pub port: u16,
    pub local_key: String,
    pub protocol: ProtocolKind,
    pub version: String,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    #[serde(with = "secs")]
    pub handshake_timeout: Duration,
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
    #[serde(with = "secs")]
    pub command_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Backoff,
    #[serde(with = "secs")]
    pub reconnect_interval: Duration,
    /// Consecutive failed reconnects before giving up; unlimited when absent.
    pub max_reconnect_attempts: Option<u32>,
    /// Consecutive malformed frames tolerated before the link is dropped.
    pub malformed_threshold: u32,
    #[serde(with = "opt_secs")]
    pub poll_interval: Option<Duration>,
    pub request_status_on_connect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            address: String::new(),
            port: DEFAULT_PORT,
            local_key: String::new(),
            protocol: ProtocolKind::Tuya,
            version: Version::V3_3.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Backoff::Fixed,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: None,
            malformed_threshold: DEFAULT_MALFORMED_THRESHOLD,
            poll_interval: None,
            request_status_on_connect: true,
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(SessionError::Config("device_id must not be empty".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(SessionError::Config(
                "heartbeat_interval must be positive".into(),
            ));
        }
        if self.idle_timeout <= self.heartbeat_interval {
            return Err(SessionError::Config(format!(
                "idle_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.idle_timeout, self.heartbeat_interval
            )));
        }
        if self.command_timeout.is_zero() {
            return Err(SessionError::Config("command_timeout must be positive".into()));
        }
        if self.protocol == ProtocolKind::Tuya {
            self.version.parse::<Version>()?;
            if self.local_key.len() != 16 {
                return Err(SessionError::Config(format!(
                    "local_key must be 16 bytes, got {}",
                    self.local_key.len()
                )));
            }
        }
        Ok(())
    }

    pub fn key_bytes(&self) -> Vec<u8> {
        self.local_key.as_bytes().to_vec()
    }
}

/// Fluent construction of a [`SessionConfig`] and its [`Supervisor`].
#[derive(Debug, Clone, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new<I, K>(device_id: I, local_key: K) -> Self
    where
        I: Into<String>,
        K: Into<String>,
    {
        Self {
            config: SessionConfig {
                device_id: device_id.into(),
                local_key: local_key.into(),
                ..SessionConfig::default()
            },
        }
    }

    pub fn address<A: Into<String>>(mut self, address: A) -> Self {
        self.config.address = address.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn protocol(mut self, protocol: ProtocolKind) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn version<V: ToString>(mut self, version: V) -> Self {
        self.config.version = version.to_string();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    pub fn retries(mut self, max_retries: u32, backoff: Backoff) -> Self {
        self.config.max_retries = max_retries;
        self.config.retry_backoff = backoff;
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.reconnect_interval = interval;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn malformed_threshold(mut self, threshold: u32) -> Self {
        self.config.malformed_threshold = threshold;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = Some(interval);
        self
    }

    pub fn request_status_on_connect(mut self, enabled: bool) -> Self {
        self.config.request_status_on_connect = enabled;
        self
    }

    /// Returns the validated configuration.
    pub fn config(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Spawns the session over TCP. Must be called within a tokio runtime.
    pub fn build(self) -> Result<Supervisor> {
        Supervisor::new(self.config()?)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_json_with_defaults() {
        let config = SessionConfig::from_json(
            r#"{
                "device_id": "bf01",
                "address": "192.168.1.20",
                "local_key": "0123456789abcdef",
                "version": "3.4",
                "heartbeat_interval": 5,
                "idle_timeout": 12.5,
                "retry_backoff": "linear",
                "poll_interval": 60
            }"#,
        )
        .unwrap();
        assert_eq!(config.port, 6668);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_millis(12_500));
        assert_eq!(config.retry_backoff, Backoff::Linear);
        assert_eq!(config.poll_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.max_reconnect_attempts, None);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn idle_timeout_must_exceed_heartbeat() {
        let err = SessionBuilder::new("bf01", "0123456789abcdef")
            .heartbeat_interval(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(10))
            .config()
            .unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn tuya_requires_sixteen_byte_key() {
        assert!(SessionBuilder::new("bf01", "short").config().is_err());
        assert!(SessionBuilder::new("bf01", "DEVICE_KEY_16BYTE").config().is_err());
        let config = SessionBuilder::new("DEVICE_ID", "0123456789abcdef")
            .address("192.168.1.20")
            .version("3.4")
            .config()
            .unwrap();
        assert_eq!(config.key_bytes().len(), 16);
        assert!(SessionBuilder::new("bf01", "0123456789abcdef")
            .version("3.2")
            .config()
            .is_err());
        let panel = SessionBuilder::new("panel", "")
            .protocol(ProtocolKind::Powermax)
            .config()
            .unwrap();
        assert_eq!(panel.protocol, ProtocolKind::Powermax);
    }

    #[test]
    fn rejects_negative_durations() {
        let json = r#"{"device_id": "x", "local_key": "0123456789abcdef", "command_timeout": -1}"#;
        assert!(matches!(
            SessionConfig::from_json(json),
            Err(SessionError::Json(_))
        ));
    }

    #[test]
    fn serializes_durations_as_seconds() {
        let config = SessionBuilder::new("bf01", "0123456789abcdef")
            .poll_interval(Duration::from_secs(30))
            .config()
            .unwrap();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["heartbeat_interval"], 7.0);
        assert_eq!(value["poll_interval"], 30.0);
        assert_eq!(value["protocol"], "tuya");
    }
}
