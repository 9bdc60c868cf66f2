//! Bridge configuration
//!
//! Loaded from an optional TOML file with `ELM_BRIDGE_*` environment
//! variables layered on top (e.g. `ELM_BRIDGE_BROKER_HOST=10.0.0.5`).

use crate::error::ConfigError;
use config::{Environment, File, FileFormat};
use mqtt_link::{Credentials, QosLevel, SessionSettings};
use obd_link::{LinkSettings, DEFAULT_BAUD_RATE, DEFAULT_CHANNEL};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Address shipped in sample configs; must be replaced before use
pub const PLACEHOLDER_ADDRESS: &str = "XX:XX:XX:XX:XX:XX";

/// Prefix for environment overrides
const ENV_PREFIX: &str = "ELM_BRIDGE";

/// Flat bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Adapter Bluetooth MAC (XX:XX:XX:XX:XX:XX)
    pub address: String,
    /// RFCOMM channel
    pub channel: u8,
    /// Bound RFCOMM TTY (e.g. /dev/rfcomm0); used instead of a socket when set
    pub device: Option<String>,
    /// Serial baud rate when `device` is set
    pub baud_rate: u32,
    /// Maximum chunk size read from the adapter
    pub read_buffer_size: usize,
    /// Blocking read timeout (milliseconds)
    pub read_timeout_ms: u64,
    /// Adapter and broker connect timeout (seconds)
    pub connect_timeout_seconds: u64,
    /// ELM327 commands sent after every adapter connect
    pub init_commands: Vec<String>,

    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_seconds: u64,
    /// Topic adapter data is published to
    pub data_topic: String,
    /// Topic commands are read from
    pub command_topic: String,
    /// MQTT QoS (0, 1 or 2); other values fail to deserialize
    pub qos: QosLevel,

    /// Pause between tearing down and reconnecting (seconds)
    pub reconnect_interval_seconds: u64,
    /// Health check period (milliseconds)
    pub supervise_interval_ms: u64,

    pub log_level: String,
    /// Emit JSON log lines
    pub log_json: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            address: PLACEHOLDER_ADDRESS.to_string(),
            channel: DEFAULT_CHANNEL,
            device: None,
            baud_rate: DEFAULT_BAUD_RATE,
            read_buffer_size: 1024,
            read_timeout_ms: 500,
            connect_timeout_seconds: 10,
            init_commands: Vec::new(),
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_seconds: 60,
            data_topic: "elm327/outgoing/data".to_string(),
            command_topic: "elm327/incoming/command".to_string(),
            qos: QosLevel::AtLeastOnce,
            reconnect_interval_seconds: 5,
            supervise_interval_ms: 1000,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// `elm327-bridge-` followed by 8 random hex digits
fn default_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("elm327-bridge-{}", &id[..8])
}

impl BridgeConfig {
    /// Load from `path` (if given) and the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("init_commands"),
            )
            .build()?;

        let config: BridgeConfig = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without environment overrides
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = config::Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialization alone cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.is_none() {
            let address = self.address.trim();
            if address.is_empty() || address.eq_ignore_ascii_case(PLACEHOLDER_ADDRESS) {
                return Err(ConfigError::Invalid(
                    "address must be set to the adapter's Bluetooth MAC (or set device)".to_string(),
                ));
            }
        }
        if self.connect_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("connect_timeout_seconds must be positive".to_string()));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("read_timeout_ms must be positive".to_string()));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be positive".to_string()));
        }
        if self.broker_host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker_host must not be empty".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("client_id must not be empty".to_string()));
        }
        if self.data_topic.is_empty() || self.command_topic.is_empty() {
            return Err(ConfigError::Invalid("data_topic and command_topic must be set".to_string()));
        }
        if self.data_topic == self.command_topic {
            return Err(ConfigError::Invalid(
                "data_topic and command_topic must differ".to_string(),
            ));
        }
        self.credentials()?;
        self.level()?;
        Ok(())
    }

    /// Broker login; empty strings count as unset
    pub fn credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        let username = self.username.as_deref().filter(|u| !u.is_empty());
        let password = self.password.as_deref().filter(|p| !p.is_empty());
        match (username, password) {
            (Some(username), Some(password)) => Ok(Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            })),
            (None, None) => Ok(None),
            _ => Err(ConfigError::Invalid(
                "username and password must be provided together".to_string(),
            )),
        }
    }

    /// Configured log level
    pub fn level(&self) -> Result<Level, ConfigError> {
        self.log_level
            .parse::<Level>()
            .map_err(|_| ConfigError::Invalid(format!("unknown log level {:?}", self.log_level)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Transport endpoint tuning
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            read_buffer_size: self.read_buffer_size,
            init_commands: self.init_commands.clone(),
            init_timeout: self.connect_timeout(),
            ..Default::default()
        }
    }

    /// Messaging endpoint settings
    pub fn session_settings(&self) -> Result<SessionSettings, ConfigError> {
        Ok(SessionSettings {
            host: self.broker_host.clone(),
            port: self.broker_port,
            client_id: self.client_id.clone(),
            credentials: self.credentials()?,
            keep_alive: Duration::from_secs(self.keep_alive_seconds),
            connect_timeout: self.connect_timeout(),
            data_topic: self.data_topic.clone(),
            command_topic: self.command_topic.clone(),
            qos: self.qos,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"address = "00:1D:A5:68:98:8B""#;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.channel, 1);
        assert_eq!(config.baud_rate, 38400);
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.qos, QosLevel::AtLeastOnce);
        assert_eq!(config.data_topic, "elm327/outgoing/data");
        assert_eq!(config.command_topic, "elm327/incoming/command");
        assert_eq!(config.reconnect_interval_seconds, 5);
        assert_eq!(config.keep_alive_seconds, 60);
        assert_eq!(config.read_buffer_size, 1024);
    }

    #[test]
    fn test_default_client_id_format() {
        let config = BridgeConfig::default();
        let suffix = config.client_id.strip_prefix("elm327-bridge-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_placeholder_address_rejected() {
        assert!(BridgeConfig::default().validate().is_err());
    }

    #[test]
    fn test_device_replaces_address() {
        let config = BridgeConfig::parse(r#"device = "/dev/rfcomm0""#).unwrap();
        assert_eq!(config.device.as_deref(), Some("/dev/rfcomm0"));
    }

    #[test]
    fn test_parse_toml() {
        let config = BridgeConfig::parse(
            r#"
            address = "00:1D:A5:68:98:8B"
            channel = 2
            broker_host = "broker.local"
            broker_port = 8883
            qos = 2
            init_commands = ["ATZ", "ATE0"]
            username = "bridge"
            password = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.channel, 2);
        assert_eq!(config.broker_host, "broker.local");
        assert_eq!(config.init_commands, vec!["ATZ".to_string(), "ATE0".to_string()]);

        let session = config.session_settings().unwrap();
        assert_eq!(session.port, 8883);
        assert_eq!(session.qos, QosLevel::ExactlyOnce);
        assert_eq!(session.credentials.unwrap().username, "bridge");
    }

    #[test]
    fn test_minimal_file_keeps_defaults() {
        let config = BridgeConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.broker_host, "localhost");
        assert_eq!(config.supervise_interval_ms, 1000);
        assert!(config.session_settings().unwrap().credentials.is_none());
    }

    #[test]
    fn test_invalid_qos() {
        let err = BridgeConfig::parse(&format!("{}\nqos = 3", MINIMAL)).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_qos_zero_accepted() {
        let config = BridgeConfig::parse(&format!("{}\nqos = 0", MINIMAL)).unwrap();
        assert_eq!(config.session_settings().unwrap().qos, QosLevel::AtMostOnce);
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let connect = format!("{}\nconnect_timeout_seconds = 0", MINIMAL);
        assert!(matches!(BridgeConfig::parse(&connect), Err(ConfigError::Invalid(_))));

        let read = format!("{}\nread_timeout_ms = 0", MINIMAL);
        assert!(matches!(BridgeConfig::parse(&read), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_init_timeout_follows_connect_timeout() {
        let config = BridgeConfig::parse(&format!("{}\nconnect_timeout_seconds = 3", MINIMAL)).unwrap();
        assert_eq!(config.link_settings().init_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_same_topics_rejected() {
        let content = format!(
            "{}\ndata_topic = \"elm/x\"\ncommand_topic = \"elm/x\"",
            MINIMAL
        );
        assert!(BridgeConfig::parse(&content).is_err());
    }

    #[test]
    fn test_username_without_password_rejected() {
        let content = format!("{}\nusername = \"bridge\"", MINIMAL);
        assert!(BridgeConfig::parse(&content).is_err());
    }

    #[test]
    fn test_empty_credentials_are_anonymous() {
        let content = format!("{}\nusername = \"\"\npassword = \"\"", MINIMAL);
        let config = BridgeConfig::parse(&content).unwrap();
        assert!(config.credentials().unwrap().is_none());
    }

    #[test]
    fn test_zero_read_buffer_rejected() {
        let content = format!("{}\nread_buffer_size = 0", MINIMAL);
        assert!(BridgeConfig::parse(&content).is_err());
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let content = format!("{}\nlog_level = \"chatty\"", MINIMAL);
        assert!(BridgeConfig::parse(&content).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = BridgeConfig::load(Some(Path::new("/nonexistent/elm327-bridge.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
