//! Bridge Error Types

use mqtt_link::MessagingError;
use obd_link::LinkError;
use thiserror::Error;

/// Configuration could not be loaded or is unusable
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by the bridge orchestrator
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Transport error: {0}")]
    Transport(#[from] LinkError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    /// `stop()` arrived while the bridge was still connecting
    #[error("Bridge stopped while connecting")]
    Stopped,

    /// Initial connect failed; the bridge never reached the running state
    #[error("Startup failed: {0}")]
    Startup(#[source] Box<BridgeError>),
}
