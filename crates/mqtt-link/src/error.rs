//! Messaging Error Types

use thiserror::Error;

/// Errors raised by the messaging endpoint
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Broker rejected connection: {0}")]
    Rejected(String),

    #[error("Handshake timed out after {0}ms")]
    Timeout(u64),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Payload is not valid base64: {0}")]
    Decode(String),

    #[error("Unsupported QoS level {0}")]
    InvalidQos(u8),
}
