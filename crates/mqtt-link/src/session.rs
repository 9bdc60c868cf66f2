//! Broker session abstraction
//!
//! A [`Broker`] opens a session split in two halves: a [`Session`] used to
//! send requests and a [`SessionEvents`] stream that must be polled to drive
//! the network and receive incoming packets.

use crate::error::MessagingError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    /// QoS 0
    AtMostOnce,
    /// QoS 1
    #[default]
    AtLeastOnce,
    /// QoS 2
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = MessagingError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(MessagingError::InvalidQos(other)),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

/// Broker login
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything needed to open and use a broker session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Broker host name
    pub host: String,
    /// Broker port
    pub port: u16,
    /// MQTT client identifier
    pub client_id: String,
    /// Optional login; anonymous when absent
    pub credentials: Option<Credentials>,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Bound on the CONNECT/CONNACK handshake
    pub connect_timeout: Duration,
    /// Topic adapter data is published to
    pub data_topic: String,
    /// Topic commands are received on
    pub command_topic: String,
    /// QoS for both the publish and the subscription
    pub qos: QosLevel,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "elm327-bridge".to_string(),
            credentials: None,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            data_topic: "elm327/outgoing/data".to_string(),
            command_topic: "elm327/incoming/command".to_string(),
            qos: QosLevel::AtLeastOnce,
        }
    }
}

/// Something that happened on the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Broker accepted the connection
    Connected,
    /// Broker refused the connection
    Rejected(String),
    /// A publish arrived
    Message { topic: String, payload: Vec<u8> },
    /// Broker closed the session
    Disconnected,
    /// Protocol traffic of no interest to the endpoint
    Other,
}

/// Opens sessions to one broker
pub trait Broker: Send + Sync + 'static {
    fn open(&self, settings: &SessionSettings) -> (Arc<dyn Session>, Box<dyn SessionEvents>);
}

/// Request half of a session
#[async_trait]
pub trait Session: Send + Sync {
    /// Queue a subscription. Must not wait on the event stream.
    fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), MessagingError>;

    /// Publish a payload (retain is always off)
    async fn publish(&self, topic: &str, qos: QosLevel, payload: Vec<u8>) -> Result<(), MessagingError>;

    /// Ask the broker to close the session
    async fn disconnect(&self) -> Result<(), MessagingError>;
}

/// Event half of a session; polling it drives the network
#[async_trait]
pub trait SessionEvents: Send {
    async fn poll(&mut self) -> Result<SessionEvent, MessagingError>;
}
