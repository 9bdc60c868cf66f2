//! rumqttc-backed broker sessions

use crate::error::MessagingError;
use crate::session::{Broker, QosLevel, Session, SessionEvent, SessionEvents, SessionSettings};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use tracing::debug;

/// Capacity of the client request queue
const REQUEST_CAPACITY: usize = 10;

/// Broker reached over plain TCP with rumqttc
#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttBroker;

impl Broker for RumqttBroker {
    fn open(&self, settings: &SessionSettings) -> (Arc<dyn Session>, Box<dyn SessionEvents>) {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.host.clone(),
            settings.port,
        );
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);
        if let Some(credentials) = &settings.credentials {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
            debug!("MQTT authentication enabled for {}", credentials.username);
        } else {
            debug!("MQTT authentication disabled (anonymous)");
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        (
            Arc::new(RumqttSession { client }),
            Box::new(RumqttEvents { eventloop }),
        )
    }
}

fn to_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

struct RumqttSession {
    client: AsyncClient,
}

#[async_trait]
impl Session for RumqttSession {
    fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), MessagingError> {
        self.client
            .try_subscribe(topic, to_qos(qos))
            .map_err(|e| MessagingError::Subscribe(e.to_string()))
    }

    async fn publish(&self, topic: &str, qos: QosLevel, payload: Vec<u8>) -> Result<(), MessagingError> {
        self.client
            .publish(topic, to_qos(qos), false, payload)
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), MessagingError> {
        self.client
            .try_disconnect()
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }
}

struct RumqttEvents {
    eventloop: EventLoop,
}

#[async_trait]
impl SessionEvents for RumqttEvents {
    async fn poll(&mut self) -> Result<SessionEvent, MessagingError> {
        let event = self
            .eventloop
            .poll()
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        Ok(match event {
            Event::Incoming(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
                SessionEvent::Connected
            }
            Event::Incoming(Packet::ConnAck(ack)) => SessionEvent::Rejected(format!("{:?}", ack.code)),
            Event::Incoming(Packet::Publish(publish)) => SessionEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Event::Incoming(Packet::Disconnect) => SessionEvent::Disconnected,
            _ => SessionEvent::Other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessagingEndpoint;
    use std::time::Duration;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_qos(QosLevel::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_qos(QosLevel::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(to_qos(QosLevel::ExactlyOnce), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let settings = SessionSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let endpoint = MessagingEndpoint::new(RumqttBroker, settings);

        assert!(endpoint.connect().await.is_err());
        assert!(!endpoint.is_connected().await);
    }
}
