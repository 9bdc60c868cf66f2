//! MQTT Messaging Endpoint
//!
//! Publishes adapter data to a broker and hands commands received on the
//! command topic to a single registered handler. Binary payloads travel as
//! base64 text on the wire.

mod codec;
mod endpoint;
mod error;
pub mod mock;
mod rumqtt;
mod session;

pub use codec::{decode_payload, encode_payload};
pub use endpoint::{MessageHandler, MessagingEndpoint};
pub use error::MessagingError;
pub use rumqtt::RumqttBroker;
pub use session::{Broker, Credentials, QosLevel, Session, SessionEvent, SessionEvents, SessionSettings};
