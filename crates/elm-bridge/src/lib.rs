//! ELM327 MQTT Bridge
//!
//! Relays the byte stream of an ELM327 OBD-II adapter reached over Bluetooth
//! RFCOMM to an MQTT broker, and writes commands received from the broker
//! back to the adapter. Both sides reconnect on failure.

pub mod bridge;
pub mod config;
pub mod error;
mod logging;

pub use bridge::{Bridge, BridgeSettings, BridgeState};
pub use config::BridgeConfig;
pub use error::{BridgeError, ConfigError};
pub use logging::init_logging;
