//! ELM327 Adapter Link
//!
//! This crate owns the byte stream to an ELM327-compatible OBD-II adapter
//! reached over Bluetooth RFCOMM. Payloads are opaque: the link neither frames
//! nor decodes what the adapter sends.

mod endpoint;
mod error;
mod link;
pub mod mock;
#[cfg(target_os = "linux")]
mod rfcomm;
mod serial;

pub use endpoint::{Chunks, LinkSettings, TransportEndpoint};
pub use error::LinkError;
pub use link::{Connector, Link};
#[cfg(target_os = "linux")]
pub use rfcomm::{parse_bdaddr, RfcommConnector};
pub use serial::{SerialConnector, DEFAULT_BAUD_RATE};

/// Default RFCOMM channel for the Serial Port Profile
pub const DEFAULT_CHANNEL: u8 = 1;

/// Prompt byte the ELM327 prints when it is ready for the next command
pub const ELM_PROMPT: u8 = b'>';
