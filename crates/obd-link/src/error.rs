//! Adapter Link Error Types

use thiserror::Error;

/// Errors that can occur on the adapter link
#[derive(Debug, Error)]
pub enum LinkError {
    /// Socket or serial I/O failure
    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial device could not be opened
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Bluetooth address could not be parsed
    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    /// Adapter refused or did not answer the connection
    #[error("Connection to {target} failed: {reason}")]
    ConnectFailed { target: String, reason: String },

    /// Initialization command could not be sent
    #[error("Adapter initialization failed on {command}: {reason}")]
    InitFailed { command: String, reason: String },

    /// No live link and reconnecting did not produce one
    #[error("Adapter link is not connected")]
    NotConnected,

    /// Blocking worker did not complete
    #[error("Blocking link task failed: {0}")]
    Worker(String),
}

impl From<tokio_serial::Error> for LinkError {
    fn from(err: tokio_serial::Error) -> Self {
        LinkError::Serial(err.to_string())
    }
}

impl From<tokio::task::JoinError> for LinkError {
    fn from(err: tokio::task::JoinError) -> Self {
        LinkError::Worker(err.to_string())
    }
}
