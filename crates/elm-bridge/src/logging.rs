//! Logging setup

use crate::error::BridgeError;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the global subscriber
pub fn init_logging(level: Level, json: bool) -> Result<(), BridgeError> {
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);

    let installed = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };

    installed.map_err(|e| BridgeError::Logging(e.to_string()))
}
