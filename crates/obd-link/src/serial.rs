//! Bound RFCOMM Serial Device Link
//!
//! Used when the adapter was bound to a TTY with `rfcomm bind`
//! (e.g. `/dev/rfcomm0`) instead of being dialled directly.

use crate::error::LinkError;
use crate::link::{Connector, Link};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_serial::SerialPort;
use tracing::info;

/// Default baud rate of ELM327 Bluetooth adapters
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Connector for a serial device node
#[derive(Debug, Clone)]
pub struct SerialConnector {
    /// Device path (e.g., "/dev/rfcomm0")
    device: PathBuf,
    /// Baud rate for the TTY
    baud_rate: u32,
    /// Bound on each blocking read
    read_timeout: Duration,
}

impl SerialConnector {
    /// Create a connector for `device`
    pub fn new(device: impl AsRef<Path>, baud_rate: u32) -> Self {
        Self {
            device: device.as_ref().to_path_buf(),
            baud_rate,
            read_timeout: Duration::from_millis(500),
        }
    }

    /// Override the read timeout
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

impl Connector for SerialConnector {
    fn open(&self) -> Result<Arc<dyn Link>, LinkError> {
        if !self.device.exists() {
            return Err(LinkError::ConnectFailed {
                target: self.target(),
                reason: "device does not exist, bind it with `rfcomm bind` first".to_string(),
            });
        }

        let reader = tokio_serial::new(self.device.to_string_lossy(), self.baud_rate)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| LinkError::ConnectFailed {
                target: self.target(),
                reason: e.to_string(),
            })?;
        let writer = reader.try_clone()?;

        info!("Opened {} at {} baud", self.device.display(), self.baud_rate);
        Ok(Arc::new(SerialLink {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }))
    }

    fn target(&self) -> String {
        self.device.display().to_string()
    }
}

/// Open serial device with independent read and write handles
struct SerialLink {
    reader: Mutex<Box<dyn SerialPort>>,
    writer: Mutex<Box<dyn SerialPort>>,
    /// Set by `close`; the reader notices within one read timeout
    closed: AtomicBool,
}

impl SerialLink {
    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "link closed"));
        }
        Ok(())
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "serial handle poisoned")
}

impl Link for SerialLink {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        let mut port = self.reader.lock().map_err(|_| poisoned())?;
        port.read(buf)
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        self.check_open()?;
        let mut port = self.writer.lock().map_err(|_| poisoned())?;
        port.write_all(data)?;
        port.flush()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device_fails_to_open() {
        let connector = SerialConnector::new("/dev/rfcomm-does-not-exist", DEFAULT_BAUD_RATE);
        let err = connector.open().err().unwrap();
        assert!(matches!(err, LinkError::ConnectFailed { .. }));
    }

    #[test]
    fn test_target_is_device_path() {
        let connector = SerialConnector::new("/dev/rfcomm0", DEFAULT_BAUD_RATE);
        assert_eq!(connector.target(), "/dev/rfcomm0");
    }
}
