//! Link and Connector Traits
//!
//! Both traits are blocking. The endpoint always calls them from
//! `tokio::task::spawn_blocking`, never from the async scheduler.

use crate::error::LinkError;
use std::io;
use std::sync::Arc;

/// A live byte stream to the adapter
pub trait Link: Send + Sync + 'static {
    /// Read the next chunk into `buf`.
    ///
    /// Returns `Ok(0)` when the peer closed the stream. A read timeout is
    /// reported as `ErrorKind::TimedOut` or `ErrorKind::WouldBlock`.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole payload unmodified
    fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Close the stream. A reader blocked in `recv` must return promptly.
    fn close(&self);
}

/// Opens links to one fixed adapter
pub trait Connector: Send + Sync + 'static {
    /// Open a new link
    fn open(&self) -> Result<Arc<dyn Link>, LinkError>;

    /// Human readable description of the adapter address
    fn target(&self) -> String;
}
