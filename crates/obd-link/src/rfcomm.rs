//! Native RFCOMM Socket Link
//!
//! Thin safe wrapper over a Linux `AF_BLUETOOTH` / `BTPROTO_RFCOMM` stream
//! socket. Timeouts are applied with `SO_SNDTIMEO` (which also bounds the
//! RFCOMM connect) and `SO_RCVTIMEO`.

use crate::error::LinkError;
use crate::link::{Connector, Link};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Bluetooth RFCOMM protocol number from `<bluetooth/bluetooth.h>`
const BTPROTO_RFCOMM: libc::c_int = 3;

/// `struct sockaddr_rc` from `<bluetooth/rfcomm.h>`
#[repr(C)]
struct SockaddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: [u8; 6],
    rc_channel: u8,
}

/// Parse a `XX:XX:XX:XX:XX:XX` address into a kernel `bdaddr_t`.
///
/// The kernel stores the address little-endian, so the octets come back in
/// reverse textual order.
pub fn parse_bdaddr(address: &str) -> Result<[u8; 6], LinkError> {
    let invalid = || LinkError::InvalidAddress(address.to_string());

    let octets: Vec<&str> = address.trim().split(':').collect();
    if octets.len() != 6 {
        return Err(invalid());
    }

    let mut bdaddr = [0u8; 6];
    for (i, octet) in octets.iter().enumerate() {
        if octet.len() != 2 || !octet.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        bdaddr[5 - i] = u8::from_str_radix(octet, 16).map_err(|_| invalid())?;
    }
    Ok(bdaddr)
}

/// Connector for an adapter reachable by Bluetooth address and channel
#[derive(Debug, Clone)]
pub struct RfcommConnector {
    /// Textual address, kept for logging
    address: String,
    /// Kernel byte order address
    bdaddr: [u8; 6],
    /// RFCOMM channel (1 for most ELM327 SPP adapters)
    channel: u8,
    /// Bound on connect and on each send
    connect_timeout: Duration,
    /// Bound on each blocking read
    read_timeout: Duration,
}

impl RfcommConnector {
    /// Create a connector for `address` on `channel`
    pub fn new(address: &str, channel: u8) -> Result<Self, LinkError> {
        Ok(Self {
            address: address.trim().to_uppercase(),
            bdaddr: parse_bdaddr(address)?,
            channel,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_millis(500),
        })
    }

    /// Override the connect and read timeouts
    pub fn with_timeouts(mut self, connect_timeout: Duration, read_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.read_timeout = read_timeout;
        self
    }

    fn connect_error(&self, err: io::Error) -> LinkError {
        LinkError::ConnectFailed {
            target: self.target(),
            reason: err.to_string(),
        }
    }
}

impl Connector for RfcommConnector {
    fn open(&self) -> Result<Arc<dyn Link>, LinkError> {
        debug!("Opening RFCOMM socket to {}", self.target());

        // SAFETY: plain socket(2) call; the result is checked before use.
        let fd = unsafe {
            libc::socket(
                libc::AF_BLUETOOTH,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                BTPROTO_RFCOMM,
            )
        };
        if fd < 0 {
            return Err(self.connect_error(io::Error::last_os_error()));
        }
        // SAFETY: `fd` is a freshly created descriptor that nothing else owns.
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };

        set_timeout(socket.as_raw_fd(), libc::SO_SNDTIMEO, self.connect_timeout)
            .map_err(|e| self.connect_error(e))?;
        set_timeout(socket.as_raw_fd(), libc::SO_RCVTIMEO, self.read_timeout)
            .map_err(|e| self.connect_error(e))?;

        let addr = SockaddrRc {
            rc_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            rc_bdaddr: self.bdaddr,
            rc_channel: self.channel,
        };
        // SAFETY: `addr` is a valid sockaddr_rc and the length matches it.
        let rc = unsafe {
            libc::connect(
                socket.as_raw_fd(),
                &addr as *const SockaddrRc as *const libc::sockaddr,
                mem::size_of::<SockaddrRc>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(self.connect_error(io::Error::last_os_error()));
        }

        info!("RFCOMM socket connected to {}", self.target());
        Ok(Arc::new(RfcommLink {
            socket,
            write_lock: Mutex::new(()),
        }))
    }

    fn target(&self) -> String {
        format!("{} channel {}", self.address, self.channel)
    }
}

fn set_timeout(fd: RawFd, option: libc::c_int, timeout: Duration) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    // SAFETY: `tv` outlives the call and the length matches its type.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &tv as *const libc::timeval as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Connected RFCOMM socket
struct RfcommLink {
    socket: OwnedFd,
    /// Keeps concurrent writers from interleaving partial sends
    write_lock: Mutex<()>,
}

impl Link for RfcommLink {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
            let n = unsafe {
                libc::recv(
                    self.socket.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "write lock poisoned"))?;

        let mut sent = 0;
        while sent < data.len() {
            let rest = &data[sent..];
            // SAFETY: `rest` is valid for reads of `rest.len()` bytes.
            let n = unsafe {
                libc::send(
                    self.socket.as_raw_fd(),
                    rest.as_ptr() as *const libc::c_void,
                    rest.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes"));
            }
            sent += n as usize;
        }
        Ok(())
    }

    fn close(&self) {
        // Wakes any reader blocked in recv; the descriptor itself is released on drop.
        // SAFETY: shutdown(2) on a descriptor we own.
        unsafe {
            libc::shutdown(self.socket.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bdaddr_reverses_octets() {
        let bdaddr = parse_bdaddr("00:1D:A5:68:98:8B").unwrap();
        assert_eq!(bdaddr, [0x8B, 0x98, 0x68, 0xA5, 0x1D, 0x00]);
    }

    #[test]
    fn test_parse_bdaddr_accepts_lowercase() {
        assert!(parse_bdaddr("aa:bb:cc:dd:ee:ff").is_ok());
    }

    #[test]
    fn test_parse_bdaddr_rejects_malformed() {
        assert!(parse_bdaddr("XX:XX:XX:XX:XX:XX").is_err());
        assert!(parse_bdaddr("00:11:22:33:44").is_err());
        assert!(parse_bdaddr("00:11:22:33:44:555").is_err());
        assert!(parse_bdaddr("").is_err());
    }

    #[test]
    fn test_connector_target() {
        let connector = RfcommConnector::new("aa:bb:cc:dd:ee:ff", 2).unwrap();
        assert_eq!(connector.target(), "AA:BB:CC:DD:EE:FF channel 2");
    }
}
