//! In-memory adapter for tests and dry runs (no hardware required)

use crate::error::LinkError;
use crate::link::{Connector, Link};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a mock read blocks before reporting a timeout
const MOCK_READ_TIMEOUT: Duration = Duration::from_millis(20);

#[derive(Default)]
struct LinkFlags {
    /// Closed from our side
    closed: AtomicBool,
    /// Closed from the adapter side
    severed: AtomicBool,
}

#[derive(Default)]
struct AdapterState {
    responses: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    refuse: bool,
    fail_writes: bool,
    opened: usize,
    latest: Option<Arc<LinkFlags>>,
}

struct Shared {
    state: Mutex<AdapterState>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Simulated ELM327 adapter.
///
/// Clones share state, so a test can keep one handle for scripting while the
/// endpoint owns a [`MockConnector`].
#[derive(Clone)]
pub struct MockAdapter {
    shared: Arc<Shared>,
}

impl MockAdapter {
    /// Create an adapter that accepts connections
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(AdapterState::default()),
                ready: Condvar::new(),
            }),
        }
    }

    /// Connector that opens links to this adapter
    pub fn connector(&self) -> MockConnector {
        MockConnector {
            adapter: self.clone(),
        }
    }

    /// Queue bytes for the adapter to send
    pub fn push_response(&self, data: impl Into<Vec<u8>>) {
        self.shared.lock().responses.push_back(data.into());
        self.shared.ready.notify_all();
    }

    /// Everything written to the adapter so far, one entry per write
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.shared.lock().written.clone()
    }

    /// Make subsequent connection attempts fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.lock().refuse = refuse;
    }

    /// Make subsequent writes fail
    pub fn fail_writes(&self, fail: bool) {
        self.shared.lock().fail_writes = fail;
    }

    /// Close the most recent link from the adapter side
    pub fn sever(&self) {
        if let Some(flags) = self.shared.lock().latest.as_ref() {
            flags.severed.store(true, Ordering::Release);
        }
        self.shared.ready.notify_all();
    }

    /// Number of links opened so far
    pub fn open_count(&self) -> usize {
        self.shared.lock().opened
    }

    /// Whether the most recent link is still open on both sides
    pub fn is_open(&self) -> bool {
        self.shared.lock().latest.as_ref().is_some_and(|flags| {
            !flags.closed.load(Ordering::Acquire) && !flags.severed.load(Ordering::Acquire)
        })
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Connector for a [`MockAdapter`]
#[derive(Clone)]
pub struct MockConnector {
    adapter: MockAdapter,
}

impl Connector for MockConnector {
    fn open(&self) -> Result<Arc<dyn Link>, LinkError> {
        let mut state = self.adapter.shared.lock();
        if state.refuse {
            return Err(LinkError::ConnectFailed {
                target: self.target(),
                reason: "connection refused".to_string(),
            });
        }

        let flags = Arc::new(LinkFlags::default());
        state.opened += 1;
        state.latest = Some(Arc::clone(&flags));
        debug!("Mock adapter link #{} opened", state.opened);

        Ok(Arc::new(MockLink {
            shared: Arc::clone(&self.adapter.shared),
            flags,
        }))
    }

    fn target(&self) -> String {
        "mock adapter".to_string()
    }
}

struct MockLink {
    shared: Arc<Shared>,
    flags: Arc<LinkFlags>,
}

impl Link for MockLink {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + MOCK_READ_TIMEOUT;
        let mut state = self.shared.lock();

        loop {
            if self.flags.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "link closed"));
            }
            if self.flags.severed.load(Ordering::Acquire) {
                return Ok(0);
            }
            if let Some(mut chunk) = state.responses.pop_front() {
                if chunk.len() > buf.len() {
                    let rest = chunk.split_off(buf.len());
                    state.responses.push_front(rest);
                }
                buf[..chunk.len()].copy_from_slice(&chunk);
                return Ok(chunk.len());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            state = match self.shared.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut state = self.shared.lock();
        if self.flags.closed.load(Ordering::Acquire) || self.flags.severed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed"));
        }
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated write failure"));
        }
        state.written.push(data.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.flags.closed.store(true, Ordering::Release);
        self.shared.ready.notify_all();
    }
}
