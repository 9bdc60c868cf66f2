//! Adapter Transport Endpoint
//!
//! Owns the single live link to the adapter. Connect and disconnect are
//! serialized by an async mutex; the blocking socket calls themselves run on
//! the blocking pool so they never stall the scheduler.

use crate::error::LinkError;
use crate::link::{Connector, Link};
use crate::ELM_PROMPT;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Default maximum chunk size for a single read
const DEFAULT_READ_BUFFER: usize = 1024;

/// Default number of chunks buffered between the reader and its consumer
const DEFAULT_CHANNEL_CAPACITY: usize = 32;

/// Default time an init command may take to answer with a prompt
const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Tuning for the transport endpoint
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Maximum size of one chunk handed to the consumer
    pub read_buffer_size: usize,
    /// Capacity of the read stream channel
    pub channel_capacity: usize,
    /// ELM327 commands sent after every successful connect (e.g. "ATZ", "ATE0")
    pub init_commands: Vec<String>,
    /// How long each init command may take to answer (ATZ alone takes about a second)
    pub init_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            init_commands: Vec::new(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }
}

/// Receiving side of an adapter read stream.
///
/// The stream ends (returns `None`) when the link closes, fails, or could not
/// be opened in the first place.
#[derive(Debug)]
pub struct Chunks {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Chunks {
    /// Wait for the next chunk
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    settings: LinkSettings,
    /// Connection handle; only mutated while locked
    handle: Mutex<Option<Arc<dyn Link>>>,
}

/// Transport endpoint for the ELM327 adapter
#[derive(Clone)]
pub struct TransportEndpoint {
    inner: Arc<Inner>,
}

impl TransportEndpoint {
    /// Create an endpoint with default settings
    pub fn new(connector: impl Connector) -> Self {
        Self::with_settings(connector, LinkSettings::default())
    }

    /// Create an endpoint with explicit settings
    pub fn with_settings(connector: impl Connector, settings: LinkSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector: Arc::new(connector),
                settings,
                handle: Mutex::new(None),
            }),
        }
    }

    /// Description of the adapter this endpoint talks to
    pub fn target(&self) -> String {
        self.inner.connector.target()
    }

    /// Open the link if it is not already open
    pub async fn connect(&self) -> Result<(), LinkError> {
        let mut handle = self.inner.handle.lock().await;
        if handle.is_some() {
            debug!("Adapter {} already connected", self.target());
            return Ok(());
        }

        let connector = Arc::clone(&self.inner.connector);
        let commands = self.inner.settings.init_commands.clone();
        let buffer_size = self.inner.settings.read_buffer_size.max(1);
        let init_timeout = self.inner.settings.init_timeout;

        let opened = tokio::task::spawn_blocking(move || {
            let link = connector.open()?;
            if let Err(e) = prime_adapter(link.as_ref(), &commands, buffer_size, init_timeout) {
                link.close();
                return Err(e);
            }
            Ok(link)
        })
        .await;

        match opened.map_err(LinkError::from).and_then(|result| result) {
            Ok(link) => {
                *handle = Some(link);
                info!("Connected to adapter {}", self.target());
                Ok(())
            }
            Err(e) => {
                error!("Failed to connect to adapter {}: {}", self.target(), e);
                Err(e)
            }
        }
    }

    /// Close the link if present. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let mut handle = self.inner.handle.lock().await;
        if let Some(link) = handle.take() {
            close_link(link).await;
            info!("Disconnected from adapter {}", self.target());
        }
    }

    /// Whether a link is currently held
    pub async fn is_connected(&self) -> bool {
        self.inner.handle.lock().await.is_some()
    }

    /// Write a payload to the adapter unmodified, connecting first if needed
    pub async fn write(&self, payload: &[u8]) -> Result<(), LinkError> {
        let link = self.live_link().await?;

        let data = payload.to_vec();
        let sending = Arc::clone(&link);
        let sent = tokio::task::spawn_blocking(move || sending.send(&data)).await;

        match sent
            .map_err(LinkError::from)
            .and_then(|result| result.map_err(LinkError::from))
        {
            Ok(()) => {
                debug!(
                    "Sent {} bytes to adapter: {:?}",
                    payload.len(),
                    String::from_utf8_lossy(payload)
                );
                Ok(())
            }
            Err(e) => {
                error!("Write to adapter failed: {}", e);
                self.release(&link).await;
                Err(e)
            }
        }
    }

    /// Start streaming chunks from the adapter.
    ///
    /// Connects first if needed. If that fails the returned stream is already
    /// finished. Calling `read` again after a stream ended starts a new one.
    pub async fn read(&self) -> Chunks {
        let (tx, rx) = mpsc::channel(self.inner.settings.channel_capacity.max(1));

        match self.live_link().await {
            Ok(link) => {
                let endpoint = self.clone();
                tokio::spawn(async move { endpoint.pump(link, tx).await });
            }
            Err(e) => warn!("Adapter read stream not started: {}", e),
        }

        Chunks { rx }
    }

    async fn current(&self) -> Option<Arc<dyn Link>> {
        self.inner.handle.lock().await.clone()
    }

    async fn live_link(&self) -> Result<Arc<dyn Link>, LinkError> {
        if let Some(link) = self.current().await {
            return Ok(link);
        }
        self.connect().await?;
        self.current().await.ok_or(LinkError::NotConnected)
    }

    async fn is_current(&self, link: &Arc<dyn Link>) -> bool {
        self.inner
            .handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|held| same_link(held, link))
    }

    /// Drop `link` if it is still the held one. A newer link is left alone.
    async fn release(&self, link: &Arc<dyn Link>) {
        let mut handle = self.inner.handle.lock().await;
        let held = handle.as_ref().is_some_and(|held| same_link(held, link));
        if held {
            if let Some(link) = handle.take() {
                close_link(link).await;
                warn!("Dropped link to adapter {}", self.target());
            }
        }
    }

    async fn pump(self, link: Arc<dyn Link>, tx: mpsc::Sender<Vec<u8>>) {
        let buffer_size = self.inner.settings.read_buffer_size.max(1);

        loop {
            let reading = Arc::clone(&link);
            let received = tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; buffer_size];
                reading.recv(&mut buf).map(|n| {
                    buf.truncate(n);
                    buf
                })
            })
            .await;

            match received {
                Ok(Ok(chunk)) if chunk.is_empty() => {
                    if self.is_current(&link).await {
                        warn!("Adapter closed the connection");
                        self.release(&link).await;
                    } else {
                        debug!("Reader for a released link finished");
                    }
                    break;
                }
                Ok(Ok(chunk)) => {
                    debug!("Read {} bytes from adapter", chunk.len());
                    if tx.send(chunk).await.is_err() {
                        debug!("Adapter read stream dropped by consumer");
                        break;
                    }
                }
                Ok(Err(e)) if is_timeout(&e) => {
                    if tx.is_closed() || !self.is_current(&link).await {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    if self.is_current(&link).await {
                        error!("Adapter read failed: {}", e);
                        self.release(&link).await;
                    } else {
                        debug!("Reader for a released link finished: {}", e);
                    }
                    break;
                }
                Err(e) => {
                    error!("Adapter read worker failed: {}", e);
                    self.release(&link).await;
                    break;
                }
            }
        }
    }
}

fn same_link(a: &Arc<dyn Link>, b: &Arc<dyn Link>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

async fn close_link(link: Arc<dyn Link>) {
    if let Err(e) = tokio::task::spawn_blocking(move || link.close()).await {
        warn!("Closing adapter link failed: {}", e);
    }
}

/// Send the configured ELM327 init commands, draining each reply up to the prompt.
///
/// Read timeouts inside `init_timeout` are waited out so a slow reply (the
/// ATZ banner) cannot spill into the next command or the read stream.
fn prime_adapter(
    link: &dyn Link,
    commands: &[String],
    buffer_size: usize,
    init_timeout: Duration,
) -> Result<(), LinkError> {
    for (i, command) in commands.iter().enumerate() {
        debug!("Sending init command {}/{}: {}", i + 1, commands.len(), command);

        let mut line = command.trim().as_bytes().to_vec();
        line.push(b'\r');
        link.send(&line).map_err(|e| LinkError::InitFailed {
            command: command.clone(),
            reason: e.to_string(),
        })?;

        let deadline = Instant::now() + init_timeout;
        let mut reply = Vec::new();
        let mut buf = vec![0u8; buffer_size];
        loop {
            match link.recv(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    reply.extend_from_slice(&buf[..n]);
                    if buf[..n].contains(&ELM_PROMPT) {
                        break;
                    }
                }
                Err(e) if is_timeout(&e) && Instant::now() < deadline => continue,
                Err(e) => {
                    warn!("No complete response to {} ({}), continuing", command, e);
                    break;
                }
            }
        }
        debug!("Response to {}: {:?}", command, String::from_utf8_lossy(&reply));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn endpoint(adapter: &MockAdapter) -> TransportEndpoint {
        TransportEndpoint::new(adapter.connector())
    }

    async fn wait_until_disconnected(endpoint: &TransportEndpoint) {
        timeout(WAIT, async {
            while endpoint.is_connected().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("endpoint never disconnected");
    }

    #[tokio::test]
    async fn test_connect_success() {
        let adapter = MockAdapter::new();
        let endpoint = endpoint(&adapter);

        endpoint.connect().await.unwrap();
        assert!(endpoint.is_connected().await);
        assert_eq!(adapter.open_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_handle_absent() {
        let adapter = MockAdapter::new();
        adapter.refuse_connections(true);
        let endpoint = endpoint(&adapter);

        assert!(endpoint.connect().await.is_err());
        assert!(!endpoint.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_is_noop_when_connected() {
        let adapter = MockAdapter::new();
        let endpoint = endpoint(&adapter);

        endpoint.connect().await.unwrap();
        endpoint.connect().await.unwrap();
        assert_eq!(adapter.open_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_twice() {
        let adapter = MockAdapter::new();
        let endpoint = endpoint(&adapter);
        endpoint.connect().await.unwrap();

        endpoint.disconnect().await;
        assert!(!endpoint.is_connected().await);
        endpoint.disconnect().await;
        assert!(!endpoint.is_connected().await);
        assert!(!adapter.is_open());
    }

    #[tokio::test]
    async fn test_read_ends_immediately_when_connect_fails() {
        let adapter = MockAdapter::new();
        adapter.refuse_connections(true);
        let endpoint = endpoint(&adapter);

        let mut chunks = endpoint.read().await;
        let next = timeout(WAIT, chunks.recv()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_read_yields_adapter_chunks() {
        let adapter = MockAdapter::new();
        adapter.push_response(b"41 0C 1A F8\r>".to_vec());
        adapter.push_response(b"41 0D 32\r>".to_vec());
        let endpoint = endpoint(&adapter);

        let mut chunks = endpoint.read().await;
        assert_eq!(timeout(WAIT, chunks.recv()).await.unwrap(), Some(b"41 0C 1A F8\r>".to_vec()));
        assert_eq!(timeout(WAIT, chunks.recv()).await.unwrap(), Some(b"41 0D 32\r>".to_vec()));
    }

    #[tokio::test]
    async fn test_read_splits_oversized_chunks() {
        let adapter = MockAdapter::new();
        adapter.push_response(b"0123456789".to_vec());
        let settings = LinkSettings {
            read_buffer_size: 4,
            ..Default::default()
        };
        let endpoint = TransportEndpoint::with_settings(adapter.connector(), settings);

        let mut chunks = endpoint.read().await;
        assert_eq!(timeout(WAIT, chunks.recv()).await.unwrap(), Some(b"0123".to_vec()));
        assert_eq!(timeout(WAIT, chunks.recv()).await.unwrap(), Some(b"4567".to_vec()));
        assert_eq!(timeout(WAIT, chunks.recv()).await.unwrap(), Some(b"89".to_vec()));
    }

    #[tokio::test]
    async fn test_peer_close_ends_stream_and_disconnects() {
        let adapter = MockAdapter::new();
        let endpoint = endpoint(&adapter);

        let mut chunks = endpoint.read().await;
        assert!(endpoint.is_connected().await);

        adapter.sever();
        assert_eq!(timeout(WAIT, chunks.recv()).await.unwrap(), None);
        wait_until_disconnected(&endpoint).await;
    }

    #[tokio::test]
    async fn test_read_restarts_after_end() {
        let adapter = MockAdapter::new();
        let endpoint = endpoint(&adapter);

        let mut chunks = endpoint.read().await;
        adapter.sever();
        assert_eq!(timeout(WAIT, chunks.recv()).await.unwrap(), None);
        wait_until_disconnected(&endpoint).await;

        adapter.push_response(b"OK\r>".to_vec());
        let mut chunks = endpoint.read().await;
        assert_eq!(timeout(WAIT, chunks.recv()).await.unwrap(), Some(b"OK\r>".to_vec()));
        assert_eq!(adapter.open_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_reader_keeps_new_link() {
        let adapter = MockAdapter::new();
        let endpoint = endpoint(&adapter);

        let mut old = endpoint.read().await;
        endpoint.disconnect().await;
        endpoint.connect().await.unwrap();

        assert_eq!(timeout(WAIT, old.recv()).await.unwrap(), None);
        assert!(endpoint.is_connected().await);
        assert!(adapter.is_open());
    }

    #[tokio::test]
    async fn test_write_sends_unmodified_bytes() {
        let adapter = MockAdapter::new();
        let endpoint = endpoint(&adapter);
        endpoint.connect().await.unwrap();

        endpoint.write(b"010C\r").await.unwrap();
        assert_eq!(adapter.written(), vec![b"010C\r".to_vec()]);
    }

    #[tokio::test]
    async fn test_write_connects_when_absent() {
        let adapter = MockAdapter::new();
        let endpoint = endpoint(&adapter);

        endpoint.write(b"ATI\r").await.unwrap();
        assert!(endpoint.is_connected().await);
        assert_eq!(adapter.written(), vec![b"ATI\r".to_vec()]);
    }

    #[tokio::test]
    async fn test_write_fails_when_connect_fails() {
        let adapter = MockAdapter::new();
        adapter.refuse_connections(true);
        let endpoint = endpoint(&adapter);

        assert!(endpoint.write(b"ATI\r").await.is_err());
        assert!(adapter.written().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_disconnects() {
        let adapter = MockAdapter::new();
        let endpoint = endpoint(&adapter);
        endpoint.connect().await.unwrap();
        adapter.fail_writes(true);

        assert!(endpoint.write(b"ATZ\r").await.is_err());
        assert!(!endpoint.is_connected().await);
    }

    #[tokio::test]
    async fn test_init_commands_sent_on_connect() {
        let adapter = MockAdapter::new();
        adapter.push_response(b"\r\rELM327 v1.5\r\r>".to_vec());
        adapter.push_response(b"ATE0\rOK\r\r>".to_vec());
        let settings = LinkSettings {
            init_commands: vec!["ATZ".to_string(), "ATE0".to_string()],
            ..Default::default()
        };
        let endpoint = TransportEndpoint::with_settings(adapter.connector(), settings);

        endpoint.connect().await.unwrap();
        assert_eq!(adapter.written(), vec![b"ATZ\r".to_vec(), b"ATE0\r".to_vec()]);

        // Init replies were consumed, nothing leaks into the read stream
        adapter.push_response(b"41 00 BE\r>".to_vec());
        let mut chunks = endpoint.read().await;
        assert_eq!(timeout(WAIT, chunks.recv()).await.unwrap(), Some(b"41 00 BE\r>".to_vec()));
    }

    #[tokio::test]
    async fn test_init_waits_for_slow_reset_banner() {
        let adapter = MockAdapter::new();
        let settings = LinkSettings {
            init_commands: vec!["ATZ".to_string(), "ATE0".to_string()],
            ..Default::default()
        };
        let endpoint = TransportEndpoint::with_settings(adapter.connector(), settings);

        let connecting = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.connect().await })
        };

        // Several read timeouts pass before the banner shows up
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(adapter.written(), vec![b"ATZ\r".to_vec()]);
        adapter.push_response(b"\r\rELM327 v1.5\r\r>".to_vec());

        tokio::time::sleep(Duration::from_millis(50)).await;
        adapter.push_response(b"OK\r\r>".to_vec());
        timeout(WAIT, connecting).await.unwrap().unwrap().unwrap();
        assert_eq!(adapter.written(), vec![b"ATZ\r".to_vec(), b"ATE0\r".to_vec()]);

        adapter.push_response(b"41 00 BE\r>".to_vec());
        let mut chunks = endpoint.read().await;
        assert_eq!(timeout(WAIT, chunks.recv()).await.unwrap(), Some(b"41 00 BE\r>".to_vec()));
    }

    #[tokio::test]
    async fn test_init_gives_up_after_timeout() {
        let adapter = MockAdapter::new();
        let settings = LinkSettings {
            init_commands: vec!["ATZ".to_string()],
            init_timeout: Duration::from_millis(60),
            ..Default::default()
        };
        let endpoint = TransportEndpoint::with_settings(adapter.connector(), settings);

        timeout(WAIT, endpoint.connect()).await.unwrap().unwrap();
        assert!(endpoint.is_connected().await);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            let bytes = self.0.lock().unwrap_or_else(|p| p.into_inner()).clone();
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap_or_else(|p| p.into_inner()).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_deliberate_disconnect_is_not_reported_as_failure() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let adapter = MockAdapter::new();
        let endpoint = endpoint(&adapter);
        let mut chunks = endpoint.read().await;

        endpoint.disconnect().await;
        assert_eq!(timeout(WAIT, chunks.recv()).await.unwrap(), None);

        let text = logs.text();
        assert!(!text.contains("WARN"), "{}", text);
        assert!(!text.contains("ERROR"), "{}", text);
    }

    #[tokio::test]
    async fn test_init_send_failure_fails_connect() {
        let adapter = MockAdapter::new();
        adapter.fail_writes(true);
        let settings = LinkSettings {
            init_commands: vec!["ATZ".to_string()],
            ..Default::default()
        };
        let endpoint = TransportEndpoint::with_settings(adapter.connector(), settings);

        let err = endpoint.connect().await.unwrap_err();
        assert!(matches!(err, LinkError::InitFailed { .. }));
        assert!(!endpoint.is_connected().await);
    }
}
