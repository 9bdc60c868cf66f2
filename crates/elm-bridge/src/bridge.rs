//! Bridge Orchestrator
//!
//! Connects the adapter and the broker, relays adapter output to the data
//! topic, forwards commands to the adapter and keeps both sides alive.
//!
//! ```text
//! Stopped -> Connecting -> Running <-> Reconnecting
//!    ^                                      |
//!    +------------------ stop() ------------+
//! ```

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use mqtt_link::{MessagingEndpoint, RumqttBroker};
use obd_link::TransportEndpoint;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Connecting,
    Running,
    Reconnecting,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeState::Stopped => "stopped",
            BridgeState::Connecting => "connecting",
            BridgeState::Running => "running",
            BridgeState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Supervision timing
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Pause between tearing both endpoints down and reconnecting them
    pub reconnect_interval: Duration,
    /// Period of the health check
    pub supervise_interval: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            supervise_interval: Duration::from_secs(1),
        }
    }
}

struct Inner {
    transport: TransportEndpoint,
    messaging: MessagingEndpoint,
    settings: BridgeSettings,
    /// Set while the bridge should be live, cleared by `stop()`
    running: AtomicBool,
    state: watch::Sender<BridgeState>,
    /// Wakes the supervisor early (relay exit, stop)
    wake: Notify,
    relay: Mutex<Option<JoinHandle<()>>>,
    /// Single writer draining commands to the adapter in arrival order
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

/// Owns both endpoints and the tasks that join them
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    pub fn new(transport: TransportEndpoint, messaging: MessagingEndpoint, settings: BridgeSettings) -> Self {
        let (state, _) = watch::channel(BridgeState::Stopped);
        Self {
            inner: Arc::new(Inner {
                transport,
                messaging,
                settings,
                running: AtomicBool::new(false),
                state,
                wake: Notify::new(),
                relay: Mutex::new(None),
                forwarder: Mutex::new(None),
            }),
        }
    }

    /// Build a bridge talking to real hardware and a real broker
    pub fn from_config(config: &BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;

        let transport = match &config.device {
            Some(device) => {
                let connector = obd_link::SerialConnector::new(device, config.baud_rate)
                    .with_read_timeout(config.read_timeout());
                TransportEndpoint::with_settings(connector, config.link_settings())
            }
            None => rfcomm_transport(config)?,
        };
        let messaging = MessagingEndpoint::new(RumqttBroker, config.session_settings()?);
        let settings = BridgeSettings {
            reconnect_interval: Duration::from_secs(config.reconnect_interval_seconds),
            supervise_interval: Duration::from_millis(config.supervise_interval_ms.max(1)),
        };

        Ok(Self::new(transport, messaging, settings))
    }

    pub fn transport(&self) -> &TransportEndpoint {
        &self.inner.transport
    }

    pub fn messaging(&self) -> &MessagingEndpoint {
        &self.inner.messaging
    }

    /// Current state
    pub fn state(&self) -> BridgeState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Connect the adapter, then the broker, and start relaying.
    ///
    /// If the broker cannot be reached the adapter link is closed again, so a
    /// failed connect leaves nothing open.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.inner.running.store(true, Ordering::Release);
        self.set_state(BridgeState::Connecting);

        if let Err(e) = self.establish().await {
            self.inner.running.store(false, Ordering::Release);
            self.set_state(BridgeState::Stopped);
            return Err(e);
        }
        if !self.enter_running().await {
            self.shutdown().await;
            return Err(BridgeError::Stopped);
        }
        Ok(())
    }

    /// Connect and supervise until `stop()` is called.
    ///
    /// Only a failed initial connect is reported; later failures are retried
    /// forever at a fixed interval.
    pub async fn run(&self) -> Result<(), BridgeError> {
        info!(
            "Starting bridge: {} <-> {}:{}",
            self.inner.transport.target(),
            self.inner.messaging.settings().host,
            self.inner.messaging.settings().port
        );

        match self.connect().await {
            Ok(()) => {}
            Err(BridgeError::Stopped) => return Ok(()),
            Err(e) => {
                error!("Bridge failed to start: {}", e);
                return Err(BridgeError::Startup(Box::new(e)));
            }
        }

        while self.is_running() {
            tokio::select! {
                _ = self.inner.wake.notified() => {}
                _ = sleep(self.inner.settings.supervise_interval) => {}
            }
            if !self.is_running() {
                break;
            }
            if let Some(problem) = self.health_problem().await {
                warn!("Bridge unhealthy ({}), reconnecting", problem);
                self.reconnect_cycle().await;
            }
        }

        self.shutdown().await;
        info!("Bridge stopped");
        Ok(())
    }

    /// Stop relaying and close both endpoints
    pub async fn stop(&self) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            info!("Stopping bridge");
        }
        self.inner.wake.notify_one();
        self.shutdown().await;
    }

    /// Connect transport then messaging, rolling the transport back on failure
    async fn establish(&self) -> Result<(), BridgeError> {
        self.inner.transport.connect().await?;
        self.wire_commands().await;

        if let Err(e) = self.inner.messaging.connect().await {
            self.inner.transport.disconnect().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Forward every decoded command to the adapter, one write at a time.
    ///
    /// The handler only queues; a live forwarder is reused across reconnects.
    async fn wire_commands(&self) {
        let mut forwarder = self.inner.forwarder.lock().await;
        if forwarder.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        *forwarder = Some(tokio::spawn(forward_commands(self.inner.transport.clone(), rx)));
        self.inner.messaging.set_on_message_callback(move |command| {
            if tx.send(command).is_err() {
                debug!("Command forwarder stopped, dropping command");
            }
        });
    }

    /// Spawn the relay and mark the bridge running, unless stop() got there first
    async fn enter_running(&self) -> bool {
        let mut relay = self.inner.relay.lock().await;
        if !self.is_running() {
            return false;
        }

        let bridge = self.clone();
        if let Some(previous) = relay.replace(tokio::spawn(async move { bridge.relay().await })) {
            previous.abort();
        }
        self.set_state(BridgeState::Running);
        true
    }

    /// Adapter chunks out to the data topic
    async fn relay(self) {
        debug!("Relay started");
        let mut chunks = self.inner.transport.read().await;

        while let Some(chunk) = chunks.recv().await {
            if !self.is_running() {
                break;
            }
            if let Err(e) = self.inner.messaging.publish(&chunk).await {
                debug!("Dropped {} bytes of adapter data: {}", chunk.len(), e);
            }
        }

        info!("Relay stopped");
        self.inner.wake.notify_one();
    }

    /// Cancel the relay task and wait for it
    async fn stop_relay(&self) {
        let handle = self.inner.relay.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Relay task failed: {}", e);
                }
            }
        }
    }

    async fn relay_alive(&self) -> bool {
        self.inner
            .relay
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn health_problem(&self) -> Option<&'static str> {
        if !self.inner.transport.is_connected().await {
            return Some("adapter link down");
        }
        if !self.inner.messaging.is_connected().await {
            return Some("broker session down");
        }
        if !self.relay_alive().await {
            return Some("relay stopped");
        }
        None
    }

    /// Tear both sides down, wait, and bring them back.
    ///
    /// A failed attempt leaves the bridge reconnecting; the next health check
    /// starts another cycle.
    async fn reconnect_cycle(&self) {
        self.set_state(BridgeState::Reconnecting);
        self.stop_relay().await;
        self.inner.transport.disconnect().await;
        self.inner.messaging.disconnect().await;

        info!(
            "Reconnecting in {}s",
            self.inner.settings.reconnect_interval.as_secs_f32()
        );
        let resume = Instant::now() + self.inner.settings.reconnect_interval;
        while self.is_running() {
            tokio::select! {
                _ = sleep_until(resume) => break,
                _ = self.inner.wake.notified() => {}
            }
        }
        if !self.is_running() {
            return;
        }

        match self.establish().await {
            Ok(()) => {
                if self.enter_running().await {
                    info!("Bridge reconnected");
                }
            }
            Err(e) => warn!("Reconnect failed: {}", e),
        }
    }

    async fn stop_forwarder(&self) {
        let handle = self.inner.forwarder.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Command forwarder failed: {}", e);
                }
            }
        }
    }

    async fn shutdown(&self) {
        self.stop_relay().await;
        self.stop_forwarder().await;
        self.inner.transport.disconnect().await;
        self.inner.messaging.disconnect().await;
        self.set_state(BridgeState::Stopped);
    }

    fn set_state(&self, next: BridgeState) {
        let previous = self.inner.state.send_replace(next);
        if previous != next {
            info!("Bridge {} -> {}", previous, next);
        }
    }
}

async fn forward_commands(transport: TransportEndpoint, mut commands: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(command) = commands.recv().await {
        if let Err(e) = transport.write(&command).await {
            debug!("Command not forwarded to adapter: {}", e);
        }
    }
}

#[cfg(target_os = "linux")]
fn rfcomm_transport(config: &BridgeConfig) -> Result<TransportEndpoint, BridgeError> {
    let connector = obd_link::RfcommConnector::new(&config.address, config.channel)?
        .with_timeouts(config.connect_timeout(), config.read_timeout());
    Ok(TransportEndpoint::with_settings(connector, config.link_settings()))
}

#[cfg(not(target_os = "linux"))]
fn rfcomm_transport(_config: &BridgeConfig) -> Result<TransportEndpoint, BridgeError> {
    Err(crate::error::ConfigError::Invalid(
        "RFCOMM sockets are only available on Linux; set device to a serial port".to_string(),
    )
    .into())
}
