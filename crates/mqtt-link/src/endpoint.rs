//! Messaging Endpoint
//!
//! Owns at most one broker session plus the background task that polls it.
//! Connect and disconnect are serialized by an async mutex.

use crate::codec::{decode_payload, encode_payload};
use crate::error::MessagingError;
use crate::session::{Broker, QosLevel, Session, SessionEvent, SessionEvents, SessionSettings};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Upper bound on one poll of the session events
const SERVICE_INTERVAL: Duration = Duration::from_secs(1);

/// How long a stopping delivery task may take before it is aborted
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Time allowed for a queued DISCONNECT to go out
const FLUSH_INTERVAL: Duration = Duration::from_millis(200);

/// Handler for decoded command payloads
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Session lifecycle hooks shared with the delivery task
struct Dispatch {
    command_topic: String,
    qos: QosLevel,
    handler: RwLock<Option<MessageHandler>>,
}

impl Dispatch {
    fn on_connect(&self, session: &dyn Session) {
        match session.subscribe(&self.command_topic, self.qos) {
            Ok(()) => info!(
                "Subscribed to {} (QoS {})",
                self.command_topic,
                u8::from(self.qos)
            ),
            Err(e) => error!("Failed to subscribe to {}: {}", self.command_topic, e),
        }
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        if topic != self.command_topic {
            debug!("Ignoring message on {}", topic);
            return;
        }

        let handler = match self.handler.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(handler) = handler else {
            debug!("No command handler registered, dropping message");
            return;
        };

        let command = match decode_payload(payload) {
            Ok(command) => command,
            Err(e) => {
                error!("Failed to handle MQTT message: {}", e);
                return;
            }
        };
        debug!("Received command from MQTT: {:?}", String::from_utf8_lossy(&command));

        if panic::catch_unwind(AssertUnwindSafe(|| handler(command))).is_err() {
            error!("Command handler panicked");
        }
    }

    fn on_disconnect(&self, reason: &str) {
        warn!("Unexpected disconnect from MQTT broker: {}", reason);
    }
}

/// A live session and its delivery task
struct Connection {
    session: Arc<dyn Session>,
    connected: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
    delivery: JoinHandle<()>,
}

struct Inner {
    broker: Arc<dyn Broker>,
    settings: SessionSettings,
    dispatch: Arc<Dispatch>,
    handle: Mutex<Option<Connection>>,
}

/// MQTT side of the bridge
#[derive(Clone)]
pub struct MessagingEndpoint {
    inner: Arc<Inner>,
}

impl MessagingEndpoint {
    /// Create a disconnected endpoint
    pub fn new(broker: impl Broker, settings: SessionSettings) -> Self {
        let dispatch = Arc::new(Dispatch {
            command_topic: settings.command_topic.clone(),
            qos: settings.qos,
            handler: RwLock::new(None),
        });

        Self {
            inner: Arc::new(Inner {
                broker: Arc::new(broker),
                settings,
                dispatch,
                handle: Mutex::new(None),
            }),
        }
    }

    /// Session settings in use
    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// Register the command handler, replacing any previous one
    pub fn set_on_message_callback<F>(&self, handler: F)
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(handler);
        match self.inner.dispatch.handler.write() {
            Ok(mut slot) => *slot = Some(handler),
            Err(poisoned) => *poisoned.into_inner() = Some(handler),
        }
    }

    /// Open a session and start delivering messages.
    ///
    /// A connected endpoint is left as is; a session that lost its broker is
    /// torn down and replaced.
    pub async fn connect(&self) -> Result<(), MessagingError> {
        let settings = &self.inner.settings;
        let mut handle = self.inner.handle.lock().await;

        if handle
            .as_ref()
            .is_some_and(|conn| conn.connected.load(Ordering::Acquire))
        {
            return Ok(());
        }
        if let Some(stale) = handle.take() {
            debug!("Discarding stale MQTT session");
            shutdown(stale).await;
        }

        let (session, mut events) = self.inner.broker.open(settings);
        let handshake = match timeout(settings.connect_timeout, handshake(events.as_mut())).await {
            Ok(result) => result,
            Err(_) => Err(MessagingError::Timeout(settings.connect_timeout.as_millis() as u64)),
        };
        if let Err(e) = handshake {
            error!(
                "Failed to connect to MQTT broker {}:{}: {}",
                settings.host, settings.port, e
            );
            return Err(e);
        }
        info!("Connected to MQTT broker {}:{}", settings.host, settings.port);

        self.inner.dispatch.on_connect(session.as_ref());

        let connected = Arc::new(AtomicBool::new(true));
        let (stop, stop_rx) = watch::channel(false);
        let delivery = tokio::spawn(deliver(
            events,
            Arc::clone(&session),
            Arc::clone(&self.inner.dispatch),
            Arc::clone(&connected),
            stop_rx,
        ));

        *handle = Some(Connection {
            session,
            connected,
            stop,
            delivery,
        });
        Ok(())
    }

    /// Close the session if present. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let mut handle = self.inner.handle.lock().await;
        if let Some(conn) = handle.take() {
            shutdown(conn).await;
            info!("Disconnected from MQTT broker");
        }
    }

    /// Whether a session is held and the broker still talks to it
    pub async fn is_connected(&self) -> bool {
        self.connected_session().await.is_some()
    }

    /// Publish adapter bytes to the data topic, reconnecting first if needed.
    ///
    /// A failed publish is reported but leaves the session in place.
    pub async fn publish(&self, payload: &[u8]) -> Result<(), MessagingError> {
        let session = self.live_session().await?;
        let settings = &self.inner.settings;
        let encoded = encode_payload(payload);

        let published = timeout(
            settings.connect_timeout,
            session.publish(&settings.data_topic, settings.qos, encoded.into_bytes()),
        )
        .await
        .unwrap_or_else(|_| Err(MessagingError::Publish("timed out".to_string())));

        match published {
            Ok(()) => {
                debug!("Published {} bytes to {}", payload.len(), settings.data_topic);
                Ok(())
            }
            Err(e) => {
                error!("MQTT publish to {} failed: {}", settings.data_topic, e);
                Err(e)
            }
        }
    }

    async fn connected_session(&self) -> Option<Arc<dyn Session>> {
        self.inner
            .handle
            .lock()
            .await
            .as_ref()
            .filter(|conn| conn.connected.load(Ordering::Acquire))
            .map(|conn| Arc::clone(&conn.session))
    }

    async fn live_session(&self) -> Result<Arc<dyn Session>, MessagingError> {
        if let Some(session) = self.connected_session().await {
            return Ok(session);
        }
        self.connect().await?;
        self.connected_session()
            .await
            .ok_or(MessagingError::NotConnected)
    }
}

/// Poll until the broker answers the CONNECT
async fn handshake(events: &mut dyn SessionEvents) -> Result<(), MessagingError> {
    loop {
        match events.poll().await? {
            SessionEvent::Connected => return Ok(()),
            SessionEvent::Rejected(reason) => return Err(MessagingError::Rejected(reason)),
            SessionEvent::Disconnected => {
                return Err(MessagingError::Connection(
                    "broker closed the connection during handshake".to_string(),
                ))
            }
            SessionEvent::Message { .. } | SessionEvent::Other => {}
        }
    }
}

/// Stop the delivery task, cancelling it if it does not finish in time
async fn shutdown(conn: Connection) {
    if let Err(e) = conn.session.disconnect().await {
        debug!("MQTT disconnect request not queued: {}", e);
    }
    let _ = conn.stop.send(true);
    conn.connected.store(false, Ordering::Release);

    let mut delivery = conn.delivery;
    match timeout(SHUTDOWN_GRACE, &mut delivery).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("MQTT delivery task failed: {}", e),
        Err(_) => {
            delivery.abort();
            if let Err(e) = delivery.await {
                if !e.is_cancelled() {
                    warn!("MQTT delivery task failed: {}", e);
                }
            }
        }
    }
}

async fn deliver(
    mut events: Box<dyn SessionEvents>,
    session: Arc<dyn Session>,
    dispatch: Arc<Dispatch>,
    connected: Arc<AtomicBool>,
    mut stop: watch::Receiver<bool>,
) {
    debug!("MQTT delivery loop started");

    while connected.load(Ordering::Acquire) && !*stop.borrow() {
        tokio::select! {
            _ = stop.changed() => break,
            polled = timeout(SERVICE_INTERVAL, events.poll()) => match polled {
                Err(_) => {}
                Ok(Ok(SessionEvent::Connected)) => dispatch.on_connect(session.as_ref()),
                Ok(Ok(SessionEvent::Message { topic, payload })) => dispatch.on_message(&topic, &payload),
                Ok(Ok(SessionEvent::Disconnected)) => {
                    dispatch.on_disconnect("broker closed the session");
                    connected.store(false, Ordering::Release);
                }
                Ok(Ok(SessionEvent::Rejected(reason))) => {
                    dispatch.on_disconnect(&reason);
                    connected.store(false, Ordering::Release);
                }
                Ok(Ok(SessionEvent::Other)) => {}
                Ok(Err(e)) => {
                    dispatch.on_disconnect(&e.to_string());
                    connected.store(false, Ordering::Release);
                }
            },
        }
        tokio::task::yield_now().await;
    }

    if *stop.borrow() {
        let _ = timeout(FLUSH_INTERVAL, events.poll()).await;
    }
    debug!("MQTT delivery loop stopped");
}
