//! In-memory broker for tests and dry runs

use crate::error::MessagingError;
use crate::session::{Broker, QosLevel, Session, SessionEvent, SessionEvents, SessionSettings};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

type EventSender = mpsc::UnboundedSender<Result<SessionEvent, MessagingError>>;

/// A publish seen by the mock broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub qos: QosLevel,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    refuse: bool,
    stall: bool,
    fail_publish: bool,
    sessions: usize,
    disconnects: usize,
    subscriptions: Vec<(String, QosLevel)>,
    published: Vec<Published>,
    inbound: Option<EventSender>,
}

/// Simulated MQTT broker. Clones share state.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Refuse subsequent handshakes
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    /// Never answer subsequent handshakes
    pub fn stall_handshake(&self, stall: bool) {
        self.lock().stall = stall;
    }

    /// Make publishes fail without closing the session
    pub fn fail_publishes(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    /// Send a message to the current session
    pub fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let event = SessionEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        };
        if let Some(inbound) = self.lock().inbound.as_ref() {
            let _ = inbound.send(Ok(event));
        }
    }

    /// Whether the current session's events are still being consumed
    pub fn has_listener(&self) -> bool {
        self.lock().inbound.as_ref().is_some_and(|inbound| !inbound.is_closed())
    }

    /// Break the current session from the broker side
    pub fn drop_connection(&self) {
        if let Some(inbound) = self.lock().inbound.take() {
            let _ = inbound.send(Err(MessagingError::Connection(
                "connection reset by broker".to_string(),
            )));
        }
    }

    /// Subscriptions made so far, across all sessions
    pub fn subscriptions(&self) -> Vec<(String, QosLevel)> {
        self.lock().subscriptions.clone()
    }

    /// Publishes received so far, across all sessions
    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// Number of sessions opened
    pub fn session_count(&self) -> usize {
        self.lock().sessions
    }

    /// Number of DISCONNECT requests received
    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Broker for MockBroker {
    fn open(&self, settings: &SessionSettings) -> (Arc<dyn Session>, Box<dyn SessionEvents>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.sessions += 1;
        debug!("Mock broker session #{} for {}", state.sessions, settings.client_id);

        if state.refuse {
            let _ = tx.send(Err(MessagingError::Connection("connection refused".to_string())));
        } else if !state.stall {
            let _ = tx.send(Ok(SessionEvent::Connected));
        }
        state.inbound = Some(tx.clone());

        (
            Arc::new(MockSession {
                state: Arc::clone(&self.state),
                events: tx,
            }),
            Box::new(MockEvents { rx }),
        )
    }
}

struct MockSession {
    state: Arc<Mutex<BrokerState>>,
    events: EventSender,
}

#[async_trait]
impl Session for MockSession {
    fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), MessagingError> {
        lock(&self.state).subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QosLevel, payload: Vec<u8>) -> Result<(), MessagingError> {
        let mut state = lock(&self.state);
        if state.fail_publish {
            return Err(MessagingError::Publish("simulated publish failure".to_string()));
        }
        state.published.push(Published {
            topic: topic.to_string(),
            qos,
            payload,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MessagingError> {
        lock(&self.state).disconnects += 1;
        // Outgoing DISCONNECT shows up on the event stream like any other packet
        let _ = self.events.send(Ok(SessionEvent::Other));
        Ok(())
    }
}

struct MockEvents {
    rx: mpsc::UnboundedReceiver<Result<SessionEvent, MessagingError>>,
}

#[async_trait]
impl SessionEvents for MockEvents {
    async fn poll(&mut self) -> Result<SessionEvent, MessagingError> {
        match self.rx.recv().await {
            Some(event) => event,
            None => Err(MessagingError::Connection("session closed".to_string())),
        }
    }
}
