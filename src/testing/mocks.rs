//! Mock implementations for testing
//!
//! Provides mock BrokerTransport, NetworkLink, ResumeSignal and CommandHandler
//! implementations so the bridge can be exercised without a broker.
//!
//! `MockTransport` is moved into the bridge, so inspection and fault injection
//! go through handles that share its state: [`TransportLog`] and
//! [`TransportControl`].

use crate::dispatcher::CommandHandler;
use crate::transport::{
    BrokerTransport, Credentials, InboundHandler, NetworkLink, Qos, TransportError,
};
use crate::worker::ResumeSignal;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// One call made against the mock transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Resolve(String),
    Connect { port: u16, client_id: String },
    Publish {
        topic: String,
        payload: Vec<u8>,
        retained: bool,
        qos: Qos,
    },
    Subscribe(String),
    Unsubscribe(String),
    Disconnect,
}

/// A publish the mock broker accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
    pub qos: Qos,
}

#[derive(Default)]
struct MockState {
    calls: Vec<TransportCall>,
    publish_attempts: usize,
    connected: bool,
    fail_resolve: bool,
    fail_connect: bool,
    fail_subscribe: bool,
    fail_publishes: usize,
    inbound: Option<InboundHandler>,
    pending_inbound: VecDeque<(String, Vec<u8>)>,
}

type SharedState = Arc<Mutex<MockState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock broker transport
///
/// Confirmed publishes, subscriptions and session calls are recorded in
/// order. Publishes made while disconnected fail with `NotConnected` and are
/// not recorded.
#[derive(Default)]
pub struct MockTransport {
    state: SharedState,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access to the recorded calls
    pub fn log(&self) -> TransportLog {
        TransportLog {
            state: Arc::clone(&self.state),
        }
    }

    /// Fault injection and inbound message injection
    pub fn control(&self) -> TransportControl {
        TransportControl {
            state: Arc::clone(&self.state),
        }
    }

    pub fn has_inbound_handler(&self) -> bool {
        lock(&self.state).inbound.is_some()
    }

    /// Deliver injected inbound messages outside the state lock
    fn deliver_inbound(&self) {
        let (handler, pending) = {
            let mut state = lock(&self.state);
            if !state.connected {
                return;
            }
            let pending: Vec<_> = state.pending_inbound.drain(..).collect();
            (state.inbound.clone(), pending)
        };

        if let Some(handler) = handler {
            for (topic, payload) in pending {
                handler(&topic, &payload);
            }
        }
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn resolve(&self, host: &str) -> Result<IpAddr, TransportError> {
        let mut state = lock(&self.state);
        state.calls.push(TransportCall::Resolve(host.to_string()));
        if state.fail_resolve {
            return Err(TransportError::Resolution(host.to_string()));
        }
        Ok(IpAddr::from([127, 0, 0, 1]))
    }

    async fn connect(
        &mut self,
        _addr: IpAddr,
        port: u16,
        client_id: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.calls.push(TransportCall::Connect {
            port,
            client_id: client_id.to_string(),
        });
        if state.fail_connect {
            state.connected = false;
            return Err(TransportError::Session {
                last_error: "Mock connection failure".to_string(),
                return_code: Some("NotAuthorized".to_string()),
            });
        }
        state.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retained: bool,
        qos: Qos,
    ) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        {
            let mut state = lock(&self.state);
            state.publish_attempts += 1;
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(TransportError::Publish("Mock publish failure".to_string()));
            }
            state.calls.push(TransportCall::Publish {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                retained,
                qos,
            });
        }
        self.deliver_inbound();
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.fail_subscribe {
            return Err(TransportError::Subscription("Mock subscribe failure".to_string()));
        }
        state.calls.push(TransportCall::Subscribe(topic.to_string()));
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.calls.push(TransportCall::Unsubscribe(topic.to_string()));
        Ok(())
    }

    fn set_inbound_handler(&mut self, handler: Option<InboundHandler>) {
        lock(&self.state).inbound = handler;
    }

    async fn process_pending_io(&mut self) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.deliver_inbound();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.calls.push(TransportCall::Disconnect);
        state.connected = false;
        Ok(())
    }
}

/// Shared view of what a [`MockTransport`] was asked to do
#[derive(Clone)]
pub struct TransportLog {
    state: SharedState,
}

impl TransportLog {
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.state).calls.clone()
    }

    /// Confirmed publishes, in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Publish {
                    topic,
                    payload,
                    retained,
                    qos,
                } => Some(PublishedMessage {
                    topic: topic.clone(),
                    payload: payload.clone(),
                    retained: *retained,
                    qos: *qos,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|message| message.topic == topic)
            .collect()
    }

    /// Every publish call, including rejected ones
    pub fn publish_attempts(&self) -> usize {
        lock(&self.state).publish_attempts
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.calls.clear();
        state.publish_attempts = 0;
    }
}

/// Fault injection for a [`MockTransport`]
#[derive(Clone)]
pub struct TransportControl {
    state: SharedState,
}

impl TransportControl {
    pub fn fail_resolve(&self, fail: bool) {
        lock(&self.state).fail_resolve = fail;
    }

    pub fn fail_connect(&self, fail: bool) {
        lock(&self.state).fail_connect = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        lock(&self.state).fail_subscribe = fail;
    }

    /// Reject the next `count` publishes
    pub fn fail_next_publishes(&self, count: usize) {
        lock(&self.state).fail_publishes = count;
    }

    /// Simulate the broker dropping the session
    pub fn drop_connection(&self) {
        lock(&self.state).connected = false;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Queue an inbound message; it is delivered during the next I/O pass
    pub fn inject_inbound(&self, topic: &str, payload: &[u8]) {
        lock(&self.state)
            .pending_inbound
            .push_back((topic.to_string(), payload.to_vec()));
    }
}

/// Network link whose state is set by the test
#[derive(Debug, Clone)]
pub struct MockLink {
    up: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl MockLink {
    pub fn up() -> Self {
        Self {
            up: Arc::new(AtomicBool::new(true)),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn down() -> Self {
        let link = Self::up();
        link.set_up(false);
        link
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// How many times `ensure_up` was called
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkLink for MockLink {
    async fn ensure_up(&self) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.up.load(Ordering::SeqCst)
    }
}

/// Counts resume signals
#[derive(Debug, Clone, Default)]
pub struct RecordingResume {
    count: Arc<AtomicUsize>,
}

impl RecordingResume {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl ResumeSignal for RecordingResume {
    fn resume(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every command handed to the interpreter
#[derive(Debug, Clone, Default)]
pub struct RecordingCommands {
    commands: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl CommandHandler for RecordingCommands {
    fn handle_command(&self, bytes: &[u8]) {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(bytes.to_vec());
    }
}
