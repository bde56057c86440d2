//! Transport abstraction for the telemetry bridge
//!
//! The bridge never talks to a socket directly. The broker session goes
//! through [`BrokerTransport`] and the underlying network link through
//! [`NetworkLink`], so the delivery worker can be driven by mocks in tests and
//! by the rumqttc-backed [`mqtt::MqttTransport`] in production.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

pub mod mqtt;

/// Handler invoked by the transport for every inbound publish: `(topic, payload)`.
///
/// Runs inside the transport's I/O processing, so it must not block.
pub type InboundHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Delivery guarantee requested for a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl Qos {
    /// Map a numeric MQTT QoS level; only 0 and 1 are supported
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
        }
    }
}

/// Broker credentials passed to [`BrokerTransport::connect`]
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Transport-level failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Could not resolve broker host {0}")]
    Resolution(String),
    #[error("Broker session rejected: {last_error} (rc = {})", .return_code.as_deref().unwrap_or("none"))]
    Session {
        last_error: String,
        return_code: Option<String>,
    },
    #[error("Publish failed: {0}")]
    Publish(String),
    #[error("Subscription failed: {0}")]
    Subscription(String),
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Transport I/O error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn session<S: Into<String>>(last_error: S) -> Self {
        Self::Session {
            last_error: last_error.into(),
            return_code: None,
        }
    }
}

/// Broker protocol client consumed by the bridge
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Resolve the broker host name to an address
    async fn resolve(&self, host: &str) -> Result<IpAddr, TransportError>;

    /// Open a session with the broker. Succeeds only once the broker accepted it.
    async fn connect(
        &mut self,
        addr: IpAddr,
        port: u16,
        client_id: &str,
        credentials: Option<&Credentials>,
    ) -> Result<(), TransportError>;

    /// Whether the session is currently live
    fn is_connected(&self) -> bool;

    /// Publish `payload` on `topic`. Succeeds only once delivery is confirmed
    /// for the requested QoS.
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retained: bool,
        qos: Qos,
    ) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Install or clear the inbound message handler
    fn set_inbound_handler(&mut self, handler: Option<InboundHandler>);

    /// Service pending network I/O: keepalives and inbound messages.
    /// Must be called periodically while connected.
    async fn process_pending_io(&mut self) -> Result<(), TransportError>;

    /// Close the session
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Underlying network link (Wi-Fi, Ethernet) managed outside the bridge
#[async_trait]
pub trait NetworkLink: Send + Sync {
    /// Bring the link up if needed. Returns false if it cannot be established.
    async fn ensure_up(&self) -> bool;
}

/// Link for hosts where the operating system manages connectivity
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysUp;

#[async_trait]
impl NetworkLink for AlwaysUp {
    async fn ensure_up(&self) -> bool {
        true
    }
}
