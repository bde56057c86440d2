//! Connection supervisor
//!
//! Owns the broker transport and the connection state. Only the delivery
//! worker calls into it, so state transitions are serialized; everything else
//! observes the state through a `watch` receiver.
//!
//! A successful [`ConnectionSupervisor::connect`] runs the session setup:
//!
//! 1. announce the client id on `<out_prefix>`
//! 2. clear stale retained state on `<in_topic>` with an empty retained publish
//! 3. subscribe to `<in_topic>`

use crate::config::{BridgeConfig, ConfigError};
use crate::observability::metrics::metrics;
use crate::transport::{BrokerTransport, Credentials, InboundHandler, Qos, TransportError};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// Broker connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything needed to open and set up a broker session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub out_prefix: String,
    pub in_topic: String,
}

impl SessionSettings {
    /// Build from configuration. Credentials are read from the environment now.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, ConfigError> {
        let endpoint = config.mqtt.endpoint()?;
        Ok(Self {
            host: endpoint.host,
            port: endpoint.port,
            client_id: config.bridge.client_id.clone(),
            credentials: config.mqtt.credentials(),
            out_prefix: config.topics.out_prefix.clone(),
            in_topic: config.topics.in_topic.clone(),
        })
    }
}

/// Drives broker session establishment, recovery and teardown
pub struct ConnectionSupervisor<T> {
    transport: T,
    settings: SessionSettings,
    inbound: Option<InboundHandler>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<T: BrokerTransport> ConnectionSupervisor<T> {
    pub fn new(transport: T, settings: SessionSettings, inbound: Option<InboundHandler>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            settings,
            inbound,
            state_tx,
        }
    }

    /// Read-only view of the connection state
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous == next {
            return;
        }

        match (previous, next) {
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!("MQTT connection lost");
                metrics().mqtt_connection_lost();
            }
            (_, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            _ => {
                debug!("MQTT connection state: {:?} -> {:?}", previous, next);
            }
        }
    }

    /// Whether a fully set up session is live. Syncs the state if the
    /// transport has lost it.
    ///
    /// A transport session that never finished setup does not count.
    pub fn is_connected(&self) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let connected = self.transport.is_connected();
        if !connected {
            self.transition(ConnectionState::Disconnected);
        }
        connected
    }

    /// Reconnect to the configured broker
    pub async fn reconnect(&mut self) -> bool {
        let host = self.settings.host.clone();
        let port = self.settings.port;
        self.connect(&host, port).await
    }

    /// Resolve `host`, open a session and set it up.
    ///
    /// Returns false on any failure; the caller owns the backoff.
    pub async fn connect(&mut self, host: &str, port: u16) -> bool {
        let span = crate::connection_span!(host = %host, port = port);
        self.connect_inner(host, port).instrument(span).await
    }

    async fn connect_inner(&mut self, host: &str, port: u16) -> bool {
        info!(client_id = %self.settings.client_id, "Connecting to MQTT broker");
        metrics().mqtt_connection_attempt();

        let addr = match self.transport.resolve(host).await {
            Ok(addr) => {
                info!("Attempting to connect to {} [{}]", host, addr);
                addr
            }
            Err(e) => {
                warn!("Could not resolve {}: {}", host, e);
                metrics().mqtt_connection_failed();
                self.transition(ConnectionState::Disconnected);
                return false;
            }
        };

        self.transition(ConnectionState::Connecting);
        self.transport.set_inbound_handler(self.inbound.clone());

        if let Err(e) = self
            .transport
            .connect(
                addr,
                port,
                &self.settings.client_id,
                self.settings.credentials.as_ref(),
            )
            .await
        {
            if let TransportError::Session {
                last_error,
                return_code,
            } = &e
            {
                debug!(
                    last_error = %last_error,
                    return_code = return_code.as_deref().unwrap_or("none"),
                    "MQTT session rejected"
                );
            }
            warn!("MQTT server not responding, retrying later: {}", e);
            metrics().mqtt_connection_failed();
            self.transition(ConnectionState::Disconnected);
            return false;
        }

        if let Err(e) = self.setup_session().await {
            error!("MQTT session setup failed: {}", e);
            // Without the control subscription the session must not carry data
            if let Err(e) = self.transport.disconnect().await {
                debug!("Error closing half set up session: {}", e);
            }
            metrics().mqtt_connection_failed();
            self.transition(ConnectionState::Disconnected);
            return false;
        }

        metrics().mqtt_connection_established();
        self.transition(ConnectionState::Connected);
        true
    }

    async fn setup_session(&mut self) -> Result<(), TransportError> {
        let client_id = self.settings.client_id.clone();
        let out_prefix = self.settings.out_prefix.clone();
        let in_topic = self.settings.in_topic.clone();

        if let Err(e) = self
            .transport
            .publish(&out_prefix, client_id.as_bytes(), false, Qos::AtMostOnce)
            .await
        {
            warn!("Failed to announce presence on {}: {}", out_prefix, e);
        }

        // Empty retained publish erases whatever was retained on the control topic
        if let Err(e) = self
            .transport
            .publish(&in_topic, &[], true, Qos::AtLeastOnce)
            .await
        {
            warn!("Failed to clear retained state on {}: {}", in_topic, e);
        }

        self.transport.subscribe(&in_topic).await?;
        info!("MQTT topic {} subscribed", in_topic);
        Ok(())
    }

    /// Service keepalives and inbound messages while connected
    pub async fn process_pending_io(&mut self) {
        if let Err(e) = self.transport.process_pending_io().await {
            debug!("MQTT I/O processing failed: {}", e);
        }
        self.is_connected();
    }

    /// Publish through the owned transport
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retained: bool,
        qos: Qos,
    ) -> Result<(), TransportError> {
        self.transport.publish(topic, payload, retained, qos).await
    }

    /// Unsubscribe, drop the inbound handler and close the session.
    ///
    /// Only used at shutdown.
    pub async fn teardown(&mut self) {
        let in_topic = self.settings.in_topic.clone();

        if self.transport.is_connected() {
            if let Err(e) = self.transport.unsubscribe(&in_topic).await {
                warn!("Failed to unsubscribe from {}: {}", in_topic, e);
            }
        }
        self.transport.set_inbound_handler(None);
        self.inbound = None;

        if let Err(e) = self.transport.disconnect().await {
            warn!("Error while disconnecting from broker: {}", e);
        }
        let previous = self.state_tx.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            metrics().mqtt_connection_closed();
        }
        info!("MQTT session torn down");
    }
}
