//! rumqttc-backed broker transport
//!
//! The event loop is never run on a background task. It is polled only from
//! the delivery worker's own calls (`connect`, `publish`, `subscribe`,
//! `process_pending_io`), so inbound messages are dispatched on the worker's
//! task and never overlap a publish. After a network error the session is
//! dropped rather than letting rumqttc reconnect on its own; reconnection
//! belongs to the connection supervisor.

use super::connection::{configure_mqtt_options, TransportOptions};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::transport::{BrokerTransport, Credentials, InboundHandler, Qos, TransportError};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, EventLoop};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long `process_pending_io` waits for each further event
const IO_POLL_SLICE: Duration = Duration::from_millis(10);

/// Upper bound on events handled per `process_pending_io` call
const MAX_EVENTS_PER_POLL: usize = 32;

struct Session {
    client: AsyncClient,
    // EventLoop is Send but not Sync; only polled through get_mut()
    event_loop: Mutex<EventLoop>,
}

/// MQTT v5 transport built on rumqttc
pub struct MqttTransport {
    options: TransportOptions,
    session: Option<Session>,
    connected: bool,
    inbound: Option<InboundHandler>,
}

impl MqttTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            session: None,
            connected: false,
            inbound: None,
        }
    }

    pub fn from_config(config: &MqttSection) -> Self {
        Self::new(TransportOptions::from_config(config))
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        match (&self.session, self.connected) {
            (Some(session), true) => Ok(&session.client),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn drop_session(&mut self, reason: &str) {
        if self.session.take().is_some() {
            warn!("MQTT session dropped: {}", reason);
        }
        self.connected = false;
    }

    /// Poll the event loop once, waiting at most until `deadline`.
    ///
    /// Returns `Ok(None)` on timeout. Inbound messages are dispatched before
    /// the route is returned.
    async fn poll_until(&mut self, deadline: Instant) -> Result<Option<EventRoute>, ConnectionError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };

        let poll = session.event_loop.get_mut().poll();
        let event = match tokio::time::timeout_at(deadline, poll).await {
            Ok(result) => result?,
            Err(_) => return Ok(None),
        };

        let route = MessageHandler::route_mqtt_event(&event);
        match &route {
            EventRoute::MessageReceived { topic, payload, .. } => {
                debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", topic);
                if let Some(handler) = &self.inbound {
                    handler(topic.as_str(), payload.as_slice());
                }
            }
            EventRoute::Disconnected => {
                self.drop_session("broker sent DISCONNECT");
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
            }
            _ => {}
        }
        Ok(Some(route))
    }

    /// Drive the event loop until `done` accepts a route or the ack timeout
    /// elapses.
    async fn wait_for<F>(&mut self, what: &str, done: F) -> Result<(), TransportError>
    where
        F: Fn(&EventRoute) -> bool,
    {
        let deadline = Instant::now() + self.options.ack_timeout;
        loop {
            if self.session.is_none() {
                return Err(TransportError::NotConnected);
            }
            match self.poll_until(deadline).await {
                Ok(Some(route)) if done(&route) => return Ok(()),
                Ok(Some(_)) => continue,
                Ok(None) => {
                    return Err(TransportError::Io(format!("Timed out waiting for {what}")));
                }
                Err(e) => {
                    let message = e.to_string();
                    self.drop_session(&message);
                    return Err(TransportError::Io(message));
                }
            }
        }
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn resolve(&self, host: &str) -> Result<IpAddr, TransportError> {
        let mut addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| TransportError::Resolution(format!("{host}: {e}")))?;
        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| TransportError::Resolution(host.to_string()))
    }

    async fn connect(
        &mut self,
        addr: IpAddr,
        port: u16,
        client_id: &str,
        credentials: Option<&Credentials>,
    ) -> Result<(), TransportError> {
        self.drop_session("starting new session");

        let mqtt_options = configure_mqtt_options(
            client_id,
            &addr.to_string(),
            port,
            credentials,
            &self.options,
        );
        let (client, event_loop) = AsyncClient::new(mqtt_options, self.options.request_capacity);
        self.session = Some(Session {
            client,
            event_loop: Mutex::new(event_loop),
        });

        let deadline = Instant::now() + self.options.ack_timeout;
        loop {
            match self.poll_until(deadline).await {
                Ok(Some(EventRoute::ConnectionAcknowledged)) => {
                    self.connected = true;
                    info!(%addr, port, client_id, "MQTT session established");
                    return Ok(());
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    self.drop_session("ConnAck timeout");
                    return Err(TransportError::session(
                        "ConnAck timeout - no connection confirmation received",
                    ));
                }
                Err(ConnectionError::ConnectionRefused(code)) => {
                    self.drop_session("connection refused");
                    return Err(TransportError::Session {
                        last_error: "connection refused".to_string(),
                        return_code: Some(format!("{code:?}")),
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    self.drop_session(&message);
                    return Err(TransportError::session(message));
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected && self.session.is_some()
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retained: bool,
        qos: Qos,
    ) -> Result<(), TransportError> {
        self.client()?
            .publish(
                topic,
                MessageHandler::to_mqtt_qos(qos),
                retained,
                payload.to_vec(),
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        self.wait_for("publish confirmation", |route| {
            MessageHandler::confirms_publish(route, qos)
        })
        .await
        .map_err(|e| match e {
            TransportError::Io(message) => TransportError::Publish(message),
            other => other,
        })
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscription(e.to_string()))?;

        self.wait_for("SubAck", |route| {
            if let EventRoute::SubscriptionConfirmed { reason_codes } = route {
                debug!(target: "mqtt_transport", "Subscription confirmed: {:?}", reason_codes);
                true
            } else {
                false
            }
        })
        .await
        .map_err(|e| TransportError::Subscription(e.to_string()))
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Subscription(e.to_string()))?;

        self.wait_for("UnsubAck", |route| {
            matches!(route, EventRoute::UnsubscriptionConfirmed)
        })
        .await
    }

    fn set_inbound_handler(&mut self, handler: Option<InboundHandler>) {
        self.inbound = handler;
    }

    async fn process_pending_io(&mut self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        for _ in 0..MAX_EVENTS_PER_POLL {
            match self.poll_until(Instant::now() + IO_POLL_SLICE).await {
                Ok(Some(_)) if self.is_connected() => continue,
                Ok(Some(_)) => return Err(TransportError::NotConnected),
                Ok(None) => break,
                Err(e) => {
                    let message = e.to_string();
                    self.drop_session(&message);
                    return Err(TransportError::Io(message));
                }
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(session) = self.session.as_ref() else {
            self.connected = false;
            return Ok(());
        };

        let result = session
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Io(e.to_string()));

        // Let the event loop write the DISCONNECT before dropping it
        if result.is_ok() {
            let _ = self.wait_for("DISCONNECT", |route| {
                matches!(route, EventRoute::DisconnectSent)
            })
            .await;
        }

        self.session = None;
        self.connected = false;
        info!("MQTT client disconnected");
        result
    }
}
