//! Pure routing of rumqttc events
//!
//! Turns raw MQTT v5 events into the handful of outcomes the transport cares
//! about: session accepted, inbound message, publish or subscription
//! confirmed, and broker disconnect.

use crate::transport::Qos;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{mqttbytes::QoS, Event};
use rumqttc::Outgoing;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                },
                Packet::PubAck(_) => EventRoute::PublishAcknowledged,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    reason_codes: suback
                        .return_codes
                        .iter()
                        .map(|code| format!("{code:?}"))
                        .collect(),
                },
                Packet::UnsubAck(_) => EventRoute::UnsubscriptionConfirmed,
                Packet::Disconnect(_) => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(_)) => EventRoute::PublishSent,
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Whether `route` confirms a publish made with `qos`.
    ///
    /// QoS 1 needs the broker's PUBACK. QoS 0 is confirmed once the event
    /// loop has written the PUBLISH packet itself out.
    pub fn confirms_publish(route: &EventRoute, qos: Qos) -> bool {
        match qos {
            Qos::AtLeastOnce => matches!(route, EventRoute::PublishAcknowledged),
            Qos::AtMostOnce => matches!(route, EventRoute::PublishSent),
        }
    }

    /// Map the bridge QoS onto rumqttc's
    pub fn to_mqtt_qos(qos: Qos) -> QoS {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the session
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// Broker acknowledged a QoS 1 publish
    PublishAcknowledged,
    /// Subscription confirmed with reason codes
    SubscriptionConfirmed { reason_codes: Vec<String> },
    UnsubscriptionConfirmed,
    /// Broker closed the session
    Disconnected,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// PUBLISH packet written to the network
    PublishSent,
    /// DISCONNECT packet written to the network
    DisconnectSent,
    /// Any other request written to the network
    OutgoingEvent,
}
