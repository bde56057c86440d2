//! Telemetry Bridge
//!
//! A store-and-forward bridge between a sensor subsystem and a remote MQTT
//! broker.
//!
//! # Overview
//!
//! - Bounded, non-blocking outbound queue that keeps messages across broker outages
//! - Single delivery worker that removes a message only after the broker confirmed it
//! - Connection supervision with fixed-interval recovery and session setup
//! - Base64 and summary payload codecs
//! - Inbound control topic decoded and handed to a command interpreter
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telemetry_bridge::config::BridgeConfig;
//! use telemetry_bridge::transport::{mqtt::MqttTransport, AlwaysUp};
//! use telemetry_bridge::TelemetryBridge;
//!
//! # tokio_test::block_on(async {
//! let config = BridgeConfig::from_toml_str(r#"
//! [bridge]
//! client_id = "paxcounter-01"
//!
//! [mqtt]
//! broker_url = "mqtt://localhost:1883"
//! "#)?;
//!
//! let bridge = TelemetryBridge::start(
//!     &config,
//!     MqttTransport::from_config(&config.mqtt),
//!     AlwaysUp,
//!     Arc::new(|| {}),
//!     Arc::new(|command: &[u8]| println!("command: {command:?}")),
//! )?;
//!
//! // Two counter bytes on port 1, published as "AQI=" on paxout/1
//! bridge.enqueue(&[0x01, 0x02], 1)?;
//! bridge.shutdown().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod bridge;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod observability;
pub mod queue;
pub mod supervisor;
pub mod testing;
pub mod transport;
pub mod worker;

pub use bridge::{BridgeProducer, TelemetryBridge};
pub use codec::{EncodeBuffer, Encoding};
pub use config::BridgeConfig;
pub use dispatcher::{Command, CommandHandler, InboundDispatcher};
pub use error::{BridgeError, BridgeResult};
pub use queue::{Message, OutboundQueue, MAX_PAYLOAD_SIZE};
pub use supervisor::{ConnectionState, ConnectionSupervisor};
pub use transport::{AlwaysUp, BrokerTransport, NetworkLink, Qos};
pub use worker::{DeliveryWorker, ResumeSignal};
