//! rumqttc-backed implementation of [`BrokerTransport`](crate::transport::BrokerTransport)
//!
//! - [`connection`] - pure session option building
//! - [`message_handler`] - pure routing of rumqttc events
//! - [`client`] - the transport itself, which owns the client and event loop
//!
//! # Usage
//!
//! ```rust,no_run
//! use telemetry_bridge::config::BridgeConfig;
//! use telemetry_bridge::transport::mqtt::MqttTransport;
//! use telemetry_bridge::transport::BrokerTransport;
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
//! let mut transport = MqttTransport::from_config(&config.mqtt);
//! let addr = transport.resolve("localhost").await?;
//! transport.connect(addr, 1883, "paxcounter-01", None).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttTransport;
pub use connection::{configure_mqtt_options, TransportOptions};
pub use message_handler::{EventRoute, MessageHandler};
