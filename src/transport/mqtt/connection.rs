//! Pure session option building for the rumqttc transport

use crate::config::MqttSection;
use crate::transport::Credentials;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;

/// Size of rumqttc's request channel between client and event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Settings that stay fixed across sessions
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub keep_alive: Duration,
    /// Bound on waiting for ConnAck, PubAck and SubAck
    pub ack_timeout: Duration,
    /// Host name for TLS verification; `None` means plain TCP
    pub tls_host: Option<String>,
    pub request_capacity: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(10),
            tls_host: None,
            request_capacity: REQUEST_CHANNEL_CAPACITY,
        }
    }
}

impl TransportOptions {
    /// Build from the `[mqtt]` section. An invalid URL has already been
    /// rejected at config load, so it falls back to plain TCP here.
    pub fn from_config(config: &MqttSection) -> Self {
        let tls_host = config
            .endpoint()
            .ok()
            .filter(|endpoint| endpoint.tls)
            .map(|endpoint| endpoint.host);

        Self {
            keep_alive: config.keep_alive(),
            ack_timeout: config.connect_timeout(),
            tls_host,
            request_capacity: REQUEST_CHANNEL_CAPACITY,
        }
    }
}

/// Pure function to build rumqttc options for one session
pub fn configure_mqtt_options(
    client_id: &str,
    broker_host: &str,
    port: u16,
    credentials: Option<&Credentials>,
    options: &TransportOptions,
) -> MqttOptions {
    // TLS must verify against the configured host name, not the resolved address
    let host = options.tls_host.as_deref().unwrap_or(broker_host);
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if options.tls_host.is_some() {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = credentials {
        mqtt_options.set_credentials(
            credentials.username.as_str(),
            credentials.password.as_str(),
        );
    }

    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_start(true);

    mqtt_options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;

    #[test]
    fn test_options_from_plain_config() {
        let config = BridgeConfig::test_config();
        let options = TransportOptions::from_config(&config.mqtt);
        assert!(options.tls_host.is_none());
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        assert_eq!(options.ack_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_options_from_tls_config() {
        let mut config = BridgeConfig::test_config();
        config.mqtt.broker_url = "mqtts://broker.example.com:8883".to_string();
        let options = TransportOptions::from_config(&config.mqtt);
        assert_eq!(options.tls_host.as_deref(), Some("broker.example.com"));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let credentials = Credentials {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let options = configure_mqtt_options(
            "paxcounter-01",
            "10.0.0.5",
            1883,
            Some(&credentials),
            &TransportOptions::default(),
        );

        assert_eq!(options.client_id(), "paxcounter-01");
        assert_eq!(options.broker_address(), ("10.0.0.5".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_tls_uses_host_name() {
        let options = TransportOptions {
            tls_host: Some("broker.example.com".to_string()),
            ..Default::default()
        };
        let mqtt_options = configure_mqtt_options("c", "203.0.113.9", 8883, None, &options);
        assert_eq!(
            mqtt_options.broker_address(),
            ("broker.example.com".to_string(), 8883)
        );
    }
}
