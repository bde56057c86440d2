//! Configuration for the telemetry bridge
//!
//! Loaded once at startup from a TOML file. Broker credentials are not stored
//! in the file; it names the environment variables that hold them, and they
//! are read at connect time.

use crate::codec::Encoding;
use crate::transport::{Credentials, Qos};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Top-level bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub bridge: BridgeSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub topics: TopicsSection,
}

/// Bridge section: identity, queue and worker timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSection {
    /// MQTT client identifier, also the announcement payload (must match [a-zA-Z0-9._-]+)
    pub client_id: String,
    /// Maximum number of queued outbound messages
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Payload encoding for outbound messages
    #[serde(default)]
    pub encoding: Encoding,
    /// Bounded wait for the next queued message (default: 1000ms)
    #[serde(default = "default_peek_timeout_ms")]
    pub peek_timeout_ms: u64,
    /// Fixed delay between reconnection attempts (default: 5s)
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://host:port` or `mqtts://host:port`
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// MQTT keep-alive in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// QoS level for telemetry publishes (0 or 1)
    #[serde(default = "default_data_qos")]
    pub data_qos: u8,
    /// How long to wait for the broker to accept a session or confirm a publish
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Topic section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicsSection {
    /// Prefix for outbound topics; messages go to `<out_prefix>/<port>`
    #[serde(default = "default_out_prefix")]
    pub out_prefix: String,
    /// Control topic carrying base64 commands
    #[serde(default = "default_in_topic")]
    pub in_topic: String,
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            out_prefix: default_out_prefix(),
            in_topic: default_in_topic(),
        }
    }
}

fn default_queue_capacity() -> usize {
    8
}

fn default_peek_timeout_ms() -> u64 {
    1000
}

fn default_retry_interval_secs() -> u64 {
    5
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_data_qos() -> u8 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_out_prefix() -> String {
    "paxout".to_string()
}

fn default_in_topic() -> String {
    "paxin".to_string()
}

/// Broker host and port extracted from `broker_url`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client ID format: {0}")]
    InvalidClientId(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.bridge.client_id)?;

        if self.bridge.queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.bridge.peek_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge.peek_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if Qos::from_level(self.mqtt.data_qos).is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.data_qos must be 0 or 1, got {}",
                self.mqtt.data_qos
            )));
        }
        if self.topics.out_prefix.is_empty() || self.topics.in_topic.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "topics.out_prefix and topics.in_topic must not be empty".to_string(),
            ));
        }

        self.mqtt.endpoint()?;
        Ok(())
    }

    pub fn peek_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge.peek_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.bridge.retry_interval_secs)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[bridge]
client_id = "test-bridge"
queue_capacity = 4

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

impl MqttSection {
    /// Parse `broker_url` into host, port and TLS flag
    pub fn endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        let url = Url::parse(&self.broker_url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(self.broker_url.clone()))?;

        let tls = match url.scheme() {
            "mqtt" => false,
            "mqtts" => true,
            _ => return Err(ConfigError::InvalidBrokerUrl(self.broker_url.clone())),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(self.broker_url.clone()))?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(BrokerEndpoint {
            host: host.to_string(),
            port,
            tls,
        })
    }

    /// QoS for telemetry publishes; validated at load time
    pub fn data_qos(&self) -> Qos {
        Qos::from_level(self.data_qos).unwrap_or(Qos::AtLeastOnce)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Read broker credentials from the configured environment variables.
    ///
    /// Returns `None` when no username variable is configured or set. A
    /// missing password variable yields an empty password.
    pub fn credentials(&self) -> Option<Credentials> {
        let username = get_env_var_optional(self.username_env.as_ref())?;
        let password = get_env_var_optional(self.password_env.as_ref()).unwrap_or_default();
        Some(Credentials { username, password })
    }

    /// Like [`credentials`](Self::credentials) but fails when a configured
    /// variable is missing
    pub fn require_credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        let Some(username_env) = &self.username_env else {
            return Ok(None);
        };
        let username = get_env_var_required(username_env)?;
        let password = match &self.password_env {
            Some(name) => get_env_var_required(name)?,
            None => String::new(),
        };
        Ok(Some(Credentials { username, password }))
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

/// Validate MQTT client ID format
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[bridge]
client_id = "paxcounter-01"
queue_capacity = 16
encoding = "summary"
peek_timeout_ms = 250
retry_interval_secs = 3

[mqtt]
broker_url = "mqtts://broker.example.com"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
keep_alive_secs = 30
data_qos = 0
connect_timeout_secs = 4

[topics]
out_prefix = "sensors/out"
in_topic = "sensors/in"
"#;

        let config = BridgeConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.bridge.client_id, "paxcounter-01");
        assert_eq!(config.bridge.queue_capacity, 16);
        assert_eq!(config.bridge.encoding, Encoding::Summary);
        assert_eq!(config.peek_timeout(), Duration::from_millis(250));
        assert_eq!(config.retry_interval(), Duration::from_secs(3));
        assert_eq!(config.mqtt.data_qos(), Qos::AtMostOnce);
        assert_eq!(config.mqtt.keep_alive(), Duration::from_secs(30));
        assert_eq!(config.topics.out_prefix, "sensors/out");

        let endpoint = config.mqtt.endpoint().unwrap();
        assert_eq!(endpoint.host, "broker.example.com");
        assert_eq!(endpoint.port, 8883);
        assert!(endpoint.tls);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = BridgeConfig::test_config();
        assert_eq!(config.bridge.encoding, Encoding::Base64);
        assert_eq!(config.bridge.peek_timeout_ms, 1000);
        assert_eq!(config.bridge.retry_interval_secs, 5);
        assert_eq!(config.mqtt.data_qos(), Qos::AtLeastOnce);
        assert_eq!(config.topics, TopicsSection::default());
        assert_eq!(config.topics.out_prefix, "paxout");
        assert_eq!(config.topics.in_topic, "paxin");

        let endpoint = config.mqtt.endpoint().unwrap();
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 1883);
        assert!(!endpoint.tls);
    }

    #[test]
    fn test_invalid_client_id() {
        assert!(validate_client_id("bad id").is_err());
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("node_7.a-b").is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = BridgeConfig::test_config();
        config.bridge.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let mut config = BridgeConfig::test_config();
        config.mqtt.data_qos = 2;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = BridgeConfig::test_config();
        config.mqtt.broker_url = "http://localhost:1883".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBrokerUrl(_))));

        config.mqtt.broker_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_empty_topics_rejected() {
        let mut config = BridgeConfig::test_config();
        config.topics.in_topic.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_encoding_fails_to_parse() {
        let toml_content = r#"
[bridge]
client_id = "x"
encoding = "protobuf"

[mqtt]
broker_url = "mqtt://localhost"
"#;
        assert!(matches!(
            BridgeConfig::from_toml_str(toml_content),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[bridge]\nclient_id = \"file-bridge\"\n\n[mqtt]\nbroker_url = \"mqtt://10.0.0.2:1884\"\n"
        )
        .unwrap();

        let config = BridgeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.bridge.client_id, "file-bridge");
        assert_eq!(config.mqtt.endpoint().unwrap().port, 1884);
    }

    #[test]
    fn test_missing_file() {
        let result = BridgeConfig::load_from_file(Path::new("/nonexistent/bridge.toml"));
        assert!(matches!(result, Err(ConfigError::FileRead(_))));
    }

    #[test]
    fn test_credentials_without_env_config() {
        let config = BridgeConfig::test_config();
        assert_eq!(config.mqtt.credentials(), None);
        assert_eq!(config.mqtt.require_credentials().unwrap(), None);
    }

    #[test]
    fn test_required_credentials_missing_env() {
        let mut config = BridgeConfig::test_config();
        config.mqtt.username_env = Some("TELEMETRY_BRIDGE_TEST_UNSET_USER".to_string());
        assert_eq!(config.mqtt.credentials(), None);
        assert!(matches!(
            config.mqtt.require_credentials(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }
}
