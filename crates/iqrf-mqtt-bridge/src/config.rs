//! Application configuration loaded from TOML

use std::path::Path;

use anyhow::Context;
use iqrf_gateway::GatewayConfig;
use serde::{Deserialize, Serialize};

/// Whole application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeAppConfig {
    /// Transport and bridge settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Broker connection
    #[serde(default)]
    pub mqtt: MqttConfig,
}

impl BridgeAppConfig {
    /// Read and parse a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client id; a random one is generated when absent
    #[serde(default)]
    pub client_id: Option<String>,

    /// Start with a clean session
    #[serde(default)]
    pub clean_session: bool,

    /// Optional credentials
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Prepended to every topic (e.g. "building1/")
    #[serde(default)]
    pub topic_prefix: String,

    /// QoS for publish and subscribe (0, 1 or 2)
    #[serde(default)]
    pub qos: u8,

    /// Keep alive in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_broker() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            port: default_mqtt_port(),
            client_id: None,
            clean_session: false,
            username: None,
            password: None,
            topic_prefix: String::new(),
            qos: 0,
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl MqttConfig {
    /// Configured client id or a fresh dashless UUID
    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iqrf_gateway::{ConverterKind, TransportConfig};

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            [gateway.transport]
            type = "cdc"
            port = "/dev/ttyACM0"

            [gateway.bridge]
            converter = "simple"

            [mqtt]
            broker = "broker.local"
            topic_prefix = "site1/"
            username = "gw"
            password = "secret"
            qos = 1
        "#;
        let config: BridgeAppConfig = toml::from_str(raw).unwrap();
        assert!(matches!(
            config.gateway.transport,
            TransportConfig::Cdc { .. }
        ));
        assert_eq!(config.gateway.bridge.converter, ConverterKind::Simple);
        assert_eq!(config.mqtt.broker, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.topic_prefix, "site1/");
        assert_eq!(config.mqtt.qos, 1);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: BridgeAppConfig = toml::from_str("").unwrap();
        assert_eq!(config.mqtt, MqttConfig::default());
        assert_eq!(config.gateway.transport, TransportConfig::default());
    }

    #[test]
    fn test_generated_client_id() {
        let config = MqttConfig::default();
        let id = config.client_id();
        assert_eq!(id.len(), 32);
        assert!(!id.contains('-'));

        let config = MqttConfig {
            client_id: Some("gateway-1".to_string()),
            ..MqttConfig::default()
        };
        assert_eq!(config.client_id(), "gateway-1");
    }

    #[test]
    fn test_missing_file() {
        assert!(BridgeAppConfig::load(Path::new("/nonexistent/bridge.toml")).is_err());
    }
}
