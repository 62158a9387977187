//! Configuration types for the IQRF gateway
//!
//! This module provides configuration structures for the four physical
//! transports and for the bridge pipeline sitting on top of them.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{IqrfError, Result};

/// Default UART baud rate of IQRF TR modules
pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Default number of SPI send attempts
pub const DEFAULT_SPI_SEND_ATTEMPTS: i32 = 3;

/// Default delay between SPI send attempts
pub const DEFAULT_SPI_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default SPI clock
pub const DEFAULT_SPI_SPEED_HZ: u32 = 250_000;

/// Default UDP port of the IQRF Ethernet gateway
pub const DEFAULT_UDP_PORT: u16 = 55000;

/// Default largest accepted UDP datagram
pub const DEFAULT_MAX_PACKET_SIZE: usize = 500;

/// Default UDP reception timeout
pub const DEFAULT_RECEPTION_TIMEOUT: Duration = Duration::from_millis(100);

/// Default wait for a CDC send reply
pub const DEFAULT_CDC_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default wait for the coordinator module id
pub const DEFAULT_MODULE_ID_TIMEOUT: Duration = Duration::from_secs(10);

/// Main configuration for the gateway library
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Physical transport
    #[serde(default)]
    pub transport: TransportConfig,

    /// Bridge behavior settings
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl GatewayConfig {
    /// Check values that would only fail later at runtime
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        self.bridge.validate()
    }
}

/// Physical transport to the IQRF coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// USB-CDC coordinator (e.g. GW-USB, CK-USB)
    Cdc {
        /// Path to the CDC device (e.g., /dev/ttyACM0)
        port: PathBuf,
        /// How long to wait for a send reply
        #[serde(with = "humantime_serde", default = "default_cdc_response_timeout")]
        response_timeout: Duration,
    },
    /// TR module on a SPI bus
    Spi {
        /// Path to the spidev node (e.g., /dev/spidev0.0)
        port: PathBuf,
        /// Send attempts before giving up, negative for unlimited
        #[serde(default = "default_send_attempts")]
        send_attempts: i32,
        /// Delay between send attempts
        #[serde(with = "humantime_serde", default = "default_retry_delay")]
        retry_delay: Duration,
        /// SPI clock
        #[serde(default = "default_spi_speed")]
        speed_hz: u32,
    },
    /// TR module on a UART
    Serial {
        /// Path to serial port (e.g., /dev/ttyS0, COM3)
        port: PathBuf,
        /// Baud rate (default: 57600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// IQRF Ethernet gateway over UDP
    Udp {
        /// Local address to bind
        #[serde(default = "default_local_addr")]
        local_addr: IpAddr,
        /// Local port to bind
        #[serde(default = "default_udp_port")]
        local_port: u16,
        /// Gateway address
        remote_addr: IpAddr,
        /// Gateway port
        #[serde(default = "default_udp_port")]
        remote_port: u16,
        /// Largest datagram accepted
        #[serde(default = "default_max_packet_size")]
        max_packet_size: usize,
        /// Receive timeout, zero blocks indefinitely
        #[serde(with = "humantime_serde", default = "default_reception_timeout")]
        reception_timeout: Duration,
    },
}

fn default_cdc_response_timeout() -> Duration {
    DEFAULT_CDC_RESPONSE_TIMEOUT
}

fn default_send_attempts() -> i32 {
    DEFAULT_SPI_SEND_ATTEMPTS
}

fn default_retry_delay() -> Duration {
    DEFAULT_SPI_RETRY_DELAY
}

fn default_spi_speed() -> u32 {
    DEFAULT_SPI_SPEED_HZ
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_local_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_udp_port() -> u16 {
    DEFAULT_UDP_PORT
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

fn default_reception_timeout() -> Duration {
    DEFAULT_RECEPTION_TIMEOUT
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Serial {
            port: PathBuf::from("/dev/ttyS0"),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl TransportConfig {
    /// Transport kind, used in logs and transport names
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Cdc { .. } => "cdc",
            TransportConfig::Spi { .. } => "spi",
            TransportConfig::Serial { .. } => "serial",
            TransportConfig::Udp { .. } => "udp",
        }
    }

    /// Device path, for transports that have one
    pub fn port(&self) -> Option<&PathBuf> {
        match self {
            TransportConfig::Cdc { port, .. }
            | TransportConfig::Spi { port, .. }
            | TransportConfig::Serial { port, .. } => Some(port),
            TransportConfig::Udp { .. } => None,
        }
    }

    /// Replace the device path; returns false for UDP
    pub fn set_port(&mut self, new_port: impl Into<PathBuf>) -> bool {
        match self {
            TransportConfig::Cdc { port, .. }
            | TransportConfig::Spi { port, .. }
            | TransportConfig::Serial { port, .. } => {
                *port = new_port.into();
                true
            }
            TransportConfig::Udp { .. } => false,
        }
    }

    /// Check transport values
    pub fn validate(&self) -> Result<()> {
        if let Some(port) = self.port() {
            if port.as_os_str().is_empty() {
                return Err(IqrfError::InvalidConfig(format!(
                    "{} port must not be empty",
                    self.kind()
                )));
            }
        }
        match self {
            TransportConfig::Serial { baud_rate: 0, .. } => Err(IqrfError::InvalidConfig(
                "baud rate must be positive".to_string(),
            )),
            TransportConfig::Spi { send_attempts: 0, .. } => Err(IqrfError::InvalidConfig(
                "SPI send attempts must not be zero".to_string(),
            )),
            TransportConfig::Udp {
                max_packet_size: 0, ..
            } => Err(IqrfError::InvalidConfig(
                "max packet size must be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// JSON flavour used towards the messaging side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConverterKind {
    /// Decoded DPA fields
    #[default]
    Dpa,
    /// Dotted hex payload
    Simple,
}

/// Bridge behavior configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Sender worker poll interval
    #[serde(with = "humantime_serde", default = "default_send_poll_interval")]
    pub send_poll_interval: Duration,

    /// Interval of the publisher draining the inbound queue
    #[serde(with = "humantime_serde", default = "default_publish_interval")]
    pub publish_interval: Duration,

    /// Wait for the coordinator module id
    #[serde(with = "humantime_serde", default = "default_module_id_timeout")]
    pub module_id_timeout: Duration,

    /// JSON converter
    #[serde(default)]
    pub converter: ConverterKind,

    /// Cap for each bridge queue (unbounded when absent)
    #[serde(default)]
    pub max_queue_len: Option<usize>,
}

fn default_send_poll_interval() -> Duration {
    Duration::from_millis(1)
}

fn default_publish_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_module_id_timeout() -> Duration {
    DEFAULT_MODULE_ID_TIMEOUT
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            send_poll_interval: default_send_poll_interval(),
            publish_interval: default_publish_interval(),
            module_id_timeout: DEFAULT_MODULE_ID_TIMEOUT,
            converter: ConverterKind::Dpa,
            max_queue_len: None,
        }
    }
}

impl BridgeConfig {
    fn validate(&self) -> Result<()> {
        if self.send_poll_interval.is_zero() || self.publish_interval.is_zero() {
            return Err(IqrfError::InvalidConfig(
                "bridge intervals must be positive".to_string(),
            ));
        }
        if self.max_queue_len == Some(0) {
            return Err(IqrfError::InvalidConfig(
                "max queue length must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for GatewayConfig
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a USB-CDC coordinator
    pub fn cdc(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.transport = TransportConfig::Cdc {
            port: port.into(),
            response_timeout: DEFAULT_CDC_RESPONSE_TIMEOUT,
        };
        self
    }

    /// Use a UART TR module at the default baud rate
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.transport = TransportConfig::Serial {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        };
        self
    }

    /// Use a UART TR module with baud rate
    pub fn serial_port_with_baud(mut self, port: impl Into<PathBuf>, baud_rate: u32) -> Self {
        self.config.transport = TransportConfig::Serial {
            port: port.into(),
            baud_rate,
        };
        self
    }

    /// Use a SPI TR module
    pub fn spi(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.transport = TransportConfig::Spi {
            port: port.into(),
            send_attempts: DEFAULT_SPI_SEND_ATTEMPTS,
            retry_delay: DEFAULT_SPI_RETRY_DELAY,
            speed_hz: DEFAULT_SPI_SPEED_HZ,
        };
        self
    }

    /// Use an Ethernet gateway
    pub fn udp(mut self, remote_addr: IpAddr, remote_port: u16) -> Self {
        self.config.transport = TransportConfig::Udp {
            local_addr: default_local_addr(),
            local_port: DEFAULT_UDP_PORT,
            remote_addr,
            remote_port,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            reception_timeout: DEFAULT_RECEPTION_TIMEOUT,
        };
        self
    }

    /// Set the JSON converter
    pub fn converter(mut self, kind: ConverterKind) -> Self {
        self.config.bridge.converter = kind;
        self
    }

    /// Cap both bridge queues
    pub fn max_queue_len(mut self, len: usize) -> Self {
        self.config.bridge.max_queue_len = Some(len);
        self
    }

    /// Set the module id wait
    pub fn module_id_timeout(mut self, timeout: Duration) -> Self {
        self.config.bridge.module_id_timeout = timeout;
        self
    }

    /// Set the publisher interval
    pub fn publish_interval(mut self, interval: Duration) -> Self {
        self.config.bridge.publish_interval = interval;
        self
    }

    /// Build the configuration
    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
