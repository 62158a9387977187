//! IQRF mesh gateway library
//!
//! This crate connects an IQRF coordinator to a messaging system. It moves
//! DPA packets between the mesh and JSON messages in both directions.
//!
//! # Architecture
//!
//! The gateway operates in four layers:
//!
//! 1. **Transport** - CDC, Serial (HDLC), SPI or UDP link to the coordinator
//! 2. **Framing** - per-medium wire envelopes around DPA packets
//! 3. **Conversion** - classification and JSON conversion
//! 4. **Bridge** - inbound and outbound queues plus the sender worker
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Enable the `serial` feature for physical UART and CDC ports
//! // Cargo.toml: iqrf-gateway = { version = "0.1", features = ["serial"] }
//!
//! use iqrf_gateway::{create_converter, create_transport, Bridge, GatewayConfigBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfigBuilder::new()
//!         .serial_port("/dev/ttyAMA0")
//!         .build();
//!     config.validate()?;
//!
//!     let transport = create_transport(&config.transport)?;
//!     let converter = create_converter(config.bridge.converter, "001122334455");
//!     let bridge = Bridge::new(transport, converter, config.bridge);
//!     bridge.start().await?;
//!
//!     println!("Coordinator: {}", bridge.read_module_id().await);
//!     while let Some(message) = bridge.drain_one_inbound() {
//!         println!("{}", message.as_str());
//!     }
//!
//!     bridge.destroy().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - physical Serial and CDC ports (requires `libudev-dev` on Linux)
//! - `spi` - physical SPI adapters via spidev
//! - `full` - Enable all transports
//!
//! Transports built from an in-memory stream or SPI bus work without any
//! feature.
//!
//! # Packet Layout
//!
//! DPA packets start with a 6 byte header:
//! - Bytes 0-1: Node address (little-endian u16)
//! - Byte 2: Peripheral number
//! - Byte 3: Peripheral command
//! - Bytes 4-5: Hardware profile id (little-endian u16)
//!
//! Responses add an error code and the DPA value; confirmations carry
//! `0xFF` as error code and hop timing in bytes 7 to 10.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod packet;

pub mod framing;
pub mod interface;

pub mod convert;
pub mod mid;

pub mod bridge;

pub mod test_utils;

pub use config::{
    BridgeConfig, ConverterKind, GatewayConfig, GatewayConfigBuilder, TransportConfig,
};
pub use error::{IqrfError, Result};
pub use packet::{classify, ClassifyError, ConfirmationInfo, DpaFields, Packet, PacketRole};

pub use framing::{CdcFramer, Framer, GatewayFramer, HdlcFramer, SpiFramer};
pub use interface::{
    create_transport, CdcTransport, PacketListener, SerialTransport, SpiBus, SpiMaster,
    SpiTransport, TransportLayer, TransportState, UdpTransport,
};

#[cfg(feature = "spi")]
pub use interface::SpidevBus;

pub use convert::{
    create_converter, ConvertedMessage, DecodedRequest, DpaJsonConverter, MessageConverter,
    SimpleJsonConverter,
};
pub use mid::{probe_module_id, UNKNOWN_MODULE_ID};

pub use bridge::{Bridge, BridgeStats, Messenger};

pub use test_utils::{find_iqrf_device, list_available_devices, DeviceInfo};

pub use config::{
    DEFAULT_BAUD_RATE, DEFAULT_MAX_PACKET_SIZE, DEFAULT_MODULE_ID_TIMEOUT, DEFAULT_UDP_PORT,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
