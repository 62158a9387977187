//! Framers turning raw medium bytes into [`Packet`]s and back
//!
//! Each physical transport wraps packets differently:
//!
//! - [`hdlc::HdlcFramer`] - UART, HDLC-like byte stuffing with CRC-8
//! - [`gweth::GatewayFramer`] - UDP gateway envelope with CRC-16
//! - [`spi::SpiFramer`] - SPI master frames with XOR checksum
//! - [`cdc::CdcFramer`] - USB-CDC, the driver already delivers whole messages

pub mod cdc;
pub mod gweth;
pub mod hdlc;
pub mod spi;

pub use cdc::CdcFramer;
pub use gweth::{GatewayFramer, GatewayMessage};
pub use hdlc::{FrameChunker, HdlcFramer};
pub use spi::SpiFramer;

use crate::error::Result;
use crate::packet::Packet;
use bytes::Bytes;

/// Conversion between packets and one transport's wire frames
pub trait Framer: Send + Sync {
    /// Wrap a packet into a complete wire frame
    fn encode(&self, packet: &Packet) -> Result<Bytes>;

    /// Extract the packet carried by one complete wire frame
    fn decode(&self, frame: &[u8]) -> Result<Packet>;
}
