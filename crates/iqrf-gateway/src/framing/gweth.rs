//! IQRF Ethernet gateway (GW-ETH) datagram envelope
//!
//! # Layout
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0 | gateway address, always `0x20` |
//! | 1 | command |
//! | 2 | subcommand |
//! | 3-4 | reserved |
//! | 5-6 | packet id (BE) |
//! | 7-8 | data length (BE) |
//! | 9.. | data |
//! | last 2 | CRC-16/CCITT-FALSE over header and data (BE) |
//!
//! The gateway answers requests with the command's bit 7 set. Data coming
//! from the TR module on its own is announced with [`CMD_ASYNC_TR_DATA`].

use std::sync::atomic::{AtomicU16, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_IBM_3740};

use super::Framer;
use crate::error::{IqrfError, Result};
use crate::packet::Packet;

/// Gateway address byte
pub const GW_ADDR: u8 = 0x20;

/// Write data to the TR module
pub const CMD_WRITE_TR: u8 = 0x03;

/// Asynchronous data from the TR module
pub const CMD_ASYNC_TR_DATA: u8 = 0x04;

/// Set on every gateway response
pub const RESPONSE_FLAG: u8 = 0x80;

/// Header length
pub const HEADER_LEN: usize = 9;

/// Trailer (CRC) length
pub const CRC_LEN: usize = 2;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC-16/CCITT-FALSE checksum
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Parsed gateway datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayMessage {
    /// Command byte, including the response flag
    pub command: u8,
    /// Subcommand byte
    pub subcommand: u8,
    /// Packet id
    pub packet_id: u16,
    /// Inner data
    pub data: Bytes,
}

impl GatewayMessage {
    /// Whether the datagram is a gateway answer to one of our requests
    pub fn is_response(&self) -> bool {
        self.command & RESPONSE_FLAG != 0
    }

    /// Whether the datagram carries unsolicited TR data
    pub fn is_async(&self) -> bool {
        self.command & !RESPONSE_FLAG == CMD_ASYNC_TR_DATA
    }
}

/// Framer for the UDP transport
///
/// Every encoded request gets the next packet id.
#[derive(Debug, Default)]
pub struct GatewayFramer {
    packet_id: AtomicU16,
}

impl GatewayFramer {
    /// Create a new framer starting with packet id 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a datagram with arbitrary command bytes
    pub fn encode_with(&self, command: u8, subcommand: u8, data: &[u8]) -> Result<Bytes> {
        let len = u16::try_from(data.len()).map_err(|_| {
            IqrfError::InvalidLength(format!("{} bytes exceed gateway limit", data.len()))
        })?;
        let packet_id = self.packet_id.fetch_add(1, Ordering::Relaxed);

        let mut out = BytesMut::with_capacity(HEADER_LEN + data.len() + CRC_LEN);
        out.put_u8(GW_ADDR);
        out.put_u8(command);
        out.put_u8(subcommand);
        out.put_u16(0);
        out.put_u16(packet_id);
        out.put_u16(len);
        out.put_slice(data);
        let crc = crc16(&out);
        out.put_u16(crc);
        Ok(out.freeze())
    }

    /// Wrap a packet into a write-to-TR request
    pub fn encode_request(&self, packet: &Packet) -> Result<Bytes> {
        self.encode_with(CMD_WRITE_TR, 0x00, packet.as_bytes())
    }

    /// Parse and verify one datagram
    pub fn parse(&self, datagram: &[u8]) -> Result<GatewayMessage> {
        let need = HEADER_LEN + CRC_LEN;
        if datagram.len() < need {
            return Err(IqrfError::Truncated {
                got: datagram.len(),
                need,
            });
        }
        if datagram[0] != GW_ADDR {
            return Err(IqrfError::InvalidHeader(format!(
                "gateway address 0x{:02X}",
                datagram[0]
            )));
        }

        let dlen = u16::from_be_bytes([datagram[7], datagram[8]]) as usize;
        if datagram.len() != need + dlen {
            return Err(IqrfError::InvalidLength(format!(
                "declared {} data bytes in {} byte datagram",
                dlen,
                datagram.len()
            )));
        }

        let body_end = HEADER_LEN + dlen;
        let got = u16::from_be_bytes([datagram[body_end], datagram[body_end + 1]]);
        let expected = crc16(&datagram[..body_end]);
        if expected != got {
            return Err(IqrfError::ChecksumMismatch { expected, got });
        }

        Ok(GatewayMessage {
            command: datagram[1],
            subcommand: datagram[2],
            packet_id: u16::from_be_bytes([datagram[5], datagram[6]]),
            data: Bytes::copy_from_slice(&datagram[HEADER_LEN..body_end]),
        })
    }
}

impl Framer for GatewayFramer {
    fn encode(&self, packet: &Packet) -> Result<Bytes> {
        self.encode_request(packet)
    }

    fn decode(&self, frame: &[u8]) -> Result<Packet> {
        self.parse(frame).map(|msg| Packet::new(msg.data))
    }
}
