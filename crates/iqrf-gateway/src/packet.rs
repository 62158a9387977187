//! DPA packet value type and role classification
//!
//! A [`Packet`] is one complete device-protocol message as it travels between
//! the transports and the bridge. Framing bytes never appear inside it.
//!
//! # DPA layout
//!
//! | Bytes | Field |
//! |-------|-------|
//! | 0-1   | NADR, node address (LE) |
//! | 2     | PNUM, peripheral |
//! | 3     | PCMD, command |
//! | 4-5   | HWPID, hardware profile id (LE) |
//! | 6..   | payload |
//!
//! A confirmation is an 11 byte packet with `0xFF` at byte 6 followed by the
//! DPA value, hop counts, and timeslot length.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Length of the fixed DPA header
pub const DPA_HEADER_LEN: usize = 6;

/// Exact length of a DPA confirmation
pub const CONFIRMATION_LEN: usize = 11;

/// Marker at byte 6 that identifies a confirmation
pub const CONFIRMATION_MARKER: u8 = 0xFF;

/// One protocol message, immutable once produced
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Packet(Bytes);

impl Packet {
    /// Create a packet from owned bytes
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// Create a packet by copying a slice
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(data))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Packet length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the packet carries no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume into the underlying buffer
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Parsed DPA header, if the packet is long enough to carry one
    pub fn dpa(&self) -> Option<DpaFields> {
        if self.0.len() < DPA_HEADER_LEN {
            return None;
        }
        let b = &self.0;
        Some(DpaFields {
            nadr: u16::from_le_bytes([b[0], b[1]]),
            pnum: b[2],
            pcmd: b[3],
            hwpid: u16::from_le_bytes([b[4], b[5]]),
            payload: self.0.slice(DPA_HEADER_LEN..),
        })
    }

    /// Confirmation trailer, if this packet is a well formed confirmation
    pub fn confirmation(&self) -> Option<ConfirmationInfo> {
        match classify(self) {
            PacketRole::Confirmation => {
                let b = &self.0;
                Some(ConfirmationInfo {
                    dpa_value: b[7],
                    hops: b[8],
                    timeslot_length: b[9],
                    hops_response: b[10],
                })
            }
            _ => None,
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({})", hex::encode(&self.0))
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Packet {
    fn from(data: Vec<u8>) -> Self {
        Self(Bytes::from(data))
    }
}

impl From<&[u8]> for Packet {
    fn from(data: &[u8]) -> Self {
        Self::copy_from_slice(data)
    }
}

impl<const N: usize> From<[u8; N]> for Packet {
    fn from(data: [u8; N]) -> Self {
        Self::copy_from_slice(&data)
    }
}

/// Decoded DPA header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpaFields {
    /// Node address
    pub nadr: u16,
    /// Peripheral number
    pub pnum: u8,
    /// Peripheral command
    pub pcmd: u8,
    /// Hardware profile id
    pub hwpid: u16,
    /// Bytes after the header
    pub payload: Bytes,
}

/// Trailer of a DPA confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationInfo {
    /// DPA value of the coordinator
    pub dpa_value: u8,
    /// Hops used to deliver the request
    pub hops: u8,
    /// Timeslot length in 10 ms units
    pub timeslot_length: u8,
    /// Hops the response will use
    pub hops_response: u8,
}

/// Why a packet was classified as an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyError {
    /// Shorter than a DPA header
    NoPacketInformation,
    /// Carries the confirmation marker with a wrong length
    InvalidConfirmation,
}

impl ClassifyError {
    /// Human readable description placed into converted messages
    pub fn description(&self) -> &'static str {
        match self {
            ClassifyError::NoPacketInformation => "Doesn't contain packet information!",
            ClassifyError::InvalidConfirmation => "Invalid confirmation!",
        }
    }
}

impl fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Protocol role of a received packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketRole {
    /// Data returned by a node
    Response,
    /// Coordinator acknowledgement of a networked request
    Confirmation,
    /// Packet that cannot be interpreted
    Error(ClassifyError),
}

impl PacketRole {
    /// Short lowercase name, used for log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketRole::Response => "response",
            PacketRole::Confirmation => "confirmation",
            PacketRole::Error(_) => "error",
        }
    }
}

/// Tag a received packet with its protocol role
pub fn classify(packet: &Packet) -> PacketRole {
    let b = packet.as_bytes();
    if b.len() < DPA_HEADER_LEN {
        return PacketRole::Error(ClassifyError::NoPacketInformation);
    }
    if b.len() > 7 && b[6] == CONFIRMATION_MARKER {
        if b.len() == CONFIRMATION_LEN {
            return PacketRole::Confirmation;
        }
        return PacketRole::Error(ClassifyError::InvalidConfirmation);
    }
    PacketRole::Response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_confirmation() {
        let p = Packet::from([0x00, 0x00, 0x06, 0x03, 0xFF, 0xFF, 0xFF, 0x22, 0x01, 0x04, 0x01]);
        assert_eq!(classify(&p), PacketRole::Confirmation);
        let info = p.confirmation().unwrap();
        assert_eq!(info.dpa_value, 0x22);
        assert_eq!(info.hops, 0x01);
        assert_eq!(info.timeslot_length, 0x04);
        assert_eq!(info.hops_response, 0x01);
    }

    #[test]
    fn test_classify_invalid_confirmation() {
        let p = Packet::from([0x00, 0x00, 0x06, 0x03, 0xFF, 0xFF, 0xFF, 0x22, 0x01]);
        assert_eq!(
            classify(&p),
            PacketRole::Error(ClassifyError::InvalidConfirmation)
        );
        assert!(p.confirmation().is_none());
    }

    #[test]
    fn test_classify_short() {
        let p = Packet::from([0x00, 0x00, 0x06, 0x03, 0xFF]);
        assert_eq!(
            classify(&p),
            PacketRole::Error(ClassifyError::NoPacketInformation)
        );
        assert!(p.dpa().is_none());
        assert_eq!(classify(&Packet::default()), PacketRole::Error(ClassifyError::NoPacketInformation));
    }

    #[test]
    fn test_classify_response() {
        let p = Packet::from([0x00, 0x00, 0x0A, 0x80, 0xFF, 0xFF, 0x00, 0x1E]);
        assert_eq!(classify(&p), PacketRole::Response);

        // Seven bytes with the marker is still too short to be a confirmation
        let p = Packet::from([0x00, 0x00, 0x0A, 0x80, 0xFF, 0xFF, 0xFF]);
        assert_eq!(classify(&p), PacketRole::Response);

        let p = Packet::from([0x01, 0x00, 0x06, 0x80, 0xFF, 0xFF]);
        assert_eq!(classify(&p), PacketRole::Response);
    }

    #[test]
    fn test_dpa_fields_little_endian() {
        let p = Packet::from([0x34, 0x12, 0x06, 0x83, 0xCD, 0xAB, 0x01, 0x02]);
        let dpa = p.dpa().unwrap();
        assert_eq!(dpa.nadr, 0x1234);
        assert_eq!(dpa.pnum, 0x06);
        assert_eq!(dpa.pcmd, 0x83);
        assert_eq!(dpa.hwpid, 0xABCD);
        assert_eq!(dpa.payload.as_ref(), &[0x01, 0x02]);
    }

    #[test]
    fn test_debug_is_hex() {
        let p = Packet::from([0x7E, 0x0A]);
        assert_eq!(format!("{:?}", p), "Packet(7e0a)");
    }
}
