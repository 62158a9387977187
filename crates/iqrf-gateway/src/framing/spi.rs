//! IQRF SPI master frames
//!
//! Every transaction is full duplex. The master first checks the slave status
//! by clocking a single `0x00` byte. Data moves in frames
//! `F0 PTYPE data… CRCM 00` where `PTYPE` is the data length, with bit 7 set
//! when the master writes. While the master clocks a read frame the slave
//! answers with the data at offset 2 followed by its own checksum `CRCS`.

use bytes::{BufMut, Bytes, BytesMut};

use super::Framer;
use crate::error::{IqrfError, Result};
use crate::packet::Packet;

/// Status check command
pub const CMD_STATUS: u8 = 0x00;

/// Data transfer command
pub const CMD_DATA: u8 = 0xF0;

/// Largest data block one frame carries
pub const MAX_DATA_LEN: usize = 64;

/// Checksum seed
const CRC_SEED: u8 = 0x5F;

/// PTYPE bit marking a master write
const PTYPE_WRITE: u8 = 0x80;

/// Decoded SPI slave status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiStatus {
    /// SPI disabled on the TR module
    Disabled,
    /// Last frame had a bad checksum
    CrcError,
    /// Data waiting to be read, with its length
    DataReady(usize),
    /// Ready, communication mode
    ReadyComm,
    /// Ready, programming mode
    ReadyProg,
    /// Ready, debug mode
    ReadyDebug,
    /// Busy
    Busy,
    /// Any other value
    Other(u8),
}

impl From<u8> for SpiStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => SpiStatus::Disabled,
            0x3F => SpiStatus::CrcError,
            0x40 => SpiStatus::DataReady(MAX_DATA_LEN),
            0x41..=0x7F => SpiStatus::DataReady((value - 0x40) as usize),
            0x80 => SpiStatus::ReadyComm,
            0x81 => SpiStatus::ReadyProg,
            0x82 => SpiStatus::ReadyDebug,
            0xFF => SpiStatus::Busy,
            other => SpiStatus::Other(other),
        }
    }
}

fn xor_all(seed: u8, data: &[u8]) -> u8 {
    data.iter().fold(seed, |acc, &b| acc ^ b)
}

/// Builds and verifies SPI frames
#[derive(Debug, Clone, Copy, Default)]
pub struct SpiFramer;

impl SpiFramer {
    /// Create a new framer
    pub fn new() -> Self {
        Self
    }

    /// Bytes clocked for a status check
    pub fn status_request(&self) -> [u8; 1] {
        [CMD_STATUS]
    }

    fn frame(ptype: u8, data: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(data.len() + 4);
        out.put_u8(CMD_DATA);
        out.put_u8(ptype);
        out.put_slice(data);
        out.put_u8(xor_all(CRC_SEED ^ CMD_DATA ^ ptype, data));
        out.put_u8(0x00);
        out.freeze()
    }

    fn check_len(len: usize) -> Result<u8> {
        if len > MAX_DATA_LEN {
            return Err(IqrfError::InvalidLength(format!(
                "{} bytes exceed SPI frame limit of {}",
                len, MAX_DATA_LEN
            )));
        }
        Ok(len as u8)
    }

    /// Frame that writes `data` to the slave
    pub fn encode_write(&self, data: &[u8]) -> Result<Bytes> {
        let len = Self::check_len(data.len())?;
        Ok(Self::frame(len | PTYPE_WRITE, data))
    }

    /// Frame that clocks `len` bytes out of the slave
    pub fn encode_read(&self, len: usize) -> Result<Bytes> {
        let len8 = Self::check_len(len)?;
        Ok(Self::frame(len8, &vec![0u8; len]))
    }

    /// Extract data from the bytes received while clocking a read frame
    pub fn decode_read_response(&self, len: usize, rx: &[u8]) -> Result<Packet> {
        let ptype = Self::check_len(len)?;
        let need = len + 4;
        if rx.len() < need {
            return Err(IqrfError::Truncated { got: rx.len(), need });
        }
        let data = &rx[2..2 + len];
        let expected = xor_all(CRC_SEED ^ ptype, data);
        let got = rx[2 + len];
        if expected != got {
            return Err(IqrfError::ChecksumMismatch {
                expected: expected as u16,
                got: got as u16,
            });
        }
        Ok(Packet::copy_from_slice(data))
    }

    /// Build the bytes a slave returns for a read of `data`
    pub fn slave_read_response(&self, data: &[u8]) -> Result<Bytes> {
        let ptype = Self::check_len(data.len())?;
        let mut out = BytesMut::with_capacity(data.len() + 4);
        out.put_u8(0x00);
        out.put_u8(0x00);
        out.put_slice(data);
        out.put_u8(xor_all(CRC_SEED ^ ptype, data));
        out.put_u8(0x00);
        Ok(out.freeze())
    }

    /// Parse a master frame, returning PTYPE and the data
    pub fn parse_master_frame<'a>(&self, frame: &'a [u8]) -> Result<(u8, &'a [u8])> {
        if frame.len() < 4 {
            return Err(IqrfError::Truncated {
                got: frame.len(),
                need: 4,
            });
        }
        if frame[0] != CMD_DATA {
            return Err(IqrfError::InvalidHeader(format!(
                "SPI command 0x{:02X}",
                frame[0]
            )));
        }
        let ptype = frame[1];
        let len = (ptype & !PTYPE_WRITE) as usize;
        if frame.len() != len + 4 {
            return Err(IqrfError::InvalidLength(format!(
                "PTYPE announces {} bytes in {} byte frame",
                len,
                frame.len()
            )));
        }
        let data = &frame[2..2 + len];
        let expected = xor_all(CRC_SEED ^ CMD_DATA ^ ptype, data);
        let got = frame[2 + len];
        if expected != got {
            return Err(IqrfError::ChecksumMismatch {
                expected: expected as u16,
                got: got as u16,
            });
        }
        Ok((ptype, data))
    }

    /// Whether a PTYPE belongs to a master write
    pub fn is_write(ptype: u8) -> bool {
        ptype & PTYPE_WRITE != 0
    }
}

impl Framer for SpiFramer {
    fn encode(&self, packet: &Packet) -> Result<Bytes> {
        self.encode_write(packet.as_bytes())
    }

    fn decode(&self, frame: &[u8]) -> Result<Packet> {
        self.parse_master_frame(frame)
            .map(|(_, data)| Packet::copy_from_slice(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_decoding() {
        assert_eq!(SpiStatus::from(0x00), SpiStatus::Disabled);
        assert_eq!(SpiStatus::from(0x3F), SpiStatus::CrcError);
        assert_eq!(SpiStatus::from(0x40), SpiStatus::DataReady(64));
        assert_eq!(SpiStatus::from(0x49), SpiStatus::DataReady(9));
        assert_eq!(SpiStatus::from(0x7F), SpiStatus::DataReady(63));
        assert_eq!(SpiStatus::from(0x80), SpiStatus::ReadyComm);
        assert_eq!(SpiStatus::from(0x82), SpiStatus::ReadyDebug);
        assert_eq!(SpiStatus::from(0xFF), SpiStatus::Busy);
        assert_eq!(SpiStatus::from(0x10), SpiStatus::Other(0x10));
    }

    #[test]
    fn test_write_frame_layout() {
        let framer = SpiFramer::new();
        let frame = framer.encode_write(&[0x01, 0x02]).unwrap();
        let crcm = 0x5F ^ 0xF0 ^ 0x82 ^ 0x01 ^ 0x02;
        assert_eq!(frame.as_ref(), &[0xF0, 0x82, 0x01, 0x02, crcm, 0x00]);
    }

    #[test]
    fn test_read_response() {
        let framer = SpiFramer::new();
        let data = [0x00, 0x00, 0x0A, 0x80, 0xFF, 0xFF, 0x00];
        let rx = framer.slave_read_response(&data).unwrap();
        assert_eq!(rx.len(), framer.encode_read(data.len()).unwrap().len());
        let packet = framer.decode_read_response(data.len(), &rx).unwrap();
        assert_eq!(packet.as_bytes(), &data);

        let mut bad = rx.to_vec();
        bad[3] ^= 0x01;
        assert!(matches!(
            framer.decode_read_response(data.len(), &bad),
            Err(IqrfError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_roundtrip_all_lengths() {
        let framer = SpiFramer::new();
        for len in 0..=MAX_DATA_LEN {
            let packet = Packet::from(vec![0xA5; len]);
            let frame = framer.encode(&packet).unwrap();
            assert_eq!(framer.decode(&frame).unwrap(), packet);
        }
        assert!(framer.encode(&Packet::from(vec![0; 65])).is_err());
    }

    #[test]
    fn test_master_frame_direction() {
        let framer = SpiFramer::new();
        let (ptype, _) = framer
            .parse_master_frame(&framer.encode_write(&[1]).unwrap())
            .unwrap();
        assert!(SpiFramer::is_write(ptype));
        let read = framer.encode_read(3).unwrap();
        let (ptype, data) = framer.parse_master_frame(&read).unwrap();
        assert!(!SpiFramer::is_write(ptype));
        assert_eq!(data.len(), 3);
    }
}
