//! HDLC-like framing used on the IQRF UART
//!
//! Frame layout: `0x7E | escape(data ‖ crc8(data)) | 0x7E`. Inside a frame
//! `0x7E` is sent as `0x7D 0x5E` and `0x7D` as `0x7D 0x5D`, so the flag byte
//! never appears between the delimiters.

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Algorithm, Crc};
use tracing::trace;

use super::Framer;
use crate::error::{IqrfError, Result};
use crate::packet::Packet;

/// Frame delimiter
pub const FLAG: u8 = 0x7E;

/// Escape marker
pub const ESCAPE: u8 = 0x7D;

/// Value XORed into escaped bytes
const ESCAPE_XOR: u8 = 0x20;

/// CRC-8, reflected polynomial 0x31 with initial value 0xFF
const IQRF_CRC8: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x31,
    init: 0xFF,
    refin: true,
    refout: true,
    xorout: 0x00,
    check: 0x0B,
    residue: 0x00,
};

const CRC8: Crc<u8> = Crc::<u8>::new(&IQRF_CRC8);

/// Checksum appended to every UART frame
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

fn push_escaped(out: &mut BytesMut, byte: u8) {
    if byte == FLAG || byte == ESCAPE {
        out.put_u8(ESCAPE);
        out.put_u8(byte ^ ESCAPE_XOR);
    } else {
        out.put_u8(byte);
    }
}

/// Framer for the UART transport
#[derive(Debug, Clone, Copy, Default)]
pub struct HdlcFramer;

impl HdlcFramer {
    /// Create a new framer
    pub fn new() -> Self {
        Self
    }
}

impl Framer for HdlcFramer {
    fn encode(&self, packet: &Packet) -> Result<Bytes> {
        let data = packet.as_bytes();
        let mut out = BytesMut::with_capacity(data.len() * 2 + 4);
        out.put_u8(FLAG);
        for &b in data {
            push_escaped(&mut out, b);
        }
        push_escaped(&mut out, crc8(data));
        out.put_u8(FLAG);
        Ok(out.freeze())
    }

    fn decode(&self, frame: &[u8]) -> Result<Packet> {
        if frame.len() < 3 {
            return Err(IqrfError::Truncated {
                got: frame.len(),
                need: 3,
            });
        }
        if frame[0] != FLAG || frame[frame.len() - 1] != FLAG {
            return Err(IqrfError::InvalidDelimiter);
        }

        let body = &frame[1..frame.len() - 1];
        let mut raw = Vec::with_capacity(body.len());
        let mut iter = body.iter();
        while let Some(&b) = iter.next() {
            match b {
                FLAG => return Err(IqrfError::InvalidDelimiter),
                ESCAPE => match iter.next() {
                    Some(&next) if next == (FLAG ^ ESCAPE_XOR) || next == (ESCAPE ^ ESCAPE_XOR) => {
                        raw.push(next ^ ESCAPE_XOR)
                    }
                    Some(&next) => return Err(IqrfError::InvalidEscape(next)),
                    None => {
                        return Err(IqrfError::Truncated {
                            got: frame.len(),
                            need: frame.len() + 1,
                        })
                    }
                },
                _ => raw.push(b),
            }
        }

        let Some(got) = raw.pop() else {
            return Err(IqrfError::Truncated {
                got: frame.len(),
                need: 3,
            });
        };
        let expected = crc8(&raw);
        if expected != got {
            return Err(IqrfError::ChecksumMismatch {
                expected: expected as u16,
                got: got as u16,
            });
        }

        Ok(Packet::from(raw))
    }
}

/// Splits a byte stream into `0x7E … 0x7E` runs
///
/// Bytes are fed in whatever chunks the port returns them. Complete runs are
/// emitted in arrival order; an unterminated tail is kept until more bytes
/// arrive. Bytes before the first flag can never belong to a frame and are
/// discarded.
#[derive(Debug, Default)]
pub struct FrameChunker {
    remainder: BytesMut,
}

impl FrameChunker {
    /// Create an empty chunker
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held while waiting for a closing flag
    pub fn pending(&self) -> usize {
        self.remainder.len()
    }

    /// Forget any partial frame
    pub fn reset(&mut self) {
        self.remainder.clear();
    }

    /// Feed newly read bytes and collect every completed frame
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.remainder.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            let Some(start) = self.remainder.iter().position(|&b| b == FLAG) else {
                if !self.remainder.is_empty() {
                    trace!(discarded = self.remainder.len(), "Discarding bytes outside frame");
                }
                self.remainder.clear();
                break;
            };
            if start > 0 {
                trace!(discarded = start, "Discarding bytes before frame start");
                let _ = self.remainder.split_to(start);
            }

            let Some(offset) = self.remainder[1..].iter().position(|&b| b == FLAG) else {
                break;
            };
            let end = offset + 1;

            if end == 1 {
                // Two adjacent flags: the first closed a frame we never saw
                let _ = self.remainder.split_to(1);
                continue;
            }

            frames.push(self.remainder.split_to(end + 1).freeze());
        }

        frames
    }
}
