//! USB-CDC command set of IQRF coordinators
//!
//! The CDC firmware speaks a small line protocol. Packets travel inside
//! length-prefixed commands so the layer above sees whole messages:
//!
//! - `>DS<len>:<data>\r` - send data to the TR module
//! - `<DS:OK\r`, `<DS:ERR\r`, `<DS:BUSY\r` - reply to a send
//! - `<DR<len>:<data>\r` - data received from the TR module
//!
//! `<len>` is a single binary byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use super::Framer;
use crate::error::{IqrfError, Result};
use crate::packet::Packet;

const SEND_PREFIX: &[u8] = b">DS";
const RECEIVE_PREFIX: &[u8] = b"<DR";
const TERMINATOR: u8 = b'\r';

/// Reply to a `DS` command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Data accepted
    Ok,
    /// Data rejected
    Err,
    /// Module busy
    Busy,
}

/// One message read from the CDC stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdcMessage {
    /// Asynchronous data from the TR module
    Data(Packet),
    /// Reply to a send command
    SendResult(SendStatus),
    /// Any other reply line
    Other(String),
}

/// Build a send-data command
pub fn encode_send(data: &[u8]) -> Result<Bytes> {
    let len = u8::try_from(data.len()).map_err(|_| {
        IqrfError::InvalidLength(format!("{} bytes exceed CDC limit of 255", data.len()))
    })?;
    let mut out = BytesMut::with_capacity(data.len() + 6);
    out.put_slice(SEND_PREFIX);
    out.put_u8(len);
    out.put_u8(b':');
    out.put_slice(data);
    out.put_u8(TERMINATOR);
    Ok(out.freeze())
}

/// Build a received-data message, as sent by the coordinator
pub fn encode_received(data: &[u8]) -> Result<Bytes> {
    let len = u8::try_from(data.len()).map_err(|_| {
        IqrfError::InvalidLength(format!("{} bytes exceed CDC limit of 255", data.len()))
    })?;
    let mut out = BytesMut::with_capacity(data.len() + 6);
    out.put_slice(RECEIVE_PREFIX);
    out.put_u8(len);
    out.put_u8(b':');
    out.put_slice(data);
    out.put_u8(TERMINATOR);
    Ok(out.freeze())
}

/// Incremental parser for bytes read from the CDC port
#[derive(Debug, Default)]
pub struct CdcParser {
    buf: BytesMut,
}

impl CdcParser {
    /// Create an empty parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and collect complete messages
    pub fn push(&mut self, data: &[u8]) -> Vec<CdcMessage> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        while let Some(msg) = self.next_message() {
            out.push(msg);
        }
        out
    }

    fn next_message(&mut self) -> Option<CdcMessage> {
        loop {
            let start = self.buf.iter().position(|&b| b == b'<')?;
            if start > 0 {
                trace!(discarded = start, "Discarding bytes before CDC reply");
                self.buf.advance(start);
            }

            if self.buf.len() < RECEIVE_PREFIX.len() {
                return None;
            }
            if self.buf.starts_with(RECEIVE_PREFIX) {
                // <DR len : data \r
                if self.buf.len() < 5 {
                    return None;
                }
                let len = self.buf[3] as usize;
                let total = 5 + len + 1;
                if self.buf[4] != b':' {
                    warn!("Malformed CDC data message, resynchronizing");
                    self.buf.advance(1);
                    continue;
                }
                if self.buf.len() < total {
                    return None;
                }
                if self.buf[total - 1] != TERMINATOR {
                    warn!(len, "CDC data message not terminated, resynchronizing");
                    self.buf.advance(1);
                    continue;
                }
                let msg = self.buf.split_to(total);
                return Some(CdcMessage::Data(Packet::copy_from_slice(&msg[5..5 + len])));
            }

            let end = self.buf.iter().position(|&b| b == TERMINATOR)?;
            let line = self.buf.split_to(end + 1);
            let text = String::from_utf8_lossy(&line[..end]).into_owned();
            return Some(match text.as_str() {
                "<DS:OK" => CdcMessage::SendResult(SendStatus::Ok),
                "<DS:ERR" => CdcMessage::SendResult(SendStatus::Err),
                "<DS:BUSY" => CdcMessage::SendResult(SendStatus::Busy),
                _ => CdcMessage::Other(text),
            });
        }
    }
}

/// Framer for the CDC transport
///
/// The driver delivers whole messages, so packets pass through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct CdcFramer;

impl Framer for CdcFramer {
    fn encode(&self, packet: &Packet) -> Result<Bytes> {
        Ok(packet.clone().into_bytes())
    }

    fn decode(&self, frame: &[u8]) -> Result<Packet> {
        Ok(Packet::copy_from_slice(frame))
    }
}
