//! Conversion between DPA packets and JSON messages
//!
//! Two JSON flavours are supported towards the messaging side:
//!
//! | Converter | Outgoing message |
//! |-----------|------------------|
//! | [`DpaJsonConverter`] | decoded DPA fields, role specific extras |
//! | [`SimpleJsonConverter`] | dotted hex payload with size and gateway MAC |
//!
//! Requests coming from the messaging side are parsed into a
//! [`DecodedRequest`], which accepts either flavour.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{Local, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::ConverterKind;
use crate::error::{IqrfError, Result};
use crate::packet::{ConfirmationInfo, Packet, PacketRole, DPA_HEADER_LEN};

/// Converted packet ready to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedMessage {
    /// Role the packet was classified with
    pub role: PacketRole,
    /// JSON text
    pub payload: Bytes,
}

impl ConvertedMessage {
    /// Payload as text
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or_default()
    }
}

/// Request received from the messaging side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DecodedRequest {
    /// Decoded DPA fields
    Dpa {
        /// Node address
        nadr: u32,
        /// Peripheral number
        per: u16,
        /// Peripheral command
        cmd: u16,
        /// Hardware profile id
        #[serde(default = "default_hwpid")]
        hwpid: u32,
        /// Request data
        #[serde(default)]
        data: Vec<u16>,
    },
    /// Dotted hex payload (`"00.00.06.03.FF.FF"`)
    Raw {
        /// Payload bytes as dotted hex
        payload: String,
        /// Declared byte count
        #[serde(default)]
        size: Option<usize>,
    },
}

/// HWPID accepted by every device
fn default_hwpid() -> u32 {
    0xFFFF
}

impl DecodedRequest {
    /// Parse a request from JSON text
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

fn check_range(field: &'static str, value: u64, max: u64) -> Result<u64> {
    if value > max {
        return Err(IqrfError::ValueOutOfRange { field, value, max });
    }
    Ok(value)
}

fn parse_dotted_hex(payload: &str) -> Result<Vec<u8>> {
    payload
        .split('.')
        .map(|token| {
            if token.is_empty() || token.len() > 2 {
                return Err(IqrfError::InvalidRequest(format!(
                    "bad payload byte '{}'",
                    token
                )));
            }
            u8::from_str_radix(token, 16)
                .map_err(|e| IqrfError::InvalidRequest(format!("bad payload byte '{}': {}", token, e)))
        })
        .collect()
}

/// Render bytes as upper case dotted hex
pub fn to_dotted_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(".")
}

impl TryFrom<&DecodedRequest> for Packet {
    type Error = IqrfError;

    fn try_from(request: &DecodedRequest) -> Result<Self> {
        match request {
            DecodedRequest::Dpa {
                nadr,
                per,
                cmd,
                hwpid,
                data,
            } => {
                let nadr = check_range("nadr", *nadr as u64, 0xFFFF)? as u16;
                let per = check_range("per", *per as u64, 0xFF)? as u8;
                let cmd = check_range("cmd", *cmd as u64, 0xFF)? as u8;
                let hwpid = check_range("hwpid", *hwpid as u64, 0xFFFF)? as u16;

                let mut out = Vec::with_capacity(DPA_HEADER_LEN + data.len());
                out.extend_from_slice(&nadr.to_le_bytes());
                out.push(per);
                out.push(cmd);
                out.extend_from_slice(&hwpid.to_le_bytes());
                for &b in data {
                    out.push(check_range("data", b as u64, 0xFF)? as u8);
                }
                Ok(Packet::from(out))
            }
            DecodedRequest::Raw { payload, size } => {
                let bytes = parse_dotted_hex(payload)?;
                if let Some(declared) = size {
                    if *declared != bytes.len() {
                        return Err(IqrfError::SizeMismatch {
                            declared: *declared,
                            actual: bytes.len(),
                        });
                    }
                }
                Ok(Packet::from(bytes))
            }
        }
    }
}

/// Converts between packets and the JSON published outside
pub trait MessageConverter: Send + Sync {
    /// Converter name (for logging)
    fn name(&self) -> &'static str;

    /// Render a received packet
    fn to_message(&self, packet: &Packet, role: PacketRole) -> Result<ConvertedMessage>;

    /// Turn a request into a packet for the network
    fn to_packet(&self, request: &DecodedRequest) -> Result<Packet> {
        Packet::try_from(request)
    }
}

/// Create the converter selected by configuration
pub fn create_converter(kind: ConverterKind, mac: &str) -> Arc<dyn MessageConverter> {
    match kind {
        ConverterKind::Dpa => Arc::new(DpaJsonConverter::new()),
        ConverterKind::Simple => Arc::new(SimpleJsonConverter::new(mac)),
    }
}

fn local_time() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DpaJson<'a> {
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    nadr: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    per: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cmd: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hwpid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a [u8]>,
    #[serde(flatten)]
    confirmation: Option<ConfirmationInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unparseable_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

/// Publishes decoded DPA fields
///
/// ```json
/// {"timestamp":"2024-05-02 10:15:30.123","nadr":0,"per":10,"cmd":128,"hwpid":65535,"data":[0,30,5]}
/// ```
#[derive(Debug, Default)]
pub struct DpaJsonConverter;

impl DpaJsonConverter {
    /// Create a new converter
    pub fn new() -> Self {
        Self
    }
}

impl MessageConverter for DpaJsonConverter {
    fn name(&self) -> &'static str {
        "dpa"
    }

    fn to_message(&self, packet: &Packet, role: PacketRole) -> Result<ConvertedMessage> {
        let bytes = packet.as_bytes();
        let dpa = packet.dpa();
        let mut json = DpaJson {
            timestamp: local_time(),
            nadr: dpa.as_ref().map(|d| d.nadr),
            per: dpa.as_ref().map(|d| d.pnum),
            cmd: dpa.as_ref().map(|d| d.pcmd),
            hwpid: dpa.as_ref().map(|d| d.hwpid),
            data: None,
            confirmation: None,
            unparseable_data: None,
            error: None,
        };
        match role {
            PacketRole::Response => json.data = Some(&bytes[DPA_HEADER_LEN.min(bytes.len())..]),
            PacketRole::Confirmation => json.confirmation = packet.confirmation(),
            PacketRole::Error(reason) => {
                json.unparseable_data = Some(format!("{:?}", bytes));
                json.error = Some(reason.description());
            }
        }
        let payload = serde_json::to_vec(&json)?;
        trace!(converter = self.name(), role = role.as_str(), "Converted packet");
        Ok(ConvertedMessage {
            role,
            payload: Bytes::from(payload),
        })
    }
}

/// DPA tagging of the simple flavour, carried from requests to responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DpaTag {
    dpa: bool,
    packet_number: i32,
}

#[derive(Debug)]
struct DpaTagQueue {
    pending: VecDeque<DpaTag>,
    last: DpaTag,
}

impl DpaTagQueue {
    fn next(&mut self) -> DpaTag {
        if let Some(tag) = self.pending.pop_front() {
            self.last = tag;
        }
        self.last
    }
}

#[derive(Serialize)]
struct SimpleJson<'a> {
    payload: String,
    dpa: bool,
    #[serde(rename = "dpa-pn")]
    dpa_pn: i32,
    size: usize,
    mac: &'a str,
    time: String,
    timestamp: i64,
}

/// Publishes the raw payload as dotted hex
///
/// ```json
/// {"payload":"00.00.0A.80","dpa":false,"dpa-pn":0,"size":4,"mac":"001122334455","time":"…","timestamp":1714644930123}
/// ```
#[derive(Debug)]
pub struct SimpleJsonConverter {
    mac: String,
    tags: Mutex<DpaTagQueue>,
}

impl SimpleJsonConverter {
    /// Create a converter stamping messages with the gateway MAC
    pub fn new(mac: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            tags: Mutex::new(DpaTagQueue {
                pending: VecDeque::new(),
                last: DpaTag {
                    dpa: false,
                    packet_number: -1,
                },
            }),
        }
    }
}

impl MessageConverter for SimpleJsonConverter {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn to_message(&self, packet: &Packet, role: PacketRole) -> Result<ConvertedMessage> {
        let tag = self.tags.lock().next();
        let json = SimpleJson {
            payload: to_dotted_hex(packet.as_bytes()),
            dpa: tag.dpa,
            dpa_pn: tag.packet_number,
            size: packet.len(),
            mac: &self.mac,
            time: local_time(),
            timestamp: Utc::now().timestamp_millis(),
        };
        Ok(ConvertedMessage {
            role,
            payload: Bytes::from(serde_json::to_vec(&json)?),
        })
    }

    fn to_packet(&self, request: &DecodedRequest) -> Result<Packet> {
        let packet = Packet::try_from(request)?;
        self.tags.lock().pending.push_back(DpaTag {
            dpa: false,
            packet_number: 0,
        });
        debug!(converter = self.name(), size = packet.len(), "Request converted");
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{classify, ClassifyError};
    use serde_json::Value;

    fn to_value(msg: &ConvertedMessage) -> Value {
        serde_json::from_slice(&msg.payload).unwrap()
    }

    #[test]
    fn test_dpa_response() {
        let packet = Packet::from([0x00, 0x00, 0x0A, 0x80, 0xFF, 0xFF, 0x00, 0x1E, 0x05]);
        let role = classify(&packet);
        let msg = DpaJsonConverter::new().to_message(&packet, role).unwrap();
        assert_eq!(msg.role, PacketRole::Response);

        let v = to_value(&msg);
        assert_eq!(v["nadr"], 0);
        assert_eq!(v["per"], 10);
        assert_eq!(v["cmd"], 128);
        assert_eq!(v["hwpid"], 0xFFFF);
        assert_eq!(v["data"], serde_json::json!([0, 30, 5]));
        assert!(v["timestamp"].is_string());
        assert!(v.get("error").is_none());
    }

    #[test]
    fn test_dpa_confirmation() {
        let packet = Packet::from([0x01, 0x00, 0x06, 0x03, 0xFF, 0xFF, 0xFF, 0x22, 0x01, 0x04, 0x01]);
        let msg = DpaJsonConverter::new()
            .to_message(&packet, classify(&packet))
            .unwrap();
        assert_eq!(msg.role, PacketRole::Confirmation);

        let v = to_value(&msg);
        assert_eq!(v["nadr"], 1);
        assert_eq!(v["dpaValue"], 0x22);
        assert_eq!(v["hops"], 1);
        assert_eq!(v["timeslotLength"], 4);
        assert_eq!(v["hopsResponse"], 1);
        assert!(v.get("data").is_none());
    }

    #[test]
    fn test_dpa_errors() {
        let converter = DpaJsonConverter::new();

        let short = Packet::from([0x01, 0x02, 0x03]);
        let v = to_value(&converter.to_message(&short, classify(&short)).unwrap());
        assert_eq!(v["unparseableData"], "[1, 2, 3]");
        assert_eq!(v["error"], ClassifyError::NoPacketInformation.description());
        assert!(v.get("nadr").is_none());

        let bad = Packet::from([0x00, 0x00, 0x06, 0x03, 0xFF, 0xFF, 0xFF, 0x22, 0x01]);
        let msg = converter.to_message(&bad, classify(&bad)).unwrap();
        assert_eq!(
            msg.role,
            PacketRole::Error(ClassifyError::InvalidConfirmation)
        );
        let v = to_value(&msg);
        assert_eq!(v["error"], "Invalid confirmation!");
        assert_eq!(v["per"], 6);
    }

    #[test]
    fn test_simple_message() {
        let converter = SimpleJsonConverter::new("001122334455");
        let packet = Packet::from([0x00, 0x00, 0x0A, 0x80, 0xFF, 0xFF]);
        let v = to_value(&converter.to_message(&packet, classify(&packet)).unwrap());
        assert_eq!(v["payload"], "00.00.0A.80.FF.FF");
        assert_eq!(v["size"], 6);
        assert_eq!(v["mac"], "001122334455");
        assert_eq!(v["dpa"], false);
        assert_eq!(v["dpa-pn"], -1);
        assert!(v["timestamp"].is_i64());
    }

    #[test]
    fn test_simple_tags_follow_requests() {
        let converter = SimpleJsonConverter::new("000000000000");
        let request = DecodedRequest::Raw {
            payload: "00.00.06.03.FF.FF".to_string(),
            size: Some(6),
        };
        converter.to_packet(&request).unwrap();
        let packet = Packet::from([0x00]);
        let v = to_value(&converter.to_message(&packet, classify(&packet)).unwrap());
        assert_eq!(v["dpa-pn"], 0);
        // The last tag sticks once the queue is empty
        let v = to_value(&converter.to_message(&packet, classify(&packet)).unwrap());
        assert_eq!(v["dpa-pn"], 0);
    }

    #[test]
    fn test_decode_dpa_request() {
        let request =
            DecodedRequest::from_json(br#"{"nadr":1,"per":6,"cmd":3,"hwpid":65535,"data":[1,2]}"#)
                .unwrap();
        let packet = Packet::try_from(&request).unwrap();
        assert_eq!(packet.as_bytes(), &[0x01, 0x00, 0x06, 0x03, 0xFF, 0xFF, 0x01, 0x02]);

        let request = DecodedRequest::from_json(br#"{"nadr":0,"per":2,"cmd":0}"#).unwrap();
        assert_eq!(
            Packet::try_from(&request).unwrap().as_bytes(),
            &[0x00, 0x00, 0x02, 0x00, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_decode_raw_request() {
        let request = DecodedRequest::from_json(
            br#"{"payload":"00.00.06.03.ff.FF","size":6,"dpa":false,"mac":"x"}"#,
        )
        .unwrap();
        assert_eq!(
            Packet::try_from(&request).unwrap().as_bytes(),
            &[0x00, 0x00, 0x06, 0x03, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_request_validation() {
        let request = DecodedRequest::Dpa {
            nadr: 0x1_0000,
            per: 0,
            cmd: 0,
            hwpid: 0,
            data: vec![],
        };
        assert!(matches!(
            Packet::try_from(&request),
            Err(IqrfError::ValueOutOfRange { field: "nadr", .. })
        ));

        let request = DecodedRequest::Dpa {
            nadr: 0,
            per: 0,
            cmd: 0,
            hwpid: 0,
            data: vec![256],
        };
        assert!(Packet::try_from(&request).is_err());

        let request = DecodedRequest::Raw {
            payload: "00.01".to_string(),
            size: Some(3),
        };
        assert!(matches!(
            Packet::try_from(&request),
            Err(IqrfError::SizeMismatch {
                declared: 3,
                actual: 2
            })
        ));

        let request = DecodedRequest::Raw {
            payload: "00..01".to_string(),
            size: None,
        };
        assert!(Packet::try_from(&request).is_err());

        assert!(DecodedRequest::from_json(b"{\"foo\":1}").is_err());
        assert!(DecodedRequest::from_json(b"not json").is_err());
    }

    #[test]
    fn test_dotted_hex() {
        assert_eq!(to_dotted_hex(&[0x00, 0x0A, 0xFF]), "00.0A.FF");
        assert_eq!(to_dotted_hex(&[]), "");
    }
}
