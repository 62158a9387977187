//! Test utilities for IQRF gateways
//!
//! Provides device discovery for hardware tests plus in-memory fakes for the
//! transport, the SPI bus and the messaging side, so the bridge can be tested
//! without a coordinator attached.
//!
//! # Example
//!
//! ```rust,ignore
//! use iqrf_gateway::test_utils::find_iqrf_device;
//!
//! #[tokio::test]
//! #[ignore] // Only run when hardware is available
//! async fn test_with_real_coordinator() {
//!     let path = find_iqrf_device().expect("No IQRF device found");
//!     let transport = SerialTransport::new(&path);
//!     transport.start().await.unwrap();
//! }
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bridge::Messenger;
use crate::convert::{ConvertedMessage, DecodedRequest};
use crate::error::{IqrfError, Result};
use crate::framing::spi::{SpiFramer, CMD_STATUS, MAX_DATA_LEN};
use crate::interface::{ListenerSlot, PacketListener, SpiBus, TransportLayer};
use crate::mid::MODULE_ID_QUERY;
use crate::packet::Packet;

/// Device nodes IQRF coordinators usually appear as
const COMMON_DEVICE_PATHS: &[&str] = &[
    // USB-CDC coordinators and gateways
    "/dev/ttyACM*",
    // Raspberry Pi UART adapters
    "/dev/ttyAMA0",
    "/dev/serial0",
    // USB to UART bridges
    "/dev/ttyUSB*",
    // SPI adapters
    "/dev/spidev*",
];

/// USB vendor ids seen on IQRF hardware
const KNOWN_VENDOR_IDS: &[u16] = &[
    0x1DE6, // MICRORISC (IQRF CDC)
    0x0403, // FTDI
    0x10C4, // Silicon Labs CP210x
];

/// Information about a detected device node
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Path to the device (e.g., /dev/ttyACM0)
    pub path: String,
    /// Device type description
    pub device_type: String,
    /// USB Vendor ID (if available)
    pub vendor_id: Option<u16>,
    /// USB Product ID (if available)
    pub product_id: Option<u16>,
    /// Product name (if available)
    pub product_name: Option<String>,
    /// Whether this is likely an IQRF device
    pub is_likely_iqrf: bool,
}

impl DeviceInfo {
    #[cfg(feature = "serial")]
    fn from_serial_port(port: &serialport::SerialPortInfo) -> Self {
        use serialport::SerialPortType;

        let (device_type, vendor_id, product_id, product_name) = match &port.port_type {
            SerialPortType::UsbPort(usb) => (
                "USB".to_string(),
                Some(usb.vid),
                Some(usb.pid),
                usb.product.clone(),
            ),
            SerialPortType::PciPort => ("PCI".to_string(), None, None, None),
            SerialPortType::BluetoothPort => ("Bluetooth".to_string(), None, None, None),
            SerialPortType::Unknown => ("Unknown".to_string(), None, None, None),
        };
        let is_likely_iqrf = vendor_id.is_some_and(|vid| KNOWN_VENDOR_IDS.contains(&vid))
            || product_name
                .as_deref()
                .is_some_and(|p| p.to_lowercase().contains("iqrf"));

        Self {
            path: port.port_name.clone(),
            device_type,
            vendor_id,
            product_id,
            product_name,
            is_likely_iqrf,
        }
    }

    fn from_path(path: String) -> Self {
        let device_type = if path.contains("spidev") { "SPI" } else { "Unknown" };
        Self {
            is_likely_iqrf: path.contains("ttyACM") || path.contains("spidev"),
            path,
            device_type: device_type.to_string(),
            vendor_id: None,
            product_id: None,
            product_name: None,
        }
    }
}

fn glob_candidates() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();
    for pattern in COMMON_DEVICE_PATHS {
        match glob::glob(pattern) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    debug!(path = %entry.display(), "Found device node");
                    devices.push(DeviceInfo::from_path(entry.to_string_lossy().into_owned()));
                }
            }
            Err(e) => warn!(pattern, error = %e, "Bad device pattern"),
        }
    }
    devices
}

/// List device nodes that could be IQRF coordinators
pub fn list_available_devices() -> Vec<DeviceInfo> {
    #[cfg(feature = "serial")]
    {
        match serialport::available_ports() {
            Ok(ports) => {
                let mut devices: Vec<_> = ports.iter().map(DeviceInfo::from_serial_port).collect();
                // SPI adapters are not serial ports
                devices.extend(glob_candidates().into_iter().filter(|d| d.device_type == "SPI"));
                devices
            }
            Err(e) => {
                warn!(error = %e, "Failed to enumerate serial ports");
                glob_candidates()
            }
        }
    }

    #[cfg(not(feature = "serial"))]
    {
        glob_candidates()
    }
}

/// Path of the first device that looks like an IQRF coordinator
pub fn find_iqrf_device() -> Option<String> {
    list_available_devices()
        .into_iter()
        .find(|d| d.is_likely_iqrf)
        .map(|d| d.path)
}

/// Computes an optional reply for each packet sent
pub type Responder = Arc<dyn Fn(&Packet) -> Option<Packet> + Send + Sync>;

/// Build an OS read response carrying the given module id
pub fn os_read_response(module_id: u32) -> Packet {
    let mut out = vec![0x00, 0x00, 0x02, 0x80, 0x00, 0x00, 0x00, 0x00];
    out.extend_from_slice(&module_id.to_le_bytes());
    // OS version and TR type
    out.extend_from_slice(&[0x44, 0xB8]);
    Packet::from(out)
}

/// Responder answering the module id query like a coordinator
pub fn os_read_responder(module_id: u32) -> Responder {
    Arc::new(move |packet: &Packet| {
        (packet.as_bytes() == MODULE_ID_QUERY).then(|| os_read_response(module_id))
    })
}

/// In-memory transport
///
/// Records sent packets and lets tests inject received ones. An optional
/// responder replies to sends synchronously through the listener.
pub struct MockTransport {
    name: String,
    listener: ListenerSlot,
    sent: Mutex<Vec<Packet>>,
    responder: Option<Responder>,
    started: AtomicBool,
    destroyed: AtomicBool,
    fail_sends: AtomicBool,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            listener: ListenerSlot::new(),
            sent: Mutex::new(Vec::new()),
            responder: None,
            started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        }
    }

    /// Reply to sends with the responder's output
    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Make every send fail
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Deliver a packet to the current listener
    pub fn inject(&self, packet: Packet) -> bool {
        self.listener.dispatch(packet)
    }

    /// Packets sent so far
    pub fn sent(&self) -> Vec<Packet> {
        self.sent.lock().clone()
    }

    /// Whether a listener is registered
    pub fn has_listener(&self) -> bool {
        self.listener.is_set()
    }

    /// Whether `start` was called
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether `destroy` was called
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportLayer for MockTransport {
    async fn start(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(IqrfError::Internal("mock: destroyed".to_string()));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        if !self.is_started() || self.is_destroyed() {
            return Err(IqrfError::NotStarted("mock"));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(IqrfError::WriteFailed("simulated failure".to_string()));
        }
        self.sent.lock().push(packet.clone());
        if let Some(reply) = self.responder.as_ref().and_then(|r| r(packet)) {
            self.listener.dispatch(reply);
        }
        Ok(())
    }

    fn register_listener(&self, listener: PacketListener) -> Option<PacketListener> {
        self.listener.replace(listener)
    }

    fn unregister_listener(&self) -> Option<PacketListener> {
        self.listener.take()
    }

    async fn destroy(&self) -> Result<()> {
        self.listener.take();
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// In-memory messaging side
#[derive(Debug, Default)]
pub struct MockMessenger {
    requests: Mutex<VecDeque<Vec<u8>>>,
    published: Mutex<Vec<ConvertedMessage>>,
    fail_publish: AtomicBool,
}

impl MockMessenger {
    /// Create a new mock messenger
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw JSON request
    pub fn push_request(&self, raw: &[u8]) {
        self.requests.lock().push_back(raw.to_vec());
    }

    /// Messages published so far
    pub fn published(&self) -> Vec<ConvertedMessage> {
        self.published.lock().clone()
    }

    /// Make every publish fail
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    fn is_request_available(&self) -> bool {
        !self.requests.lock().is_empty()
    }

    fn take_request(&self) -> Result<Option<DecodedRequest>> {
        let raw = self.requests.lock().pop_front();
        raw.map(|raw| DecodedRequest::from_json(&raw)).transpose()
    }

    async fn publish(&self, message: ConvertedMessage) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(IqrfError::Internal("simulated publish failure".to_string()));
        }
        self.published.lock().push(message);
        Ok(())
    }
}

#[derive(Debug)]
struct SpiDevice {
    status: u8,
    outgoing: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
}

/// Simulated SPI slave
///
/// Clones share the same device, so a test keeps one handle while the
/// transport owns the other.
#[derive(Debug, Clone)]
pub struct MockSpiBus {
    device: Arc<Mutex<SpiDevice>>,
    framer: SpiFramer,
}

impl MockSpiBus {
    /// Create a slave in communication mode with nothing to send
    pub fn new() -> Self {
        Self {
            device: Arc::new(Mutex::new(SpiDevice {
                status: 0x80,
                outgoing: VecDeque::new(),
                written: Vec::new(),
            })),
            framer: SpiFramer::new(),
        }
    }

    /// Set the status reported while no data is pending
    pub fn set_status(&self, status: u8) {
        self.device.lock().status = status;
    }

    /// Queue data the slave will announce
    pub fn queue_from_device(&self, data: &[u8]) {
        self.device.lock().outgoing.push_back(data.to_vec());
    }

    /// Data written by the master so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.device.lock().written.clone()
    }
}

impl Default for MockSpiBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SpiBus for MockSpiBus {
    fn transfer(&mut self, tx: &[u8]) -> io::Result<Vec<u8>> {
        let mut device = self.device.lock();
        if tx == [CMD_STATUS] {
            let status = match device.outgoing.front() {
                Some(data) if data.len() == MAX_DATA_LEN => 0x40,
                Some(data) => 0x40 + data.len() as u8,
                None => device.status,
            };
            return Ok(vec![status]);
        }

        let (ptype, data) = self
            .framer
            .parse_master_frame(tx)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        if SpiFramer::is_write(ptype) {
            device.written.push(data.to_vec());
            return Ok(vec![0; tx.len()]);
        }
        match device.outgoing.pop_front() {
            Some(data) => self
                .framer
                .slave_read_response(&data)
                .map(|b| b.to_vec())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
            None => Ok(vec![0; tx.len()]),
        }
    }
}
