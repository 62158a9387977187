//! Coordinator module id (MID) probe
//!
//! The probe sends an OS "read" request to the coordinator and waits for the
//! answer while temporarily owning the transport's listener slot.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::interface::{PacketListener, TransportLayer};
use crate::packet::Packet;

/// OS read request addressed to the coordinator
pub const MODULE_ID_QUERY: [u8; 6] = [0x00, 0x00, 0x02, 0x00, 0xFF, 0xFF];

/// Leading bytes of the OS read response
const RESPONSE_PREFIX: [u8; 4] = [0x00, 0x00, 0x02, 0x80];

/// Module id reported when the coordinator does not answer
pub const UNKNOWN_MODULE_ID: &str = "unknown";

/// Extract the module id from an OS read response
///
/// The id occupies bytes 8..12 and is rendered most significant byte first.
pub fn parse_module_id(packet: &Packet) -> Option<String> {
    let b = packet.as_bytes();
    if b.len() < 12 || !b.starts_with(&RESPONSE_PREFIX) {
        return None;
    }
    Some(hex::encode([b[11], b[10], b[9], b[8]]))
}

/// One-shot listener resolving the module id
#[derive(Debug)]
pub struct ModuleIdProbe {
    reply: Mutex<Option<oneshot::Sender<String>>>,
}

impl ModuleIdProbe {
    /// Create a probe and the receiver its result arrives on
    pub fn new() -> (Arc<Self>, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                reply: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Whether the module id was already handed over
    pub fn is_resolved(&self) -> bool {
        self.reply.lock().is_none()
    }

    /// Inspect one packet
    pub fn on_packet(&self, packet: Packet) {
        let Some(mid) = parse_module_id(&packet) else {
            debug!(?packet, "Probe ignoring packet");
            return;
        };
        match self.reply.lock().take() {
            Some(reply) => {
                let _ = reply.send(mid);
            }
            None => debug!(mid = %mid, "Module id already resolved"),
        }
    }

    /// Listener forwarding to this probe
    pub fn listener(self: &Arc<Self>) -> PacketListener {
        let probe = self.clone();
        Arc::new(move |packet| probe.on_packet(packet))
    }
}

/// Ask the coordinator for its module id
///
/// Callers must serialize probes; the transport's previous listener is
/// restored before returning. Yields [`UNKNOWN_MODULE_ID`] on timeout.
pub async fn probe_module_id(transport: &dyn TransportLayer, wait: Duration) -> String {
    let (probe, rx) = ModuleIdProbe::new();
    let previous = transport.register_listener(probe.listener());

    let mid = match transport.send(&Packet::from(MODULE_ID_QUERY)).await {
        Ok(()) => match tokio::time::timeout(wait, rx).await {
            Ok(Ok(mid)) => mid,
            Ok(Err(_)) | Err(_) => {
                warn!(transport = transport.name(), "No module id received");
                UNKNOWN_MODULE_ID.to_string()
            }
        },
        Err(e) => {
            warn!(transport = transport.name(), error = %e, "Failed to send module id query");
            UNKNOWN_MODULE_ID.to_string()
        }
    };

    match previous {
        Some(previous) => {
            transport.register_listener(previous);
        }
        None => {
            transport.unregister_listener();
        }
    }
    info!(transport = transport.name(), mid = %mid, "Module id probed");
    mid
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_read_response() -> Packet {
        Packet::from([
            0x00, 0x00, 0x02, 0x80, 0x00, 0x00, 0x00, 0x00, 0x78, 0x56, 0x34, 0x81, 0x24, 0xB8,
        ])
    }

    #[test]
    fn test_parse_module_id() {
        assert_eq!(
            parse_module_id(&os_read_response()).as_deref(),
            Some("81345678")
        );
        // Too short
        assert!(parse_module_id(&Packet::from([0x00, 0x00, 0x02, 0x80, 0, 0, 0, 0, 1, 2, 3])).is_none());
        // Not an OS read response
        assert!(parse_module_id(&Packet::from([0x00, 0x00, 0x02, 0x00, 0, 0, 0, 0, 1, 2, 3, 4])).is_none());
    }

    #[tokio::test]
    async fn test_probe_fires_once() {
        let (probe, rx) = ModuleIdProbe::new();
        let listener = probe.listener();
        listener(Packet::from([0x00, 0x00, 0x0A, 0x80, 0xFF, 0xFF]));
        assert!(!probe.is_resolved());
        listener(os_read_response());
        assert!(probe.is_resolved());
        listener(os_read_response());
        assert_eq!(rx.await.unwrap(), "81345678");
    }
}
