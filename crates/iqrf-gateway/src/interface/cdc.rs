//! USB-CDC transport for IQRF coordinators
//!
//! The coordinator firmware delivers whole DPA messages, so packets pass
//! through unchanged. The receive worker parses the CDC command set and
//! calls the listener directly; send replies are routed back to the
//! waiting `send` call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_CDC_RESPONSE_TIMEOUT;
use crate::error::{IqrfError, Result};
use crate::framing::cdc::{encode_send, CdcMessage, CdcParser, SendStatus};
use crate::framing::{CdcFramer, Framer};
use crate::interface::serial::{open_port, read_loop};
use crate::interface::{
    BoxedStream, ListenerSlot, PacketListener, TransportLayer, TransportState, WorkerSet,
};
use crate::packet::Packet;

/// CDC devices ignore the line speed; the port still needs one to open
const CDC_NOMINAL_BAUD: u32 = 115_200;

enum StreamSource {
    Port(PathBuf),
    Stream(BoxedStream),
}

/// Reply routing for the send in flight
///
/// A send that timed out still gets its reply later; `stale` counts those
/// so they are not taken for the reply of a newer send.
#[derive(Debug, Default)]
struct ReplySlot {
    waiting: Option<oneshot::Sender<SendStatus>>,
    stale: usize,
}

type PendingReply = std::sync::Arc<Mutex<ReplySlot>>;

/// USB-CDC transport
pub struct CdcTransport {
    name: String,
    source: Mutex<Option<StreamSource>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    pending: PendingReply,
    response_timeout: Duration,
    listener: ListenerSlot,
    workers: WorkerSet,
}

impl CdcTransport {
    /// Create a transport for a CDC device node
    pub fn new(port: impl AsRef<Path>) -> Self {
        let path = port.as_ref().to_path_buf();
        let name = format!("cdc:{}", path.display());
        Self::build(name, StreamSource::Port(path))
    }

    /// Create a transport over an already open stream
    pub fn from_stream(name: impl Into<String>, stream: BoxedStream) -> Self {
        Self::build(name.into(), StreamSource::Stream(stream))
    }

    fn build(name: String, source: StreamSource) -> Self {
        Self {
            name,
            source: Mutex::new(Some(source)),
            writer: tokio::sync::Mutex::new(None),
            pending: Default::default(),
            response_timeout: DEFAULT_CDC_RESPONSE_TIMEOUT,
            listener: ListenerSlot::new(),
            workers: WorkerSet::new(),
        }
    }

    /// Set how long `send` waits for the device reply
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Get the current lifecycle state
    pub fn state(&self) -> TransportState {
        self.workers.state()
    }

    fn open(&self) -> Result<BoxedStream> {
        let source = self
            .source
            .lock()
            .take()
            .ok_or_else(|| IqrfError::Internal(format!("{}: stream already consumed", self.name)))?;
        match source {
            StreamSource::Stream(stream) => Ok(stream),
            StreamSource::Port(path) => {
                info!(port = %path.display(), "Opening CDC device");
                open_port(&path, CDC_NOMINAL_BAUD).map_err(|e| {
                    *self.source.lock() = Some(StreamSource::Port(path.clone()));
                    match e {
                        IqrfError::FeatureDisabled { feature, .. } => IqrfError::FeatureDisabled {
                            transport: "cdc",
                            feature,
                        },
                        other => other,
                    }
                })
            }
        }
    }
}

fn handle_message(name: &str, msg: CdcMessage, listener: &ListenerSlot, pending: &PendingReply) {
    match msg {
        CdcMessage::Data(packet) => {
            debug!(transport = name, size = packet.len(), "Received packet");
            listener.dispatch(packet);
        }
        CdcMessage::SendResult(status) => {
            let mut slot = pending.lock();
            if slot.stale > 0 {
                slot.stale -= 1;
                debug!(transport = name, ?status, "Discarding late send reply");
            } else if let Some(reply) = slot.waiting.take() {
                let _ = reply.send(status);
            } else {
                warn!(transport = name, ?status, "Unexpected send reply");
            }
        }
        CdcMessage::Other(line) => debug!(transport = name, line = %line, "Ignoring CDC reply"),
    }
}

#[async_trait]
impl TransportLayer for CdcTransport {
    async fn start(&self) -> Result<()> {
        if !self.workers.begin(&self.name)? {
            return Ok(());
        }
        let stream = match self.open() {
            Ok(stream) => stream,
            Err(e) => {
                self.workers.abort_begin();
                error!(transport = %self.name, error = %e, "Failed to open CDC device");
                return Err(e);
            }
        };
        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);

        let mut parser = CdcParser::new();
        let listener = self.listener.clone();
        let pending = self.pending.clone();
        let name = self.name.clone();
        self.workers.spawn(read_loop(
            self.name.clone(),
            reader,
            self.workers.token(),
            move |data| {
                for msg in parser.push(data) {
                    handle_message(&name, msg, &listener, &pending);
                }
            },
        ));

        info!(transport = %self.name, "CDC transport started");
        Ok(())
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        let data = CdcFramer.encode(packet)?;
        let command = encode_send(&data)?;

        // Holding the writer serializes sends, one reply outstanding at a time
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(IqrfError::NotStarted("cdc"))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().waiting = Some(tx);

        debug!(transport = %self.name, size = packet.len(), "Sending data");
        if let Err(e) = writer.write_all(&command).await {
            self.pending.lock().waiting.take();
            error!(transport = %self.name, error = %e, "CDC write error");
            return Err(IqrfError::WriteFailed(e.to_string()));
        }
        writer
            .flush()
            .await
            .map_err(|e| IqrfError::WriteFailed(format!("Flush failed: {}", e)))?;

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(SendStatus::Ok)) => Ok(()),
            Ok(Ok(SendStatus::Busy)) => Err(IqrfError::DeviceRefused("busy".to_string())),
            Ok(Ok(SendStatus::Err)) => Err(IqrfError::DeviceRefused("error".to_string())),
            Ok(Err(_)) => Err(IqrfError::ChannelClosed),
            Err(_) => {
                let mut slot = self.pending.lock();
                if slot.waiting.take().is_some() {
                    slot.stale += 1;
                }
                Err(IqrfError::WriteFailed(format!(
                    "no reply within {}",
                    humantime::format_duration(self.response_timeout)
                )))
            }
        }
    }

    fn register_listener(&self, listener: PacketListener) -> Option<PacketListener> {
        self.listener.replace(listener)
    }

    fn unregister_listener(&self) -> Option<PacketListener> {
        self.listener.take()
    }

    async fn destroy(&self) -> Result<()> {
        self.listener.take();
        if !self.workers.shutdown(&self.name).await {
            return Ok(());
        }
        *self.pending.lock() = ReplySlot::default();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.source.lock().take();
        info!(transport = %self.name, "CDC transport destroyed");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for CdcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdcTransport")
            .field("name", &self.name)
            .field("state", &self.workers.state())
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}
