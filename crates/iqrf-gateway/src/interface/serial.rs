//! UART transport for IQRF TR modules
//!
//! Bytes from the port are cut into `0x7E … 0x7E` runs by a
//! [`FrameChunker`] on the receive worker. Completed runs go through an
//! internal queue to a drain worker which removes the HDLC framing and hands
//! the packet to the listener.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::DEFAULT_BAUD_RATE;
use crate::error::{IqrfError, Result};
use crate::framing::hdlc::FLAG;
use crate::framing::{FrameChunker, Framer, HdlcFramer};
use crate::interface::{
    spawn_dispatcher, BoxedStream, ListenerSlot, PacketListener, TransportLayer, TransportState,
    WorkerSet,
};
use crate::packet::Packet;

/// Buffer size for reading from serial port
const READ_BUFFER_SIZE: usize = 512;

/// Pause after a failed read before trying again
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Where the byte stream comes from
enum StreamSource {
    Port { path: PathBuf, baud_rate: u32 },
    Stream(BoxedStream),
}

/// Open a serial port as an async stream
#[cfg(feature = "serial")]
pub(crate) fn open_port(path: &Path, baud_rate: u32) -> Result<BoxedStream> {
    use tokio_serial::SerialPortBuilderExt;

    if !path.exists() {
        return Err(IqrfError::PortNotFound(path.display().to_string()));
    }
    let stream = tokio_serial::new(path.to_string_lossy(), baud_rate)
        .open_native_async()
        .map_err(|e| IqrfError::PortOpenFailed {
            port: path.display().to_string(),
            reason: e.to_string(),
        })?;
    Ok(Box::new(stream))
}

#[cfg(not(feature = "serial"))]
pub(crate) fn open_port(_path: &Path, _baud_rate: u32) -> Result<BoxedStream> {
    Err(IqrfError::FeatureDisabled {
        transport: "serial",
        feature: "serial",
    })
}

/// Run the read side of a stream until cancelled
///
/// Read errors and end of stream are logged and retried after a short pause;
/// only cancellation ends the loop.
pub(crate) async fn read_loop<F>(
    name: String,
    mut reader: ReadHalf<BoxedStream>,
    cancel: tokio_util::sync::CancellationToken,
    mut on_bytes: F,
) where
    F: FnMut(&[u8]) + Send,
{
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = reader.read(&mut buf) => result,
        };
        let failed = match result {
            Ok(0) => {
                warn!(transport = %name, "End of stream");
                true
            }
            Ok(n) => {
                trace!(transport = %name, bytes = n, "Read from port");
                on_bytes(&buf[..n]);
                false
            }
            Err(e) => {
                warn!(transport = %name, error = %e, "Read error");
                true
            }
        };
        if failed {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
            }
        }
    }
    debug!(transport = %name, "Reader stopped");
}

/// Remove the HDLC frame and the optional inner flags around the payload
fn unwrap_frame(framer: &HdlcFramer, frame: &[u8]) -> Result<Packet> {
    let packet = framer.decode(frame)?;
    let b = packet.as_bytes();
    if b.len() >= 2 && b[0] == FLAG && b[b.len() - 1] == FLAG {
        return Ok(Packet::copy_from_slice(&b[1..b.len() - 1]));
    }
    Ok(packet)
}

/// UART transport for a TR module
///
/// Frames are `0x7E | escaped data and CRC-8 | 0x7E`.
pub struct SerialTransport {
    /// Transport name for logging
    name: String,

    /// Stream to open on start
    source: Mutex<Option<StreamSource>>,

    /// Write half (when started)
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,

    listener: ListenerSlot,
    workers: WorkerSet,
    framer: HdlcFramer,
}

impl SerialTransport {
    /// Create a transport for a serial port
    pub fn new(port: impl AsRef<Path>) -> Self {
        let path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", path.display());
        Self::build(
            name,
            StreamSource::Port {
                path,
                baud_rate: DEFAULT_BAUD_RATE,
            },
        )
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
            listener: ListenerSlot::new(),
            workers: WorkerSet::new(),
            framer: HdlcFramer::new(),
        }
    }

    /// Set the baud rate used when the port is opened
    pub fn with_baud_rate(self, baud_rate: u32) -> Self {
        if let Some(StreamSource::Port { baud_rate: b, .. }) = self.source.lock().as_mut() {
            *b = baud_rate;
        }
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
            StreamSource::Port { path, baud_rate } => {
                info!(port = %path.display(), baud = baud_rate, "Opening serial port");
                match open_port(&path, baud_rate) {
                    Ok(stream) => Ok(stream),
                    Err(e) => {
                        // Keep the source so a later start can retry
                        *self.source.lock() = Some(StreamSource::Port { path, baud_rate });
                        Err(e)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TransportLayer for SerialTransport {
    async fn start(&self) -> Result<()> {
        if !self.workers.begin(&self.name)? {
            debug!(transport = %self.name, "Already started");
            return Ok(());
        }
        let stream = match self.open() {
            Ok(stream) => stream,
            Err(e) => {
                self.workers.abort_begin();
                error!(transport = %self.name, error = %e, "Failed to open port");
                return Err(e);
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);

        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();

        let mut chunker = FrameChunker::new();
        let name = self.name.clone();
        let cancel = self.workers.token();
        self.workers.spawn(read_loop(name, reader, cancel, move |data| {
            for frame in chunker.push(data) {
                if tx.send(frame).is_err() {
                    return;
                }
            }
        }));

        let listener = self.listener.clone();
        let framer = self.framer;
        let name = self.name.clone();
        spawn_dispatcher(&self.workers, self.name.clone(), rx, move |frame: Bytes| {
            match unwrap_frame(&framer, &frame) {
                Ok(packet) => {
                    debug!(transport = %name, size = packet.len(), "Received packet");
                    listener.dispatch(packet);
                }
                Err(e) => {
                    warn!(transport = %name, error = %e, code = e.error_code(), "Dropping undecodable frame")
                }
            }
        });

        info!(transport = %self.name, "Serial transport started");
        Ok(())
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        let frame = self.framer.encode(packet)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(IqrfError::NotStarted("serial"))?;

        debug!(
            transport = %self.name,
            size = frame.len(),
            payload_size = packet.len(),
            "Writing frame"
        );
        writer.write_all(&frame).await.map_err(|e| {
            error!(transport = %self.name, error = %e, "Serial write error");
            IqrfError::WriteFailed(e.to_string())
        })?;
        writer
            .flush()
            .await
            .map_err(|e| IqrfError::WriteFailed(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    fn register_listener(&self, listener: PacketListener) -> Option<PacketListener> {
        self.listener.replace(listener)
    }

    fn unregister_listener(&self) -> Option<PacketListener> {
        self.listener.take()
    }

    async fn destroy(&self) -> Result<()> {
        if !self.workers.shutdown(&self.name).await {
            return Ok(());
        }
        // Dropping the write half closes the port once the reader is gone
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.source.lock().take();
        self.listener.take();
        info!(transport = %self.name, "Serial transport destroyed");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("name", &self.name)
            .field("state", &self.workers.state())
            .field("listener", &self.listener)
            .finish()
    }
}
