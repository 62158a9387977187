//! Transport layers connecting the gateway to an IQRF coordinator
//!
//! This module provides one implementation per physical medium:
//!
//! - [`cdc::CdcTransport`] - USB-CDC coordinator (port access needs `serial`)
//! - [`serial::SerialTransport`] - UART with HDLC framing (port access needs `serial`)
//! - [`spi::SpiTransport`] - SPI via spidev (device access needs `spi`)
//! - [`udp::UdpTransport`] - IQRF Ethernet gateway over UDP
//!
//! Every transport also accepts an injected stream or bus, which is how the
//! test suite drives them without hardware.
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```
//!
//! - `spi`: Linux only, requires a `/dev/spidevX.Y` node

pub mod cdc;
pub mod serial;
pub mod spi;
pub mod udp;

pub use cdc::CdcTransport;
pub use serial::SerialTransport;
pub use spi::{SpiBus, SpiMaster, SpiTransport};
pub use udp::UdpTransport;

#[cfg(feature = "spi")]
pub use spi::SpidevBus;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::TransportConfig;
use crate::error::{IqrfError, Result};
use crate::packet::Packet;

/// Callback receiving every packet a transport delivers
///
/// Invoked from a transport worker; it must not block indefinitely.
pub type PacketListener = Arc<dyn Fn(Packet) + Send + Sync>;

/// Byte stream a stream-based transport runs over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed byte stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Trait for IQRF transports
///
/// This trait abstracts over the physical media (CDC, SPI, UART, UDP)
/// providing a unified API for sending packets and receiving them through
/// a single listener slot.
#[async_trait]
pub trait TransportLayer: Send + Sync {
    /// Open the medium and spawn the workers
    async fn start(&self) -> Result<()>;

    /// Send one packet to the coordinator
    async fn send(&self, packet: &Packet) -> Result<()>;

    /// Install a listener, returning the one it replaces
    fn register_listener(&self, listener: PacketListener) -> Option<PacketListener>;

    /// Remove the listener
    fn unregister_listener(&self) -> Option<PacketListener>;

    /// Stop and join the workers, then release the medium
    async fn destroy(&self) -> Result<()>;

    /// Get the transport name (for logging)
    fn name(&self) -> &str;
}

/// Lifecycle state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Constructed, not started yet
    Created,
    /// Workers running
    Started,
    /// Destroyed, cannot be restarted
    Destroyed,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::Created => write!(f, "created"),
            TransportState::Started => write!(f, "started"),
            TransportState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Replaceable listener shared with the workers
#[derive(Clone, Default)]
pub struct ListenerSlot {
    inner: Arc<RwLock<Option<PacketListener>>>,
}

impl ListenerSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a listener, returning the previous one
    pub fn replace(&self, listener: PacketListener) -> Option<PacketListener> {
        self.inner.write().replace(listener)
    }

    /// Remove the listener
    pub fn take(&self) -> Option<PacketListener> {
        self.inner.write().take()
    }

    /// Whether a listener is installed
    pub fn is_set(&self) -> bool {
        self.inner.read().is_some()
    }

    /// Hand a packet to the current listener
    ///
    /// The lock is released before the callback runs so a listener may
    /// replace itself.
    pub fn dispatch(&self, packet: Packet) -> bool {
        let listener = self.inner.read().clone();
        match listener {
            Some(listener) => {
                listener(packet);
                true
            }
            None => {
                debug!(size = packet.len(), "No listener registered, dropping packet");
                false
            }
        }
    }
}

impl std::fmt::Debug for ListenerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSlot")
            .field("set", &self.is_set())
            .finish()
    }
}

/// Worker tasks of one transport, cancelled and joined together
#[derive(Debug)]
pub(crate) struct WorkerSet {
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    state: Mutex<TransportState>,
    joined: CancellationToken,
}

impl WorkerSet {
    pub(crate) fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            state: Mutex::new(TransportState::Created),
            joined: CancellationToken::new(),
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn state(&self) -> TransportState {
        *self.state.lock()
    }

    /// Move from `Created` to `Started`; false when already started
    pub(crate) fn begin(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match *state {
            TransportState::Created => {
                *state = TransportState::Started;
                Ok(true)
            }
            TransportState::Started => Ok(false),
            TransportState::Destroyed => Err(IqrfError::Internal(format!(
                "transport {} already destroyed",
                name
            ))),
        }
    }

    /// Undo `begin` after a failed open
    pub(crate) fn abort_begin(&self) {
        let mut state = self.state.lock();
        if *state == TransportState::Started {
            *state = TransportState::Created;
        }
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.lock().push(tokio::spawn(task));
    }

    /// Cancel every worker and wait until all of them have returned
    ///
    /// Returns false when the set was already shut down. Later callers still
    /// wait until the first one has joined the workers.
    pub(crate) async fn shutdown(&self, name: &str) -> bool {
        let first = {
            let mut state = self.state.lock();
            let first = *state != TransportState::Destroyed;
            *state = TransportState::Destroyed;
            first
        };
        if !first {
            self.joined.cancelled().await;
            return false;
        }
        self.cancel.cancel();

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(transport = name, error = %e, "Worker panicked");
                }
            }
        }
        info!(transport = name, workers = count, "Transport workers stopped");
        self.joined.cancel();
        true
    }
}

/// Spawn a worker handing queued items to `handle` until cancelled
pub(crate) fn spawn_dispatcher<T, F>(
    workers: &WorkerSet,
    name: String,
    mut rx: mpsc::UnboundedReceiver<T>,
    mut handle: F,
) where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    let cancel = workers.token();
    workers.spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => handle(item),
                    None => break,
                },
            }
        }
        debug!(transport = %name, "Dispatcher stopped");
    });
}

/// Create the transport selected by the configuration
///
/// Nothing is opened until [`TransportLayer::start`] is called.
pub fn create_transport(config: &TransportConfig) -> Result<Arc<dyn TransportLayer>> {
    config.validate()?;
    let transport: Arc<dyn TransportLayer> = match config {
        TransportConfig::Cdc {
            port,
            response_timeout,
        } => Arc::new(CdcTransport::new(port).with_response_timeout(*response_timeout)),
        TransportConfig::Spi {
            port,
            send_attempts,
            retry_delay,
            speed_hz,
        } => Arc::new(
            SpiTransport::new(port)
                .with_send_attempts(*send_attempts)
                .with_retry_delay(*retry_delay)
                .with_speed(*speed_hz),
        ),
        TransportConfig::Serial { port, baud_rate } => {
            Arc::new(SerialTransport::new(port).with_baud_rate(*baud_rate))
        }
        TransportConfig::Udp {
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            max_packet_size,
            reception_timeout,
        } => Arc::new(
            UdpTransport::new(
                (*local_addr, *local_port).into(),
                (*remote_addr, *remote_port).into(),
            )
            .with_max_packet_size(*max_packet_size)
            .with_reception_timeout(*reception_timeout),
        ),
    };
    info!(transport = transport.name(), "Transport created");
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_transport_state_display() {
        assert_eq!(TransportState::Started.to_string(), "started");
        assert_eq!(TransportState::Destroyed.to_string(), "destroyed");
    }

    #[test]
    fn test_listener_slot_last_wins() {
        let slot = ListenerSlot::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        assert!(slot
            .replace(Arc::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }))
            .is_none());
        let s = second.clone();
        let previous = slot.replace(Arc::new(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(previous.is_some());

        assert!(slot.dispatch(Packet::from([1])));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        // Restoring the previous listener
        slot.replace(previous.unwrap());
        slot.dispatch(Packet::from([1]));
        assert_eq!(first.load(Ordering::SeqCst), 1);

        assert!(slot.take().is_some());
        assert!(!slot.dispatch(Packet::from([1])));
    }

    #[tokio::test]
    async fn test_worker_set_lifecycle() {
        let workers = WorkerSet::new();
        assert!(workers.begin("test").unwrap());
        assert!(!workers.begin("test").unwrap());

        let token = workers.token();
        workers.spawn(async move { token.cancelled().await });
        assert!(workers.shutdown("test").await);
        assert!(!workers.shutdown("test").await);
        assert_eq!(workers.state(), TransportState::Destroyed);
        assert!(workers.begin("test").is_err());
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_waits_for_join() {
        use std::sync::atomic::AtomicBool;
        use std::time::Duration;

        let workers = WorkerSet::new();
        let finished = Arc::new(AtomicBool::new(false));
        let token = workers.token();
        let done = finished.clone();
        workers.spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            done.store(true, Ordering::SeqCst);
        });

        let (a, b) = tokio::join!(
            async {
                let first = workers.shutdown("test").await;
                (first, finished.load(Ordering::SeqCst))
            },
            async {
                let first = workers.shutdown("test").await;
                (first, finished.load(Ordering::SeqCst))
            }
        );
        assert_eq!(a, (true, true));
        assert_eq!(b, (false, true));
    }

    #[tokio::test]
    async fn test_factory_names() {
        let config = crate::config::GatewayConfigBuilder::new()
            .serial_port("/dev/ttyS3")
            .build();
        let transport = create_transport(&config.transport).unwrap();
        assert_eq!(transport.name(), "serial:/dev/ttyS3");

        let config = crate::config::GatewayConfigBuilder::new()
            .serial_port("")
            .build();
        assert!(create_transport(&config.transport).is_err());
    }
}
