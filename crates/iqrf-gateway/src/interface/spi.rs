//! SPI transport for IQRF TR modules
//!
//! A poller worker reads the slave status every few milliseconds and pulls
//! data out whenever the module reports some. Sending waits until the module
//! is ready for communication, retrying with a fixed delay.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::config::{DEFAULT_SPI_RETRY_DELAY, DEFAULT_SPI_SEND_ATTEMPTS, DEFAULT_SPI_SPEED_HZ};
use crate::error::{IqrfError, Result};
use crate::framing::spi::{SpiFramer, SpiStatus};
use crate::interface::{
    spawn_dispatcher, ListenerSlot, PacketListener, TransportLayer, TransportState, WorkerSet,
};
use crate::packet::Packet;

/// Status poll period
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Full duplex byte transfer on a SPI bus
pub trait SpiBus: Send {
    /// Clock `tx` out and return the bytes clocked in
    fn transfer(&mut self, tx: &[u8]) -> std::io::Result<Vec<u8>>;
}

/// Linux spidev bus
#[cfg(feature = "spi")]
pub struct SpidevBus {
    dev: spidev::Spidev,
}

#[cfg(feature = "spi")]
impl SpidevBus {
    /// Open and configure a spidev node (mode 0, 8 bit words)
    pub fn open(path: &Path, speed_hz: u32) -> Result<Self> {
        use spidev::{SpiModeFlags, Spidev, SpidevOptions};

        if !path.exists() {
            return Err(IqrfError::PortNotFound(path.display().to_string()));
        }
        let open_failed = |e: std::io::Error| IqrfError::PortOpenFailed {
            port: path.display().to_string(),
            reason: e.to_string(),
        };
        let mut dev = Spidev::open(path).map_err(open_failed)?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(speed_hz)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        dev.configure(&options).map_err(open_failed)?;
        Ok(Self { dev })
    }
}

#[cfg(feature = "spi")]
impl SpiBus for SpidevBus {
    fn transfer(&mut self, tx: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut rx = vec![0u8; tx.len()];
        {
            let mut transfer = spidev::SpidevTransfer::read_write(tx, &mut rx);
            self.dev.transfer(&mut transfer)?;
        }
        Ok(rx)
    }
}

/// IQRF SPI master on top of a bus
pub struct SpiMaster {
    bus: Box<dyn SpiBus>,
    framer: SpiFramer,
}

impl SpiMaster {
    /// Wrap a bus
    pub fn new(bus: Box<dyn SpiBus>) -> Self {
        Self {
            bus,
            framer: SpiFramer::new(),
        }
    }

    /// Read the slave status
    pub fn status(&mut self) -> Result<SpiStatus> {
        let rx = self.bus.transfer(&self.framer.status_request())?;
        let byte = rx.first().copied().ok_or(IqrfError::Truncated { got: 0, need: 1 })?;
        Ok(SpiStatus::from(byte))
    }

    /// Read `len` bytes the slave has ready
    pub fn read_data(&mut self, len: usize) -> Result<Packet> {
        let tx = self.framer.encode_read(len)?;
        let rx = self.bus.transfer(&tx)?;
        self.framer.decode_read_response(len, &rx)
    }

    /// Write data to the slave
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let tx = self.framer.encode_write(data)?;
        self.bus
            .transfer(&tx)
            .map_err(|e| IqrfError::WriteFailed(e.to_string()))?;
        Ok(())
    }
}

type SharedMaster = Arc<Mutex<Option<SpiMaster>>>;

/// SPI transport
pub struct SpiTransport {
    name: String,
    port: Option<PathBuf>,
    speed_hz: u32,
    attempt_limit: Option<u32>,
    retry_delay: Duration,
    pending_bus: Mutex<Option<Box<dyn SpiBus>>>,
    master: SharedMaster,
    listener: ListenerSlot,
    workers: WorkerSet,
}

impl SpiTransport {
    /// Create a transport for a spidev node
    pub fn new(port: impl AsRef<Path>) -> Self {
        let path = port.as_ref().to_path_buf();
        let name = format!("spi:{}", path.display());
        Self::build(name, Some(path), None)
    }

    /// Create a transport over an existing bus
    pub fn from_bus(name: impl Into<String>, bus: Box<dyn SpiBus>) -> Self {
        Self::build(name.into(), None, Some(bus))
    }

    fn build(name: String, port: Option<PathBuf>, bus: Option<Box<dyn SpiBus>>) -> Self {
        Self {
            name,
            port,
            speed_hz: DEFAULT_SPI_SPEED_HZ,
            attempt_limit: Some(DEFAULT_SPI_SEND_ATTEMPTS as u32),
            retry_delay: DEFAULT_SPI_RETRY_DELAY,
            pending_bus: Mutex::new(bus),
            master: Arc::new(Mutex::new(None)),
            listener: ListenerSlot::new(),
            workers: WorkerSet::new(),
        }
    }

    /// Set the number of send attempts; negative means unlimited
    pub fn with_send_attempts(mut self, attempts: i32) -> Self {
        self.attempt_limit = u32::try_from(attempts).ok();
        self
    }

    /// Set the delay between send attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the SPI clock used when the device is opened
    pub fn with_speed(mut self, speed_hz: u32) -> Self {
        self.speed_hz = speed_hz;
        self
    }

    /// Get the current lifecycle state
    pub fn state(&self) -> TransportState {
        self.workers.state()
    }

    fn open(&self) -> Result<Box<dyn SpiBus>> {
        if let Some(bus) = self.pending_bus.lock().take() {
            return Ok(bus);
        }
        let Some(path) = self.port.as_ref() else {
            return Err(IqrfError::Internal(format!("{}: bus already consumed", self.name)));
        };
        info!(port = %path.display(), speed_hz = self.speed_hz, "Opening SPI device");
        #[cfg(feature = "spi")]
        return Ok(Box::new(SpidevBus::open(path, self.speed_hz)?));
        #[cfg(not(feature = "spi"))]
        return Err(IqrfError::FeatureDisabled {
            transport: "spi",
            feature: "spi",
        });
    }
}

/// One poll: read the status and pull ready data
fn poll_once(name: &str, master: &SharedMaster) -> Option<Packet> {
    let mut guard = master.lock();
    let master = guard.as_mut()?;
    match master.status() {
        Ok(SpiStatus::DataReady(len)) => match master.read_data(len) {
            Ok(packet) => {
                debug!(transport = name, size = len, "Read packet");
                Some(packet)
            }
            Err(e) => {
                warn!(transport = name, error = %e, "SPI read failed");
                None
            }
        },
        Ok(status) => {
            trace!(transport = name, ?status, "SPI status");
            None
        }
        Err(e) => {
            warn!(transport = name, error = %e, "SPI status read failed");
            None
        }
    }
}

/// Outcome of one send attempt
enum SendAttempt {
    Written,
    NotReady(SpiStatus),
    StatusFailed(IqrfError),
}

/// Write `data` if the slave is ready; runs blocking bus transfers
fn try_write(master: &SharedMaster, data: &[u8]) -> Result<SendAttempt> {
    let mut guard = master.lock();
    let master = guard.as_mut().ok_or(IqrfError::NotStarted("spi"))?;
    match master.status() {
        Ok(SpiStatus::ReadyComm) => {
            master.write_data(data)?;
            Ok(SendAttempt::Written)
        }
        Ok(status) => Ok(SendAttempt::NotReady(status)),
        Err(e) => Ok(SendAttempt::StatusFailed(e)),
    }
}

#[async_trait]
impl TransportLayer for SpiTransport {
    async fn start(&self) -> Result<()> {
        if !self.workers.begin(&self.name)? {
            return Ok(());
        }
        let bus = match self.open() {
            Ok(bus) => bus,
            Err(e) => {
                self.workers.abort_begin();
                error!(transport = %self.name, error = %e, "Failed to open SPI device");
                return Err(e);
            }
        };
        *self.master.lock() = Some(SpiMaster::new(bus));

        let (tx, rx) = mpsc::unbounded_channel::<Packet>();

        let master = self.master.clone();
        let cancel = self.workers.token();
        let name = self.name.clone();
        self.workers.spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(packet) = poll_once(&name, &master) {
                            if tx.send(packet).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            debug!(transport = %name, "Poller stopped");
        });

        let listener = self.listener.clone();
        spawn_dispatcher(&self.workers, self.name.clone(), rx, move |packet| {
            listener.dispatch(packet);
        });

        info!(transport = %self.name, "SPI transport started");
        Ok(())
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        let cancel = self.workers.token();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let master = self.master.clone();
            let data = packet.clone();
            let outcome = tokio::task::spawn_blocking(move || try_write(&master, data.as_bytes()))
                .await
                .map_err(|e| IqrfError::Internal(format!("SPI transfer task failed: {}", e)))??;
            match outcome {
                SendAttempt::Written => {
                    debug!(transport = %self.name, size = packet.len(), attempt, "Packet written");
                    return Ok(());
                }
                SendAttempt::NotReady(status) => {
                    debug!(transport = %self.name, ?status, attempt, "SPI not ready for sending")
                }
                SendAttempt::StatusFailed(e) => {
                    warn!(transport = %self.name, error = %e, attempt, "SPI status read failed")
                }
            }

            if self.attempt_limit.is_some_and(|limit| attempt >= limit) {
                warn!(transport = %self.name, attempts = attempt, "Giving up sending");
                return Err(IqrfError::SendTimeout { attempts: attempt });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(IqrfError::NotStarted("spi")),
                _ = tokio::time::sleep(self.retry_delay) => {}
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
        if !self.workers.shutdown(&self.name).await {
            return Ok(());
        }
        self.master.lock().take();
        self.pending_bus.lock().take();
        self.listener.take();
        info!(transport = %self.name, "SPI transport destroyed");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SpiTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpiTransport")
            .field("name", &self.name)
            .field("state", &self.workers.state())
            .field("attempt_limit", &self.attempt_limit)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockSpiBus;
    use tokio::time::{timeout, Instant};

    #[tokio::test]
    async fn test_master_operations() {
        let bus = MockSpiBus::new();
        let handle = bus.clone();
        let mut master = SpiMaster::new(Box::new(bus));

        assert_eq!(master.status().unwrap(), SpiStatus::ReadyComm);
        master.write_data(&[0x00, 0x00, 0x06, 0x03, 0xFF, 0xFF]).unwrap();
        assert_eq!(handle.written(), vec![vec![0x00, 0x00, 0x06, 0x03, 0xFF, 0xFF]]);

        handle.queue_from_device(&[0x01, 0x02, 0x03]);
        assert_eq!(master.status().unwrap(), SpiStatus::DataReady(3));
        assert_eq!(master.read_data(3).unwrap(), Packet::from([0x01, 0x02, 0x03]));
    }

    #[tokio::test]
    async fn test_poller_delivers_packets() {
        let bus = MockSpiBus::new();
        let handle = bus.clone();
        let transport = SpiTransport::from_bus("spi:test", Box::new(bus));
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.register_listener(Arc::new(move |p| {
            let _ = tx.send(p);
        }));
        transport.start().await.unwrap();

        let full = vec![0x5A; 64];
        handle.queue_from_device(&[0x00, 0x00, 0x0A, 0x80, 0xFF, 0xFF, 0x00]);
        handle.queue_from_device(&full);

        let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.as_bytes(), &[0x00, 0x00, 0x0A, 0x80, 0xFF, 0xFF, 0x00]);
        let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.as_bytes(), full.as_slice());

        transport.destroy().await.unwrap();
        assert_eq!(transport.state(), TransportState::Destroyed);
    }

    #[tokio::test]
    async fn test_send_when_ready() {
        let bus = MockSpiBus::new();
        let handle = bus.clone();
        let transport = SpiTransport::from_bus("spi:test", Box::new(bus));
        transport.start().await.unwrap();

        transport.send(&Packet::from([0x00, 0x00, 0x06, 0x03, 0xFF, 0xFF])).await.unwrap();
        assert_eq!(handle.written().len(), 1);
        transport.destroy().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_gives_up_after_three_attempts() {
        let bus = MockSpiBus::new();
        let handle = bus.clone();
        handle.set_status(0xFF);
        let transport = SpiTransport::from_bus("spi:test", Box::new(bus));
        transport.start().await.unwrap();

        let started = Instant::now();
        let err = transport.send(&Packet::from([0x01])).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, IqrfError::SendTimeout { attempts: 3 }));
        // Two waits between three attempts, none after the last
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(15));
        assert!(handle.written().is_empty());

        transport.destroy().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_succeeds_on_later_attempt() {
        let bus = MockSpiBus::new();
        let handle = bus.clone();
        handle.set_status(0xFF);
        let transport = Arc::new(SpiTransport::from_bus("spi:test", Box::new(bus)));
        transport.start().await.unwrap();

        let sender = transport.clone();
        let send = tokio::spawn(async move { sender.send(&Packet::from([0x01])).await });
        tokio::time::sleep(Duration::from_secs(7)).await;
        handle.set_status(0x80);
        send.await.unwrap().unwrap();
        assert_eq!(handle.written(), vec![vec![0x01]]);

        transport.destroy().await.unwrap();
    }

    #[test]
    fn test_negative_attempts_are_unlimited() {
        let transport = SpiTransport::new("/dev/spidev0.0").with_send_attempts(-1);
        assert_eq!(transport.attempt_limit, None);
        let transport = SpiTransport::new("/dev/spidev0.0").with_send_attempts(5);
        assert_eq!(transport.attempt_limit, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_attempts_keep_retrying() {
        let bus = MockSpiBus::new();
        let handle = bus.clone();
        handle.set_status(0xFF);
        let transport = Arc::new(
            SpiTransport::from_bus("spi:test", Box::new(bus)).with_send_attempts(-1),
        );
        transport.start().await.unwrap();

        let sender = transport.clone();
        let started = Instant::now();
        let send = tokio::spawn(async move { sender.send(&Packet::from([0x01])).await });

        // Five attempts at 0, 5, 10, 15 and 20 seconds, all refused
        tokio::time::sleep(Duration::from_secs(22)).await;
        assert!(!send.is_finished());
        assert!(handle.written().is_empty());

        handle.set_status(0x80);
        send.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_secs(25));
        assert_eq!(handle.written(), vec![vec![0x01]]);

        transport.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_before_start() {
        let transport = SpiTransport::from_bus("spi:test", Box::new(MockSpiBus::new()));
        assert!(matches!(
            transport.send(&Packet::from([1])).await,
            Err(IqrfError::NotStarted("spi"))
        ));
    }
}
