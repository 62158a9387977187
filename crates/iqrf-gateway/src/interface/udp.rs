//! UDP transport for the IQRF Ethernet gateway
//!
//! # Requirements
//!
//! None, the transport only needs a reachable gateway.
//!
//! The receive worker waits on the socket with a timeout so cancellation is
//! noticed promptly; a timeout is not an error. Only datagrams announcing
//! asynchronous TR data reach the listener, gateway replies to our own
//! requests are dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::{DEFAULT_MAX_PACKET_SIZE, DEFAULT_RECEPTION_TIMEOUT};
use crate::error::{IqrfError, Result};
use crate::framing::GatewayFramer;
use crate::interface::{
    spawn_dispatcher, ListenerSlot, PacketListener, TransportLayer, TransportState, WorkerSet,
};
use crate::packet::Packet;

/// Transport talking to an IQRF Ethernet gateway
pub struct UdpTransport {
    name: String,
    local: SocketAddr,
    remote: SocketAddr,
    max_packet_size: usize,
    reception_timeout: Duration,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    framer: Arc<GatewayFramer>,
    listener: ListenerSlot,
    workers: WorkerSet,
}

impl UdpTransport {
    /// Create a new UDP transport
    ///
    /// # Arguments
    ///
    /// * `local` - Address to bind (e.g., "0.0.0.0:55000")
    /// * `remote` - Gateway address (e.g., "192.168.1.100:55000")
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            name: format!("udp:{}", remote),
            local,
            remote,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            reception_timeout: DEFAULT_RECEPTION_TIMEOUT,
            socket: Mutex::new(None),
            framer: Arc::new(GatewayFramer::new()),
            listener: ListenerSlot::new(),
            workers: WorkerSet::new(),
        }
    }

    /// Set the largest datagram accepted
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set the receive timeout; zero waits indefinitely
    pub fn with_reception_timeout(mut self, timeout: Duration) -> Self {
        self.reception_timeout = timeout;
        self
    }

    /// Bound local address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    /// Get the current lifecycle state
    pub fn state(&self) -> TransportState {
        self.workers.state()
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .clone()
            .ok_or(IqrfError::NotStarted("udp"))
    }
}

async fn receive(socket: &UdpSocket, buf: &mut [u8], timeout: Duration) -> Option<std::io::Result<(usize, SocketAddr)>> {
    if timeout.is_zero() {
        return Some(socket.recv_from(buf).await);
    }
    tokio::time::timeout(timeout, socket.recv_from(buf)).await.ok()
}

#[async_trait]
impl TransportLayer for UdpTransport {
    async fn start(&self) -> Result<()> {
        if !self.workers.begin(&self.name)? {
            return Ok(());
        }
        let socket = match UdpSocket::bind(self.local).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.workers.abort_begin();
                error!(transport = %self.name, local = %self.local, error = %e, "Failed to bind UDP socket");
                return Err(IqrfError::BindFailed {
                    addr: self.local.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        *self.socket.lock() = Some(socket.clone());

        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();

        let cancel = self.workers.token();
        let name = self.name.clone();
        let timeout = self.reception_timeout;
        let mut buf = vec![0u8; self.max_packet_size];
        self.workers.spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    received = receive(&socket, &mut buf, timeout) => received,
                };
                match received {
                    None => trace!(transport = %name, "Reception timeout"),
                    Some(Ok((n, from))) => {
                        trace!(transport = %name, bytes = n, %from, "Datagram received");
                        if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => warn!(transport = %name, error = %e, "UDP receive error"),
                }
            }
            debug!(transport = %name, "Receiver stopped");
        });

        let listener = self.listener.clone();
        let framer = self.framer.clone();
        let name = self.name.clone();
        spawn_dispatcher(&self.workers, self.name.clone(), rx, move |datagram: Bytes| {
            match framer.parse(&datagram) {
                Ok(msg) if msg.is_async() => {
                    debug!(transport = %name, size = msg.data.len(), "Received packet");
                    listener.dispatch(Packet::new(msg.data));
                }
                Ok(msg) => debug!(
                    transport = %name,
                    command = msg.command,
                    packet_id = msg.packet_id,
                    "Dropping gateway message"
                ),
                Err(e) => {
                    warn!(transport = %name, error = %e, code = e.error_code(), "Dropping undecodable datagram")
                }
            }
        });

        info!(transport = %self.name, local = %self.local, "UDP transport started");
        Ok(())
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        let socket = self.socket()?;
        let datagram = self.framer.encode_request(packet)?;
        debug!(transport = %self.name, size = datagram.len(), "Sending datagram");
        socket.send_to(&datagram, self.remote).await.map_err(|e| {
            error!(transport = %self.name, error = %e, "UDP send error");
            IqrfError::WriteFailed(e.to_string())
        })?;
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
        self.socket.lock().take();
        self.listener.take();
        info!(transport = %self.name, "UDP transport destroyed");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.workers.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::gweth::{CMD_ASYNC_TR_DATA, CMD_WRITE_TR, RESPONSE_FLAG};
    use tokio::time::timeout;

    async fn setup(
        reception_timeout: Duration,
    ) -> (UdpTransport, UdpSocket, mpsc::UnboundedReceiver<Packet>) {
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::new(
            "127.0.0.1:0".parse().unwrap(),
            gateway.local_addr().unwrap(),
        )
        .with_reception_timeout(reception_timeout);
        let (tx, rx) = mpsc::unbounded_channel();
        transport.register_listener(Arc::new(move |p| {
            let _ = tx.send(p);
        }));
        transport.start().await.unwrap();
        (transport, gateway, rx)
    }

    #[tokio::test]
    async fn test_send_wraps_request() {
        let (transport, gateway, _rx) = setup(Duration::from_millis(100)).await;
        let packet = Packet::from([0x00, 0x00, 0x06, 0x03, 0xFF, 0xFF]);
        transport.send(&packet).await.unwrap();

        let mut buf = [0u8; 512];
        let (n, from) = timeout(Duration::from_secs(2), gateway.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some(from), transport.local_addr());
        let msg = GatewayFramer::new().parse(&buf[..n]).unwrap();
        assert_eq!(msg.command, CMD_WRITE_TR);
        assert_eq!(msg.data.as_ref(), packet.as_bytes());

        transport.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_only_async_data_is_delivered() {
        let (transport, gateway, mut rx) = setup(Duration::from_millis(100)).await;
        let target = transport.local_addr().unwrap();
        let framer = GatewayFramer::new();

        let reply = framer
            .encode_with(CMD_WRITE_TR | RESPONSE_FLAG, 0, &[0x01])
            .unwrap();
        gateway.send_to(&reply, target).await.unwrap();
        let data = [0x00, 0x00, 0x0A, 0x80, 0xFF, 0xFF, 0x00, 0x1E, 0x05];
        let async_data = framer.encode_with(CMD_ASYNC_TR_DATA, 0, &data).unwrap();
        gateway.send_to(&async_data, target).await.unwrap();

        let got = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_bytes(), &data);
        assert!(rx.try_recv().is_err());

        transport.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_delivery_after_reception_timeout() {
        let (transport, gateway, mut rx) = setup(Duration::from_millis(20)).await;
        let target = transport.local_addr().unwrap();

        // Let several receive timeouts pass first
        tokio::time::sleep(Duration::from_millis(150)).await;

        let framer = GatewayFramer::new();
        let dg = framer.encode_with(CMD_ASYNC_TR_DATA, 0, &[0xAA]).unwrap();
        gateway.send_to(&dg, target).await.unwrap();

        let got = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Packet::from([0xAA]));
        transport.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_blocking_reception_still_cancels() {
        let (transport, _gateway, _rx) = setup(Duration::ZERO).await;
        timeout(Duration::from_secs(2), transport.destroy())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transport.state(), TransportState::Destroyed);
        assert!(transport.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let holder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::new(
            holder.local_addr().unwrap(),
            "127.0.0.1:55000".parse().unwrap(),
        );
        let err = transport.start().await.unwrap_err();
        assert!(err.is_init_error());
        assert_eq!(transport.state(), TransportState::Created);
    }
}
