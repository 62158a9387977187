//! Bridge between an IQRF transport and a messaging collaborator
//!
//! The bridge owns two FIFO queues:
//!
//! - inbound: packets from the mesh, classified and converted to JSON, waiting
//!   for the publisher to pick them up
//! - outbound: requests from the messaging side, converted to packets, waiting
//!   for the sender worker to hand them to the transport
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐ listener  ┌──────────────────────────┐  publish_pending  ┌───────────┐
//! │ Transport │──────────►│ classify → convert → rx  │──────────────────►│           │
//! │           │           │                          │                   │ Messenger │
//! │           │◄──────────│ tx ← convert             │◄──────────────────│           │
//! └───────────┘  sender   └──────────────────────────┘   pump_requests   └───────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use iqrf_gateway::{create_converter, create_transport, Bridge, GatewayConfig};
//!
//! let config = GatewayConfig::default();
//! let transport = create_transport(&config.transport)?;
//! let converter = create_converter(config.bridge.converter, "000000000000");
//! let bridge = Bridge::new(transport, converter, config.bridge);
//! bridge.start().await?;
//! let mid = bridge.read_module_id().await;
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::BridgeConfig;
use crate::convert::{ConvertedMessage, DecodedRequest, MessageConverter};
use crate::error::{IqrfError, Result};
use crate::interface::TransportLayer;
use crate::mid::probe_module_id;
use crate::packet::{classify, Packet};

/// Messaging side of the bridge
///
/// Implemented by the MQTT client in the binary and by mocks in tests.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Whether a request is waiting to be taken
    fn is_request_available(&self) -> bool;

    /// Take the next request
    ///
    /// An error means the request could not be parsed; it is consumed anyway.
    fn take_request(&self) -> Result<Option<DecodedRequest>>;

    /// Publish one converted message
    async fn publish(&self, message: ConvertedMessage) -> Result<()>;
}

/// Bridge statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    /// Packets received from the transport and queued
    pub received_messages: u64,
    /// Packets handed to the transport successfully
    pub sent_messages: u64,
    /// Messages published to the messaging side
    pub published_messages: u64,
    /// Packets or requests that failed conversion
    pub conversion_errors: u64,
    /// Transport send failures
    pub send_errors: u64,
    /// Entries dropped because a queue was full
    pub dropped_messages: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    sent: AtomicU64,
    published: AtomicU64,
    conversion_errors: AtomicU64,
    send_errors: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            received_messages: self.received.load(Ordering::Relaxed),
            sent_messages: self.sent.load(Ordering::Relaxed),
            published_messages: self.published.load(Ordering::Relaxed),
            conversion_errors: self.conversion_errors.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            dropped_messages: self.dropped.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    transport: Arc<dyn TransportLayer>,
    converter: Arc<dyn MessageConverter>,
    config: BridgeConfig,
    inbound: Mutex<VecDeque<ConvertedMessage>>,
    outbound: Mutex<VecDeque<Packet>>,
    outbound_ready: Notify,
    probe_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    sender: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    counters: Counters,
}

impl Inner {
    fn push_capped<T>(&self, queue: &Mutex<VecDeque<T>>, item: T, direction: &str) -> bool {
        let mut queue = queue.lock();
        if let Some(max) = self.config.max_queue_len {
            if queue.len() >= max {
                drop(queue);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(direction, max, "Queue full, dropping entry");
                return false;
            }
        }
        queue.push_back(item);
        true
    }

    fn enqueue_inbound(&self, packet: Packet) {
        let role = classify(&packet);
        trace!(?packet, role = role.as_str(), "Inbound packet");
        match self.converter.to_message(&packet, role) {
            Ok(message) => {
                if self.push_capped(&self.inbound, message, "inbound") {
                    self.counters.received.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                self.counters
                    .conversion_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, code = e.error_code(), "Failed to convert inbound packet");
            }
        }
    }

    async fn send_pending(&self) {
        loop {
            let Some(packet) = self.outbound.lock().pop_front() else {
                return;
            };
            match self.transport.send(&packet).await {
                Ok(()) => {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    debug!(size = packet.len(), "Packet sent");
                }
                Err(e) => {
                    self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        transport = self.transport.name(),
                        error = %e,
                        code = e.error_code(),
                        "Failed to send packet"
                    );
                }
            }
        }
    }
}

/// IQRF bridge service
///
/// Cheap to clone; clones share the same queues and worker.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    /// Create a bridge over a transport
    pub fn new(
        transport: Arc<dyn TransportLayer>,
        converter: Arc<dyn MessageConverter>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                converter,
                config,
                inbound: Mutex::new(VecDeque::new()),
                outbound: Mutex::new(VecDeque::new()),
                outbound_ready: Notify::new(),
                probe_lock: tokio::sync::Mutex::new(()),
                cancel: CancellationToken::new(),
                sender: Mutex::new(None),
                destroyed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    /// Register the inbound listener, start the transport and the sender
    pub async fn start(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(IqrfError::Internal("bridge destroyed".to_string()));
        }
        if self.inner.sender.lock().is_some() {
            debug!("Bridge already started");
            return Ok(());
        }

        // The transport holds the listener, so it must not keep the bridge alive
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.transport.register_listener(Arc::new(move |packet| {
            if let Some(inner) = weak.upgrade() {
                inner.enqueue_inbound(packet);
            }
        }));

        if let Err(e) = self.inner.transport.start().await {
            self.inner.transport.unregister_listener();
            return Err(e);
        }

        let inner = self.inner.clone();
        let cancel = self.inner.cancel.clone();
        let poll = self.inner.config.send_poll_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = inner.outbound_ready.notified() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = inner.send_pending() => {}
                }
            }
            debug!("Sender stopped");
        });
        *self.inner.sender.lock() = Some(handle);

        info!(
            transport = self.inner.transport.name(),
            converter = self.inner.converter.name(),
            "Bridge started"
        );
        Ok(())
    }

    /// Classify, convert and queue a packet from the transport
    pub fn enqueue_inbound(&self, packet: Packet) {
        self.inner.enqueue_inbound(packet);
    }

    /// Whether a converted message is waiting
    pub fn has_inbound(&self) -> bool {
        !self.inner.inbound.lock().is_empty()
    }

    /// Remove the oldest converted message
    pub fn drain_one_inbound(&self) -> Option<ConvertedMessage> {
        self.inner.inbound.lock().pop_front()
    }

    /// Convert and queue a request for the transport
    ///
    /// Conversion failures are logged and the request is dropped.
    pub fn enqueue_outbound(&self, request: &DecodedRequest) {
        if self.is_destroyed() {
            debug!("Bridge destroyed, dropping request");
            return;
        }
        match self.inner.converter.to_packet(request) {
            Ok(packet) => {
                trace!(?packet, "Outbound packet");
                if self.inner.push_capped(&self.inner.outbound, packet, "outbound") {
                    self.inner.outbound_ready.notify_one();
                }
            }
            Err(e) => {
                self.inner
                    .counters
                    .conversion_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, code = e.error_code(), "Dropping unconvertible request");
            }
        }
    }

    /// Whether a packet is waiting for the transport
    pub fn has_outbound(&self) -> bool {
        !self.inner.outbound.lock().is_empty()
    }

    /// Remove the oldest packet waiting for the transport
    pub fn drain_one_outbound(&self) -> Option<Packet> {
        self.inner.outbound.lock().pop_front()
    }

    /// Move every available request from the messenger to the outbound queue
    ///
    /// Returns the number of requests taken, including unparseable ones.
    pub fn pump_requests(&self, messenger: &dyn Messenger) -> usize {
        let mut taken = 0;
        while messenger.is_request_available() {
            match messenger.take_request() {
                Ok(Some(request)) => {
                    taken += 1;
                    self.enqueue_outbound(&request);
                }
                Ok(None) => break,
                Err(e) => {
                    taken += 1;
                    self.inner
                        .counters
                        .conversion_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Dropping unparseable request");
                }
            }
        }
        taken
    }

    /// Publish every queued inbound message
    ///
    /// Returns the number of messages published successfully.
    pub async fn publish_pending(&self, messenger: &dyn Messenger) -> usize {
        let mut published = 0;
        while let Some(message) = self.drain_one_inbound() {
            match messenger.publish(message).await {
                Ok(()) => {
                    published += 1;
                    self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(error = %e, "Failed to publish message"),
            }
        }
        published
    }

    /// Read the coordinator's module id
    ///
    /// Concurrent calls are serialized. Yields `"unknown"` when the
    /// coordinator stays silent for the configured timeout.
    pub async fn read_module_id(&self) -> String {
        let _guard = self.inner.probe_lock.lock().await;
        probe_module_id(
            self.inner.transport.as_ref(),
            self.inner.config.module_id_timeout,
        )
        .await
    }

    /// Current statistics
    pub fn stats(&self) -> BridgeStats {
        self.inner.counters.snapshot()
    }

    /// Name of the underlying transport
    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    /// Whether `destroy` was called
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Stop the sender, destroy the transport and drop queued entries
    ///
    /// Safe to call more than once.
    pub async fn destroy(&self) -> Result<()> {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.cancel.cancel();
        let handle = self.inner.sender.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Sender task failed");
            }
        }

        let result = self.inner.transport.destroy().await;
        let dropped_in = std::mem::take(&mut *self.inner.inbound.lock()).len();
        let dropped_out = std::mem::take(&mut *self.inner.outbound.lock()).len();
        info!(
            transport = self.inner.transport.name(),
            dropped_in, dropped_out, "Bridge destroyed"
        );
        result
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("transport", &self.inner.transport.name())
            .field("converter", &self.inner.converter.name())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{DpaJsonConverter, SimpleJsonConverter};
    use crate::packet::PacketRole;
    use crate::test_utils::{os_read_responder, MockMessenger, MockTransport};
    use std::time::Duration;

    fn bridge_with(transport: Arc<MockTransport>, config: BridgeConfig) -> Bridge {
        Bridge::new(transport, Arc::new(DpaJsonConverter::new()), config)
    }

    fn dpa_request(nadr: u32, seq: u16) -> DecodedRequest {
        DecodedRequest::Dpa {
            nadr,
            per: 0x06,
            cmd: 0x03,
            hwpid: 0xFFFF,
            data: vec![seq],
        }
    }

    #[test]
    fn test_inbound_classified_in_order() {
        let bridge = bridge_with(Arc::new(MockTransport::new()), BridgeConfig::default());
        assert!(!bridge.has_inbound());

        bridge.enqueue_inbound(Packet::from([0x00, 0x00, 0x0A, 0x80, 0xFF, 0xFF, 0x00, 0x1E]));
        bridge.enqueue_inbound(Packet::from([0x01, 0x02]));
        assert!(bridge.has_inbound());

        assert_eq!(bridge.drain_one_inbound().unwrap().role, PacketRole::Response);
        assert!(matches!(
            bridge.drain_one_inbound().unwrap().role,
            PacketRole::Error(_)
        ));
        assert!(bridge.drain_one_inbound().is_none());
        assert_eq!(bridge.stats().received_messages, 2);
    }

    #[test]
    fn test_outbound_conversion_failure_is_dropped() {
        let bridge = bridge_with(Arc::new(MockTransport::new()), BridgeConfig::default());
        bridge.enqueue_outbound(&DecodedRequest::Raw {
            payload: "zz.00".to_string(),
            size: None,
        });
        bridge.enqueue_outbound(&DecodedRequest::Dpa {
            nadr: 0x1_0000,
            per: 0,
            cmd: 0,
            hwpid: 0xFFFF,
            data: vec![],
        });
        assert!(!bridge.has_outbound());
        assert_eq!(bridge.stats().conversion_errors, 2);

        bridge.enqueue_outbound(&dpa_request(0, 1));
        assert_eq!(
            bridge.drain_one_outbound().unwrap(),
            Packet::from([0x00, 0x00, 0x06, 0x03, 0xFF, 0xFF, 0x01])
        );
    }

    #[test]
    fn test_per_producer_order() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u16 = 200;

        let bridge = bridge_with(Arc::new(MockTransport::new()), BridgeConfig::default());
        let threads: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let bridge = bridge.clone();
                std::thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        bridge.enqueue_outbound(&dpa_request(producer, seq));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let mut last = vec![None::<u8>; PRODUCERS as usize];
        let mut total = 0;
        while let Some(packet) = bridge.drain_one_outbound() {
            let b = packet.as_bytes();
            let producer = b[0] as usize;
            let seq = b[6];
            if let Some(prev) = last[producer] {
                assert!(seq > prev, "producer {} out of order", producer);
            }
            last[producer] = Some(seq);
            total += 1;
        }
        assert_eq!(total, PRODUCERS as usize * PER_PRODUCER as usize);
    }

    #[test]
    fn test_queue_cap_drops_new_entries() {
        let config = BridgeConfig {
            max_queue_len: Some(2),
            ..BridgeConfig::default()
        };
        let bridge = bridge_with(Arc::new(MockTransport::new()), config);
        for seq in 0..3 {
            bridge.enqueue_outbound(&dpa_request(0, seq));
        }
        assert_eq!(bridge.drain_one_outbound().unwrap().as_bytes()[6], 0);
        assert_eq!(bridge.drain_one_outbound().unwrap().as_bytes()[6], 1);
        assert!(bridge.drain_one_outbound().is_none());
        assert_eq!(bridge.stats().dropped_messages, 1);
    }

    #[tokio::test]
    async fn test_sender_forwards_to_transport() {
        let transport = Arc::new(MockTransport::new());
        let bridge = bridge_with(transport.clone(), BridgeConfig::default());
        bridge.start().await.unwrap();
        assert!(transport.is_started());

        bridge.enqueue_outbound(&dpa_request(3, 7));
        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.sent().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            transport.sent(),
            vec![Packet::from([0x03, 0x00, 0x06, 0x03, 0xFF, 0xFF, 0x07])]
        );
        assert_eq!(bridge.stats().sent_messages, 1);

        bridge.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_errors_are_counted() {
        let transport = Arc::new(MockTransport::new());
        transport.set_fail_sends(true);
        let bridge = bridge_with(transport.clone(), BridgeConfig::default());
        bridge.start().await.unwrap();

        bridge.enqueue_outbound(&dpa_request(0, 0));
        tokio::time::timeout(Duration::from_secs(2), async {
            while bridge.stats().send_errors == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!bridge.has_outbound());
        bridge.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_packets_reach_inbound() {
        let transport = Arc::new(MockTransport::new());
        let bridge = bridge_with(transport.clone(), BridgeConfig::default());
        bridge.start().await.unwrap();

        assert!(transport.inject(Packet::from([
            0x00, 0x00, 0x0A, 0x80, 0xFF, 0xFF, 0x00, 0x1E, 0x05
        ])));
        let message = bridge.drain_one_inbound().unwrap();
        assert_eq!(message.role, PacketRole::Response);
        bridge.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_module_id_restores_listener() {
        let transport = Arc::new(MockTransport::new().with_responder(os_read_responder(0x8134_5678)));
        let bridge = bridge_with(transport.clone(), BridgeConfig::default());
        bridge.start().await.unwrap();

        assert_eq!(bridge.read_module_id().await, "81345678");
        assert_eq!(
            transport.sent(),
            vec![Packet::from([0x00, 0x00, 0x02, 0x00, 0xFF, 0xFF])]
        );
        // The probe reply went to the probe, not the bridge
        assert!(!bridge.has_inbound());

        transport.inject(Packet::from([0x00, 0x00, 0x06, 0x83, 0xFF, 0xFF, 0x00, 0x0D]));
        assert!(bridge.has_inbound());
        bridge.destroy().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_module_id_timeout_yields_unknown() {
        let transport = Arc::new(MockTransport::new());
        let config = BridgeConfig {
            module_id_timeout: Duration::from_secs(10),
            ..BridgeConfig::default()
        };
        let bridge = bridge_with(transport.clone(), config);
        bridge.start().await.unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(bridge.read_module_id().await, "unknown");
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(transport.has_listener());
        bridge.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_messenger_round_trip() {
        let transport = Arc::new(MockTransport::new());
        let bridge = Bridge::new(
            transport.clone(),
            Arc::new(SimpleJsonConverter::new("001122334455")),
            BridgeConfig::default(),
        );
        let messenger = MockMessenger::new();
        messenger.push_request(br#"{"payload": "00.00.06.03.FF.FF"}"#);
        messenger.push_request(b"not json");
        messenger.push_request(br#"{"nadr": 1, "per": 6, "cmd": 3}"#);

        assert_eq!(bridge.pump_requests(&messenger), 3);
        assert_eq!(bridge.stats().conversion_errors, 1);
        assert_eq!(
            bridge.drain_one_outbound().unwrap(),
            Packet::from([0x00, 0x00, 0x06, 0x03, 0xFF, 0xFF])
        );
        assert_eq!(
            bridge.drain_one_outbound().unwrap(),
            Packet::from([0x01, 0x00, 0x06, 0x03, 0xFF, 0xFF])
        );

        bridge.enqueue_inbound(Packet::from([0x00, 0x00, 0x06, 0x83, 0xFF, 0xFF, 0x00, 0x0D]));
        assert_eq!(bridge.publish_pending(&messenger).await, 1);
        let published = messenger.published();
        assert_eq!(published.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(value["payload"], "00.00.06.83.FF.FF.00.0D");
        assert_eq!(value["mac"], "001122334455");
        assert_eq!(bridge.stats().published_messages, 1);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let bridge = bridge_with(transport.clone(), BridgeConfig::default());
        bridge.start().await.unwrap();
        bridge.enqueue_inbound(Packet::from([0x00, 0x00, 0x06, 0x83, 0xFF, 0xFF, 0x00, 0x0D]));

        bridge.destroy().await.unwrap();
        bridge.destroy().await.unwrap();
        assert!(bridge.is_destroyed());
        assert!(transport.is_destroyed());
        assert!(!bridge.has_inbound());
        assert!(!transport.inject(Packet::from([0x01])));

        bridge.enqueue_outbound(&dpa_request(0, 0));
        assert!(!bridge.has_outbound());
        assert!(bridge.start().await.is_err());
    }
}
