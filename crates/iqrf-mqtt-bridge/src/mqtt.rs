//! MQTT side of the bridge
//!
//! Requests arrive on `{prefix}gateway/{mac}/tx`, converted packets leave on
//! `{prefix}gateway/{mac}/rx`. Any message on `{prefix}gateway/{mac}/stats`
//! asks for a statistics report, published back on the same topic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use iqrf_gateway::{ConvertedMessage, DecodedRequest, IqrfError, Messenger, Result};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::MqttConfig;

/// Delay between reconnection attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// `type` field value marking a statistics report
pub const STATS_REPORT_TYPE: &str = "gatewayStats";

/// Whether a stats topic payload is a report rather than a request
fn is_stats_report(payload: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == STATS_REPORT_TYPE))
        .unwrap_or(false)
}

/// Topics of one gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Converted packets from the mesh
    pub rx: String,
    /// Requests for the mesh
    pub tx: String,
    /// Statistics requests and reports
    pub stats: String,
}

impl Topics {
    /// Build the topic set for a gateway MAC
    pub fn new(prefix: &str, mac: &str) -> Self {
        let base = format!("{}gateway/{}", prefix, mac);
        Self {
            rx: format!("{}/rx", base),
            tx: format!("{}/tx", base),
            stats: format!("{}/stats", base),
        }
    }
}

fn qos_from(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// State shared between the client handle and the event loop task
#[derive(Debug, Default)]
struct Shared {
    requests: Mutex<VecDeque<Vec<u8>>>,
    request_arrived: Notify,
    stats_requested: AtomicBool,
    stats_arrived: Notify,
}

impl Shared {
    fn on_publish(&self, topics: &Topics, topic: &str, payload: &[u8]) {
        if topic == topics.stats {
            // Our own report comes back on the same topic
            if is_stats_report(payload) {
                trace!("Ignoring own statistics report");
                return;
            }
            self.stats_requested.store(true, Ordering::Release);
            self.stats_arrived.notify_one();
        } else if topic == topics.tx {
            debug!(size = payload.len(), "Request received");
            self.requests.lock().push_back(payload.to_vec());
            self.request_arrived.notify_one();
        } else {
            trace!(topic, "Ignoring message on foreign topic");
        }
    }
}

/// MQTT client implementing the bridge's messaging side
pub struct MqttMessenger {
    client: AsyncClient,
    topics: Topics,
    qos: QoS,
    shared: Arc<Shared>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttMessenger {
    /// Create the client and spawn its event loop
    ///
    /// The connection is established and kept alive by the event loop task,
    /// which subscribes again after every reconnect.
    pub fn connect(config: &MqttConfig, mac: &str, cancel: CancellationToken) -> Self {
        let client_id = config.client_id();
        let mut options = MqttOptions::new(client_id.clone(), config.broker.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(config.clean_session);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, 64);
        let topics = Topics::new(&config.topic_prefix, mac);
        let qos = qos_from(config.qos);
        let shared = Arc::new(Shared::default());

        info!(
            broker = %config.broker,
            port = config.port,
            client_id = %client_id,
            rx = %topics.rx,
            "Connecting to MQTT broker"
        );
        let handle = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            topics.clone(),
            qos,
            shared.clone(),
            cancel,
        ));

        Self {
            client,
            topics,
            qos,
            shared,
            event_loop: Mutex::new(Some(handle)),
        }
    }

    /// Topics in use
    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Wait until a request was received
    pub async fn request_arrived(&self) {
        self.shared.request_arrived.notified().await
    }

    /// Wait until statistics were requested
    pub async fn stats_arrived(&self) {
        self.shared.stats_arrived.notified().await
    }

    /// Consume a pending statistics request
    pub fn take_stats_request(&self) -> bool {
        self.shared.stats_requested.swap(false, Ordering::AcqRel)
    }

    /// Publish a statistics report
    pub async fn publish_stats(&self, report: Vec<u8>) -> Result<()> {
        self.client
            .publish(self.topics.stats.clone(), self.qos, false, report)
            .await
            .map_err(|e| IqrfError::Internal(format!("MQTT publish failed: {}", e)))
    }

    /// Disconnect and wait for the event loop to finish
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "MQTT disconnect failed");
        }
        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        info!("Disconnected from MQTT broker");
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    topics: Topics,
    qos: QoS,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_loop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                // The request channel is drained by this very loop, never block on it
                for topic in [&topics.tx, &topics.stats] {
                    if let Err(e) = client.try_subscribe(topic.clone(), qos) {
                        warn!(topic = %topic, error = %e, "Subscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                shared.on_publish(&topics, &publish.topic, &publish.payload);
            }
            Ok(event) => trace!(?event, "MQTT event"),
            Err(e) => {
                warn!(error = %e, delay = ?RECONNECT_DELAY, "MQTT connection error, reconnecting");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    debug!("MQTT event loop stopped");
}

#[async_trait]
impl Messenger for MqttMessenger {
    fn is_request_available(&self) -> bool {
        !self.shared.requests.lock().is_empty()
    }

    fn take_request(&self) -> Result<Option<DecodedRequest>> {
        let raw = self.shared.requests.lock().pop_front();
        raw.map(|raw| DecodedRequest::from_json(&raw)).transpose()
    }

    async fn publish(&self, message: ConvertedMessage) -> Result<()> {
        trace!(role = message.role.as_str(), "Publishing message");
        self.client
            .publish(self.topics.rx.clone(), self.qos, false, message.payload.to_vec())
            .await
            .map_err(|e| IqrfError::Internal(format!("MQTT publish failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics() {
        let topics = Topics::new("site1/", "B827EB1234AB");
        assert_eq!(topics.rx, "site1/gateway/B827EB1234AB/rx");
        assert_eq!(topics.tx, "site1/gateway/B827EB1234AB/tx");
        assert_eq!(topics.stats, "site1/gateway/B827EB1234AB/stats");
        assert_eq!(Topics::new("", "00").rx, "gateway/00/rx");
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
        assert_eq!(qos_from(7), QoS::AtMostOnce);
    }

    #[test]
    fn test_incoming_routing() {
        let topics = Topics::new("", "AA");
        let shared = Shared::default();

        shared.on_publish(&topics, &topics.tx, br#"{"payload": "00.00.06.03.FF.FF"}"#);
        shared.on_publish(&topics, "gateway/BB/tx", b"{}");
        assert_eq!(shared.requests.lock().len(), 1);

        shared.on_publish(
            &topics,
            &topics.stats,
            br#"{"type":"gatewayStats","receivedMessages":1,"mac":"AA"}"#,
        );
        assert!(!shared.stats_requested.load(Ordering::Acquire));
        shared.on_publish(&topics, &topics.stats, b"");
        assert!(shared.stats_requested.load(Ordering::Acquire));
    }

    #[test]
    fn test_stats_request_mentioning_mac_is_answered() {
        let topics = Topics::new("", "AA");
        let shared = Shared::default();

        shared.on_publish(&topics, &topics.stats, br#"{"mac":"AA"}"#);
        assert!(shared.stats_requested.load(Ordering::Acquire));

        assert!(!is_stats_report(br#"{"type":"request","mac":"AA"}"#));
        assert!(!is_stats_report(b"not json"));
        assert!(is_stats_report(br#"{"type":"gatewayStats"}"#));
    }
}
