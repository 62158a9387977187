//! IQRF MQTT bridge - connects an IQRF coordinator to an MQTT broker
//!
//! This binary runs the gateway bridge with:
//! - one IQRF transport (CDC, Serial, SPI or UDP) selected by configuration
//! - an MQTT client publishing mesh traffic and accepting requests
//! - statistics reports on demand

mod config;
mod mac;
mod mqtt;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use iqrf_gateway::{create_converter, create_transport, Bridge, BridgeStats};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::BridgeAppConfig;
use mqtt::MqttMessenger;

#[derive(Parser)]
#[command(name = "iqrf-mqtt-bridge")]
#[command(about = "Bridges an IQRF coordinator to an MQTT broker")]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the transport's device path
    #[arg(long, short)]
    port: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

/// Statistics report published on the stats topic
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsReport<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    stats: BridgeStats,
    mac: &'a str,
    module_id: &'a str,
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let level = if verbose { Level::DEBUG } else { Level::INFO };
        let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    let mut config = match &args.config {
        Some(path) => BridgeAppConfig::load(path)?,
        None => {
            warn!("No configuration file given, using defaults");
            BridgeAppConfig::default()
        }
    };
    if let Some(port) = &args.port {
        if !config.gateway.transport.set_port(port) {
            warn!(
                transport = config.gateway.transport.kind(),
                "Transport has no device path, ignoring --port"
            );
        }
    }
    config.gateway.validate()?;

    info!("Starting IQRF MQTT bridge v{}", iqrf_gateway::VERSION);
    let mac = mac::discover();
    info!(mac = %mac, "Gateway MAC address");

    let transport = create_transport(&config.gateway.transport)?;
    let converter = create_converter(config.gateway.bridge.converter, &mac);
    let bridge = Bridge::new(transport, converter, config.gateway.bridge.clone());
    bridge.start().await?;

    let module_id = bridge.read_module_id().await;
    info!(mid = %module_id, "Coordinator module id");

    let cancel = CancellationToken::new();
    let messenger = Arc::new(MqttMessenger::connect(&config.mqtt, &mac, cancel.clone()));

    let publisher = spawn_publisher(
        bridge.clone(),
        messenger.clone(),
        config.gateway.bridge.publish_interval,
        cancel.clone(),
    );
    let pump = spawn_request_pump(
        bridge.clone(),
        messenger.clone(),
        mac.clone(),
        module_id,
        cancel.clone(),
    );

    info!("═══════════════════════════════════════════════════════════");
    info!("  Transport: {}", bridge.transport_name());
    info!("  Publishing on: {}", messenger.topics().rx);
    info!("  Requests on:   {}", messenger.topics().tx);
    info!("═══════════════════════════════════════════════════════════");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    cancel.cancel();
    for task in [publisher, pump] {
        if let Err(e) = task.await {
            error!(error = %e, "Task failed");
        }
    }
    messenger.disconnect().await;
    bridge.destroy().await?;

    let stats = bridge.stats();
    info!(
        received = stats.received_messages,
        sent = stats.sent_messages,
        "Bridge stopped"
    );
    Ok(())
}

/// Periodically publish converted mesh traffic
fn spawn_publisher(
    bridge: Bridge,
    messenger: Arc<MqttMessenger>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let published = bridge.publish_pending(messenger.as_ref()).await;
                    if published > 0 {
                        debug!(published, "Published messages");
                    }
                }
            }
        }
        debug!("Publisher stopped");
    })
}

/// Move requests into the bridge and answer statistics requests
fn spawn_request_pump(
    bridge: Bridge,
    messenger: Arc<MqttMessenger>,
    mac: String,
    module_id: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = messenger.request_arrived() => {
                    bridge.pump_requests(messenger.as_ref());
                }
                _ = messenger.stats_arrived() => {
                    if !messenger.take_stats_request() {
                        continue;
                    }
                    let report = StatsReport {
                        kind: mqtt::STATS_REPORT_TYPE,
                        stats: bridge.stats(),
                        mac: &mac,
                        module_id: &module_id,
                    };
                    match serde_json::to_vec(&report) {
                        Ok(json) => {
                            if let Err(e) = messenger.publish_stats(json).await {
                                warn!(error = %e, "Statistics sending was unsuccessful");
                            }
                        }
                        Err(e) => error!(error = %e, "Failed to serialize statistics"),
                    }
                }
            }
        }
        debug!("Request pump stopped");
    })
}
