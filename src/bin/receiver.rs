//! Receive node
//!
//! Listens on the mesh port, relays when configured, and plays the local
//! stream. Usage: `receiver [config.toml]`.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshnet_audio::{
    audio::{list_devices, AudioSink, CpalOutput, NullSink},
    config::AppConfig,
    constants::*,
    network::{AudioReceiver, BeaconOptions, HeartbeatSender, ReceiverOptions, UdpTransport},
    pipeline::{Pipeline, PipelineIo, Role},
    protocol::NodeRole,
};

fn load_config() -> Result<AppConfig> {
    match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => AppConfig::load(&path).with_context(|| format!("loading {}", path.display())),
        None => AppConfig::load_or_default().context("loading default config"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting meshnet receive node");
    let config = load_config()?;
    let format = config.audio.format();

    for device in list_devices().iter().filter(|d| d.is_output) {
        info!(name = %device.name, default = device.is_default, "Output device");
    }

    let sink: Box<dyn AudioSink> =
        match CpalOutput::open(config.node.output_device.as_deref(), format, config.jitter.depth_frames) {
            Ok(output) => Box::new(output),
            Err(e) => {
                warn!(error = %e, "Output device unavailable, discarding audio");
                Box::new(NullSink::new(format.frame_duration()))
            }
        };

    let transport = UdpTransport::from_config(&config.network)?;
    let beacon_transport = transport.try_clone()?;

    let mut pipeline = Pipeline::create(config.pipeline_config(Role::Receive), PipelineIo::Receive { sink })?;
    pipeline.start()?;

    let mut receiver = AudioReceiver::spawn(
        transport,
        pipeline.feed_handle()?,
        ReceiverOptions::from_config(&config),
    )?;
    let mut heartbeat = HeartbeatSender::spawn(
        beacon_transport,
        BeaconOptions {
            role: NodeRole::Receiver,
            stream_id: config.node.stream_id,
            hop_count: 1,
            announce: None,
            interval: config.network.heartbeat_interval(),
        },
    )?;

    info!(
        stream_id = config.node.stream_id,
        port = config.network.port,
        relay = config.network.relay,
        "Listening - press Ctrl+C to stop"
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(STATS_INTERVAL_SECS));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let stats = pipeline.get_stats();
                let loss_percent = stats.loss_percent();
                let line = json!({
                    "pipeline": stats,
                    "network": receiver.stats(),
                    "jitter": format!("{:?}", pipeline.jitter_state()),
                    "loss_percent": loss_percent,
                });
                info!(stats = %line, "Receiver stats");
            }
        }
    }

    info!("Shutting down");
    heartbeat.stop();
    receiver.stop();
    pipeline.destroy()?;
    Ok(())
}
