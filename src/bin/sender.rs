//! Transmit node
//!
//! Captures from the selected input, encodes, and broadcasts frames to the
//! mesh. Usage: `sender [config.toml]`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshnet_audio::{
    audio::{list_devices, CpalInput, InputMode, SourceSet, ToneSource},
    config::AppConfig,
    constants::*,
    network::{BeaconOptions, HeartbeatSender, UdpTransport},
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

    info!("Starting meshnet transmit node");
    let config = load_config()?;
    let format = config.audio.format();

    for device in list_devices().iter().filter(|d| d.is_input) {
        info!(
            name = %device.name,
            default = device.is_default,
            rates = ?device.sample_rates,
            channels = ?device.channels,
            "Input device"
        );
    }

    let mut sources = SourceSet::new().with(
        InputMode::Tone,
        Box::new(ToneSource::new(&format, config.node.tone_hz)),
    );
    match CpalInput::open(config.node.input_device.as_deref(), format) {
        Ok(input) => sources = sources.with(InputMode::Line, Box::new(input)),
        Err(e) => warn!(error = %e, "Line input unavailable"),
    }
    if let Some(usb) = config.node.usb_device.as_deref() {
        match CpalInput::open(Some(usb), format) {
            Ok(input) => sources = sources.with(InputMode::Usb, Box::new(input)),
            Err(e) => warn!(device = usb, error = %e, "USB input unavailable"),
        }
    }
    if !sources.has(config.node.input_mode) {
        warn!(mode = ?config.node.input_mode, "Selected input has no source attached; capture idles until switched");
    }

    let transport = UdpTransport::from_config(&config.network)?;
    let beacon_transport = transport.try_clone()?;

    let mut pipeline = Pipeline::create(
        config.pipeline_config(Role::Transmit),
        PipelineIo::Transmit {
            sources,
            transport: Box::new(transport),
        },
    )?;
    pipeline.start()?;

    let mut heartbeat = HeartbeatSender::spawn(
        beacon_transport,
        BeaconOptions {
            role: NodeRole::Transmitter,
            stream_id: config.node.stream_id,
            hop_count: 0,
            announce: Some(format),
            interval: config.network.heartbeat_interval(),
        },
    )?;

    info!(
        stream_id = config.node.stream_id,
        codec = ?config.codec.kind,
        destination = %config.network.destination,
        port = config.network.port,
        "Streaming - press Ctrl+C to stop"
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(STATS_INTERVAL_SECS));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let stats = pipeline.get_stats();
                info!(stats = %serde_json::to_string(&stats)?, "Pipeline stats");
            }
        }
    }

    info!("Shutting down");
    heartbeat.stop();
    pipeline.destroy()?;
    Ok(())
}
