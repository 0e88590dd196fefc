//! Node configuration
//!
//! Settings are grouped in TOML sections (`[node]`, `[audio]`, `[codec]`,
//! `[buffers]`, `[jitter]`, `[network]`, `[faults]`). Every field has a
//! default, so a partial file or no file at all yields a working node.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::frame::AudioFormat;
use crate::audio::source::InputMode;
use crate::codec::{CodecKind, OPUS_MAX_FRAME_BYTES};
use crate::constants;
use crate::error::{Error, Result};
use crate::pipeline::{PipelineConfig, Role};
use crate::protocol::DEFAULT_TTL;

const CONFIG_FILE: &str = "meshnet-audio.toml";

/// Node identity and device selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub stream_id: u8,
    pub input_mode: InputMode,
    /// Capture device name; `None` selects the host default
    pub input_device: Option<String>,
    /// USB capture device name; no USB source is attached when unset
    pub usb_device: Option<String>,
    /// Playback device name; `None` selects the host default
    pub output_device: Option<String>,
    pub tone_hz: f64,
    /// Linear playback gain, saturating
    pub output_gain: f32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "meshnet-node".into(),
            stream_id: 1,
            input_mode: InputMode::Line,
            input_device: None,
            usb_device: None,
            output_device: None,
            tone_hz: 440.0,
            output_gain: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub frame_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: constants::DEFAULT_SAMPLE_RATE,
            channels: constants::DEFAULT_CHANNELS,
            bits_per_sample: 16,
            frame_ms: constants::DEFAULT_FRAME_MS,
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bits_per_sample: self.bits_per_sample,
            frame_ms: self.frame_ms,
        }
    }
}

/// Encoder settings. Opus complexity is left at the library default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub kind: CodecKind,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    pub vbr: bool,
    pub vbr_constraint: bool,
    pub inband_fec: bool,
    /// Expected loss percentage, used only with in-band FEC
    pub packet_loss_perc: u8,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            kind: CodecKind::Opus,
            bitrate: constants::DEFAULT_BITRATE,
            vbr: true,
            vbr_constraint: true,
            inband_fec: false,
            packet_loss_perc: 10,
        }
    }
}

/// Buffer sizes, in frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub pcm_frames: usize,
    pub item_frames: usize,
    /// Largest compressed frame accepted by `feed`
    pub max_item_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            pcm_frames: 4,
            item_frames: 8,
            max_item_bytes: OPUS_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    pub prefill_frames: usize,
    pub depth_frames: usize,
    /// How far behind the newest sequence a packet may arrive before it is
    /// dropped as stale; defaults to the jitter depth
    pub stale_window: Option<u16>,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            prefill_frames: 2,
            depth_frames: 3,
            stale_window: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Where transmitted frames go; broadcast by default
    pub destination: String,
    pub ttl: u8,
    pub heartbeat_interval_ms: u64,
    /// Forward frames with hops left to peers further from the transmitter
    pub relay: bool,
    pub dedupe_entries: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: constants::DEFAULT_UDP_PORT,
            destination: "255.255.255.255".into(),
            ttl: DEFAULT_TTL,
            heartbeat_interval_ms: 2000,
            relay: false,
            dedupe_entries: crate::protocol::control::DEDUPE_CACHE_SIZE,
        }
    }
}

impl NetworkConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Fault-handling thresholds for the pipeline tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Bounded wait used by tasks to observe the running flag
    pub task_wait_ms: u64,
    /// Per-call device I/O timeout
    pub device_timeout_ms: u64,
    /// Consecutive device timeouts before the device channel is reset
    pub device_timeout_threshold: u32,
    /// Consecutive codec failures before the codec path is paused
    pub codec_failure_threshold: u32,
    pub codec_cooldown_ms: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            task_wait_ms: 100,
            device_timeout_ms: 100,
            device_timeout_threshold: 10,
            codec_failure_threshold: 5,
            codec_cooldown_ms: 500,
        }
    }
}

impl FaultConfig {
    pub fn task_wait(&self) -> Duration {
        Duration::from_millis(self.task_wait_ms)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    pub fn codec_cooldown(&self) -> Duration {
        Duration::from_millis(self.codec_cooldown_ms)
    }
}

/// Top-level configuration, serialized as `meshnet-audio.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub audio: AudioConfig,
    pub codec: CodecConfig,
    pub buffers: BufferConfig,
    pub jitter: JitterConfig,
    pub network: NetworkConfig,
    pub faults: FaultConfig,
}

impl AppConfig {
    /// Platform config file location, if the platform has one
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("net", "meshnet", "meshnet-audio").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the platform config dir, or defaults when no file exists
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.sample_rate == 0 || audio.channels == 0 || audio.frame_ms == 0 {
            return Err(Error::Config("audio sample rate, channels and frame length must be non-zero".into()));
        }
        if audio.bits_per_sample != 16 {
            return Err(Error::Config(format!("only 16-bit PCM is supported, got {}", audio.bits_per_sample)));
        }
        if self.audio.format().frame_samples() == 0 {
            return Err(Error::Config("frame is shorter than one sample".into()));
        }
        if self.buffers.pcm_frames == 0 || self.buffers.item_frames == 0 || self.buffers.max_item_bytes == 0 {
            return Err(Error::Config("buffer sizes must be non-zero".into()));
        }
        if self.jitter.prefill_frames == 0 || self.jitter.prefill_frames >= self.jitter.depth_frames {
            return Err(Error::Config(format!(
                "jitter prefill ({}) must be non-zero and below depth ({})",
                self.jitter.prefill_frames, self.jitter.depth_frames
            )));
        }
        if !(self.node.output_gain.is_finite() && self.node.output_gain >= 0.0) {
            return Err(Error::Config(format!("invalid output gain {}", self.node.output_gain)));
        }
        if self.network.dedupe_entries == 0 {
            return Err(Error::Config("dedupe cache needs at least one entry".into()));
        }
        Ok(())
    }

    /// Claim key for the device a pipeline of `role` drives
    pub fn device_name(&self, role: Role) -> String {
        match role {
            Role::Transmit => self.node.input_device.clone().unwrap_or_else(|| "default-input".into()),
            Role::Receive => self.node.output_device.clone().unwrap_or_else(|| "default-output".into()),
        }
    }

    pub fn pipeline_config(&self, role: Role) -> PipelineConfig {
        PipelineConfig {
            role,
            format: self.audio.format(),
            codec: self.codec.clone(),
            stream_id: self.node.stream_id,
            ttl: self.network.ttl,
            device_name: self.device_name(role),
            pcm_buffer_frames: self.buffers.pcm_frames,
            item_buffer_frames: self.buffers.item_frames,
            max_item_bytes: self.buffers.max_item_bytes,
            jitter_prefill_frames: self.jitter.prefill_frames,
            jitter_depth_frames: self.jitter.depth_frames,
            stale_window: self
                .jitter
                .stale_window
                .unwrap_or(self.jitter.depth_frames.min(u16::MAX as usize) as u16),
            input_mode: self.node.input_mode,
            output_gain: self.node.output_gain,
            faults: self.faults.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.audio.format().frame_bytes(), 1920);
        assert_eq!(config.network.port, 3333);
        assert_eq!(config.codec.bitrate, 64_000);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [node]
            stream_id = 7
            input_mode = "tone"
            usb_device = "USB Audio CODEC"

            [jitter]
            prefill_frames = 3
            depth_frames = 6
            "#,
        )
        .unwrap();

        assert_eq!(config.node.stream_id, 7);
        assert_eq!(config.node.input_mode, InputMode::Tone);
        assert_eq!(config.node.usb_device.as_deref(), Some("USB Audio CODEC"));
        assert!(config.node.input_device.is_none());
        assert_eq!(config.audio.sample_rate, 48_000);
        config.validate().unwrap();

        let pipeline = config.pipeline_config(Role::Receive);
        assert_eq!(pipeline.stale_window, 6);
        assert_eq!(pipeline.device_name, "default-output");
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = AppConfig::default();
        config.codec.kind = CodecKind::Pcm;
        config.node.output_device = Some("Speakers".into());

        let text = config.to_toml().unwrap();
        let back: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.codec, config.codec);
        assert_eq!(back.device_name(Role::Receive), "Speakers");
    }

    #[test]
    fn test_rejects_bad_jitter_settings() {
        let mut config = AppConfig::default();
        config.jitter.prefill_frames = 3;
        config.jitter.depth_frames = 3;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
