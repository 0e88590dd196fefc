//! Pipeline orchestrator
//!
//! A [`Pipeline`] owns the buffers, codec and device collaborators of one
//! role and runs that role's task graph:
//!
//! ```text
//! Transmit:  capture ──► PCM StreamBuffer ──► encode ──► Transport::send
//!
//! Receive:   feed() ──► ItemBuffer ──► decode ──► JitterBuffer ──► playback ──► AudioSink
//! ```
//!
//! Consumers are registered on every buffer before the task that writes to
//! it is spawned, so no wake is lost at startup. `stop()` joins the tasks and
//! takes their collaborators back, so a stopped pipeline can be started
//! again.

pub(crate) mod health;
mod stats;
mod tasks;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

use crate::audio::buffer::{ItemBuffer, RingBuffer, StreamBuffer};
use crate::audio::frame::AudioFormat;
use crate::audio::jitter::{JitterBuffer, JitterState};
use crate::audio::sink::AudioSink;
use crate::audio::source::{InputMode, SourceSet};
use crate::codec::{self, CodecKind, FrameDecoder, FrameEncoder};
use crate::config::{CodecConfig, FaultConfig};
use crate::error::{Error, PipelineError, ProtocolError, Result};
use crate::network::Transport;
use crate::protocol::{Packetizer, SeqEvent, SequenceTracker, TimestampBase};

use health::DeviceClaim;
use tasks::{CaptureTask, DecodeTask, EncodeParts, EncodeTask, PlaybackTask, TaskOutput};

pub use stats::PipelineStats;

/// Which half of the link a pipeline implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Transmit,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// Everything a pipeline needs besides its collaborators
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub role: Role,
    pub format: AudioFormat,
    pub codec: CodecConfig,
    pub stream_id: u8,
    pub ttl: u8,
    /// Audio device this pipeline claims while running
    pub device_name: String,
    pub pcm_buffer_frames: usize,
    pub item_buffer_frames: usize,
    /// Largest compressed frame `feed` accepts
    pub max_item_bytes: usize,
    pub jitter_prefill_frames: usize,
    pub jitter_depth_frames: usize,
    pub stale_window: u16,
    pub input_mode: InputMode,
    pub output_gain: f32,
    pub faults: FaultConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.format.bits_per_sample != 16 {
            return Err(Error::Config(format!(
                "only 16-bit PCM is supported, got {}",
                self.format.bits_per_sample
            )));
        }
        if self.format.frame_bytes() == 0 {
            return Err(Error::Config("frame holds no samples".into()));
        }
        if self.pcm_buffer_frames == 0 || self.item_buffer_frames == 0 {
            return Err(Error::Config("buffer sizes must be non-zero".into()));
        }
        if self.max_item_bytes == 0 || self.max_item_bytes > u16::MAX as usize {
            return Err(Error::Config(format!("invalid item size limit {}", self.max_item_bytes)));
        }
        Ok(())
    }

    /// Per-item size limit on the receive path
    fn item_limit(&self) -> usize {
        match self.codec.kind {
            CodecKind::Opus => self.max_item_bytes,
            CodecKind::Pcm => self.format.frame_bytes(),
        }
    }
}

/// Role-specific collaborators handed to [`Pipeline::create`]
pub enum PipelineIo {
    Transmit {
        sources: SourceSet,
        transport: Box<dyn Transport>,
    },
    Receive {
        sink: Box<dyn AudioSink>,
    },
}

/// The codec half used by a role
pub enum RoleCodec {
    Encoder(Box<dyn FrameEncoder>),
    Decoder(Box<dyn FrameDecoder>),
}

/// State shared by the tasks of one pipeline
pub(crate) struct Shared {
    pub(crate) running: AtomicBool,
    pub(crate) stats: stats::StatsCell,
    input_mode: AtomicU8,
}

impl Shared {
    fn new(mode: InputMode) -> Self {
        Self {
            running: AtomicBool::new(false),
            stats: stats::StatsCell::new(),
            input_mode: AtomicU8::new(mode.to_u8()),
        }
    }

    pub(crate) fn input_mode(&self) -> InputMode {
        InputMode::from_u8(self.input_mode.load(Ordering::Acquire))
    }
}

/// Receive-side entry point shared with the network receive thread
struct FeedPath {
    shared: Arc<Shared>,
    items: Arc<ItemBuffer>,
    tracker: Mutex<SequenceTracker>,
    stale_window: u16,
    item_limit: usize,
}

impl FeedPath {
    fn feed(&self, payload: &[u8], seq: u16, timestamp: u32) -> std::result::Result<(), PipelineError> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(PipelineError::NotRunning);
        }
        if payload.is_empty() {
            self.shared.stats.add_dropped(1);
            return Err(ProtocolError::Truncated(0).into());
        }
        if payload.len() > self.item_limit {
            self.shared.stats.add_dropped(1);
            return Err(ProtocolError::PayloadTooLarge(payload.len()).into());
        }

        let (event, last) = {
            let mut tracker = self.tracker.lock();
            let event = tracker.observe(seq);
            (event, tracker.last_seq().unwrap_or(seq))
        };

        self.shared.stats.update(|s| {
            match event {
                SeqEvent::Gap(lost) => {
                    s.packets_lost += lost as u64;
                    s.frames_dropped += lost as u64;
                }
                SeqEvent::Reordered => s.packets_reordered += 1,
                SeqEvent::Stale => s.packets_stale += 1,
                SeqEvent::First | SeqEvent::InOrder | SeqEvent::Resync => {}
            }
            if event.is_accepted() {
                s.last_remote_timestamp = timestamp;
            }
        });

        if !event.is_accepted() {
            return Err(ProtocolError::Stale { seq, last }.into());
        }

        self.items.write(payload).map_err(|e| {
            self.shared.stats.update(|s| {
                s.frames_dropped += 1;
                s.buffer_overruns += 1;
            });
            PipelineError::Capacity(e)
        })
    }
}

/// Cloneable handle for feeding a receive pipeline from another thread
#[derive(Clone)]
pub struct PipelineFeed {
    path: Arc<FeedPath>,
}

impl PipelineFeed {
    /// See [`Pipeline::feed`]
    pub fn feed(&self, payload: &[u8], seq: u16, timestamp: u32) -> std::result::Result<(), PipelineError> {
        self.path.feed(payload, seq, timestamp)
    }

    pub fn is_running(&self) -> bool {
        self.path.shared.running.load(Ordering::Acquire)
    }
}

struct TransmitPath {
    pcm: Arc<StreamBuffer>,
    sources: Option<SourceSet>,
    encode: Option<EncodeParts>,
}

struct ReceivePath {
    feed: Arc<FeedPath>,
    jitter: Arc<JitterBuffer>,
    decoder: Option<Box<dyn FrameDecoder>>,
    sink: Option<Box<dyn AudioSink>>,
}

enum RolePath {
    Transmit(TransmitPath),
    Receive(ReceivePath),
}

impl RolePath {
    fn restore(&mut self, output: TaskOutput) {
        match (self, output) {
            (RolePath::Transmit(path), TaskOutput::Capture(sources)) => path.sources = Some(sources),
            (RolePath::Transmit(path), TaskOutput::Encode(parts)) => path.encode = Some(parts),
            (RolePath::Receive(path), TaskOutput::Decode(decoder)) => path.decoder = Some(decoder),
            (RolePath::Receive(path), TaskOutput::Playback(sink)) => path.sink = Some(sink),
            _ => warn!("Task output does not match pipeline role"),
        }
    }

    fn wake_all(&self) {
        match self {
            RolePath::Transmit(path) => path.pcm.wake_consumer(),
            RolePath::Receive(path) => {
                path.feed.items.wake_consumer();
                path.jitter.wake_consumer();
            }
        }
    }
}

fn spawn_task<F>(name: &'static str, body: F) -> std::result::Result<JoinHandle<TaskOutput>, PipelineError>
where
    F: FnOnce() -> TaskOutput + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| PipelineError::Spawn {
            task: name,
            reason: e.to_string(),
        })
}

/// Event-driven audio pipeline for one role
pub struct Pipeline {
    config: PipelineConfig,
    state: Lifecycle,
    shared: Arc<Shared>,
    path: RolePath,
    claim: Option<DeviceClaim>,
    tasks: Vec<JoinHandle<TaskOutput>>,
}

impl Pipeline {
    /// Allocate buffers and the codec for `config.role`. Anything allocated
    /// before a failure is released on return.
    pub fn create(config: PipelineConfig, io: PipelineIo) -> Result<Self> {
        config.validate()?;
        let codec = match (config.role, &io) {
            (Role::Transmit, PipelineIo::Transmit { .. }) => {
                RoleCodec::Encoder(codec::create_encoder(&config.format, &config.codec)?)
            }
            (Role::Receive, PipelineIo::Receive { .. }) => {
                RoleCodec::Decoder(codec::create_decoder(&config.format, &config.codec)?)
            }
            (role, _) => return Err(PipelineError::IoMismatch(role).into()),
        };
        Self::create_with_codec(config, io, codec)
    }

    /// Like [`create`](Self::create) with a caller-supplied codec. The codec
    /// must still produce `config.codec.kind` frames.
    pub fn create_with_codec(config: PipelineConfig, io: PipelineIo, codec: RoleCodec) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(config.input_mode));
        let format = config.format;

        let path = match (config.role, io, codec) {
            (Role::Transmit, PipelineIo::Transmit { sources, transport }, RoleCodec::Encoder(encoder)) => {
                let pcm = Arc::new(StreamBuffer::new(format.frame_bytes() * config.pcm_buffer_frames)?);
                let packetizer = Packetizer::new(
                    config.stream_id,
                    config.codec.kind.frame_type(),
                    config.ttl,
                    TimestampBase::Millis,
                );
                RolePath::Transmit(TransmitPath {
                    pcm,
                    sources: Some(sources),
                    encode: Some(EncodeParts {
                        encoder,
                        packetizer,
                        transport,
                    }),
                })
            }
            (Role::Receive, PipelineIo::Receive { sink }, RoleCodec::Decoder(decoder)) => {
                let item_limit = config.item_limit();
                let items = Arc::new(ItemBuffer::new(item_limit * config.item_buffer_frames)?);
                let jitter = Arc::new(JitterBuffer::new(
                    format.frame_bytes(),
                    config.jitter_prefill_frames,
                    config.jitter_depth_frames,
                )?);
                RolePath::Receive(ReceivePath {
                    feed: Arc::new(FeedPath {
                        shared: shared.clone(),
                        items,
                        tracker: Mutex::new(SequenceTracker::new(config.stale_window)),
                        stale_window: config.stale_window,
                        item_limit,
                    }),
                    jitter,
                    decoder: Some(decoder),
                    sink: Some(sink),
                })
            }
            (role, _, _) => return Err(PipelineError::IoMismatch(role).into()),
        };

        info!(
            role = ?config.role,
            device = %config.device_name,
            codec = ?config.codec.kind,
            frame_bytes = format.frame_bytes(),
            "Pipeline created"
        );

        Ok(Self {
            config,
            state: Lifecycle::Created,
            shared,
            path,
            claim: None,
            tasks: Vec::new(),
        })
    }

    /// Spawn the task graph. Calling this on a running pipeline does nothing.
    pub fn start(&mut self) -> Result<()> {
        if self.state == Lifecycle::Running {
            return Ok(());
        }

        let claim = DeviceClaim::acquire(&self.config.device_name)?;
        let started = match &mut self.path {
            RolePath::Transmit(path) => start_transmit(path, &self.shared, &self.config, &mut self.tasks),
            RolePath::Receive(path) => start_receive(path, &self.shared, &self.config, &mut self.tasks),
        };

        if let Err(e) = started {
            error!(error = %e, "Pipeline start failed");
            if let Err(halt_err) = self.halt() {
                warn!(error = %halt_err, "Cleanup after failed start was incomplete");
            }
            return Err(e.into());
        }

        self.claim = Some(claim);
        self.state = Lifecycle::Running;
        info!(role = ?self.config.role, "Pipeline started");
        Ok(())
    }

    /// Signal and join all tasks. Buffers and codec survive, so the pipeline
    /// can be started again. Safe to call in any state.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != Lifecycle::Running {
            return Ok(());
        }

        let result = self.halt();
        self.claim = None;
        self.state = Lifecycle::Stopped;
        info!(role = ?self.config.role, "Pipeline stopped");
        result.map_err(Error::from)
    }

    /// Stop and release everything
    pub fn destroy(mut self) -> Result<()> {
        let result = self.stop();
        info!(role = ?self.config.role, "Pipeline destroyed");
        result
    }

    fn halt(&mut self) -> std::result::Result<(), PipelineError> {
        self.shared.running.store(false, Ordering::Release);
        self.path.wake_all();

        let mut lost = false;
        for handle in self.tasks.drain(..) {
            let name = handle.thread().name().unwrap_or("pipeline-task").to_string();
            match handle.join() {
                Ok(output) => self.path.restore(output),
                Err(_) => {
                    error!(task = %name, "Pipeline task panicked");
                    lost = true;
                }
            }
        }

        if lost {
            Err(PipelineError::ResourcesLost)
        } else {
            Ok(())
        }
    }

    /// Queue one received compressed frame for decoding.
    ///
    /// Only valid on a running receive pipeline. Sequence accounting happens
    /// here; a full buffer is reported as [`PipelineError::Capacity`] and the
    /// caller should drop the datagram.
    pub fn feed(&self, payload: &[u8], seq: u16, timestamp: u32) -> std::result::Result<(), PipelineError> {
        match &self.path {
            RolePath::Receive(path) => path.feed.feed(payload, seq, timestamp),
            RolePath::Transmit(_) => Err(PipelineError::WrongRole(Role::Receive)),
        }
    }

    /// Handle for feeding from the network receive thread
    pub fn feed_handle(&self) -> std::result::Result<PipelineFeed, PipelineError> {
        match &self.path {
            RolePath::Receive(path) => Ok(PipelineFeed { path: path.feed.clone() }),
            RolePath::Transmit(_) => Err(PipelineError::WrongRole(Role::Receive)),
        }
    }

    pub fn get_stats(&self) -> PipelineStats {
        self.shared.stats.snapshot()
    }

    /// Switch the capture source. Takes effect at the next frame boundary.
    pub fn set_input_mode(&self, mode: InputMode) -> std::result::Result<(), PipelineError> {
        if self.config.role != Role::Transmit {
            return Err(PipelineError::WrongRole(Role::Transmit));
        }
        let previous = self.shared.input_mode.swap(mode.to_u8(), Ordering::AcqRel);
        if previous != mode.to_u8() {
            info!(?mode, "Input mode changed");
        }
        Ok(())
    }

    pub fn input_mode(&self) -> InputMode {
        self.shared.input_mode()
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == Lifecycle::Running
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Jitter buffer state of a receive pipeline
    pub fn jitter_state(&self) -> Option<JitterState> {
        match &self.path {
            RolePath::Receive(path) => Some(path.jitter.state()),
            RolePath::Transmit(_) => None,
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Pipeline did not stop cleanly");
        }
    }
}

fn start_transmit(
    path: &mut TransmitPath,
    shared: &Arc<Shared>,
    config: &PipelineConfig,
    tasks: &mut Vec<JoinHandle<TaskOutput>>,
) -> std::result::Result<(), PipelineError> {
    if path.sources.is_none() || path.encode.is_none() {
        return Err(PipelineError::ResourcesLost);
    }

    path.pcm.clear();
    let consumer = path.pcm.set_consumer()?;
    let (Some(sources), Some(parts)) = (path.sources.take(), path.encode.take()) else {
        return Err(PipelineError::ResourcesLost);
    };

    shared.running.store(true, Ordering::Release);

    let encode = EncodeTask {
        shared: shared.clone(),
        pcm: path.pcm.clone(),
        consumer,
        parts,
        format: config.format,
        faults: config.faults.clone(),
    };
    tasks.push(spawn_task("meshnet-encode", move || encode.run())?);

    let capture = CaptureTask {
        shared: shared.clone(),
        pcm: path.pcm.clone(),
        sources,
        format: config.format,
        faults: config.faults.clone(),
    };
    tasks.push(spawn_task("meshnet-capture", move || capture.run())?);
    Ok(())
}

fn start_receive(
    path: &mut ReceivePath,
    shared: &Arc<Shared>,
    config: &PipelineConfig,
    tasks: &mut Vec<JoinHandle<TaskOutput>>,
) -> std::result::Result<(), PipelineError> {
    if path.decoder.is_none() || path.sink.is_none() {
        return Err(PipelineError::ResourcesLost);
    }

    path.feed.items.clear();
    path.jitter.reset();
    *path.feed.tracker.lock() = SequenceTracker::new(path.feed.stale_window);

    let playback_wake = path.jitter.set_consumer()?;
    let decode_wake = path.feed.items.set_consumer()?;
    let (Some(decoder), Some(sink)) = (path.decoder.take(), path.sink.take()) else {
        return Err(PipelineError::ResourcesLost);
    };

    // feed() starts accepting once this flag is set
    shared.running.store(true, Ordering::Release);

    let playback = PlaybackTask {
        shared: shared.clone(),
        jitter: path.jitter.clone(),
        consumer: playback_wake,
        sink,
        format: config.format,
        output_gain: config.output_gain,
        faults: config.faults.clone(),
    };
    tasks.push(spawn_task("meshnet-playback", move || playback.run())?);

    let decode = DecodeTask {
        shared: shared.clone(),
        items: path.feed.items.clone(),
        consumer: decode_wake,
        jitter: path.jitter.clone(),
        decoder,
        format: config.format,
        faults: config.faults.clone(),
    };
    tasks.push(spawn_task("meshnet-decode", move || decode.run())?);
    Ok(())
}
