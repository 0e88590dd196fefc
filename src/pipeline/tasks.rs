//! Task bodies for both pipeline roles
//!
//! Every loop has the same shape: bounded wait on a buffer wake (or device
//! I/O), drain everything available, produce into the next stage. The bounded
//! wait only exists so the task notices `stop()`. Each task owns its scratch
//! buffers and hands its collaborators back when it returns.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audio::buffer::{Consumer, ItemBuffer, RingBuffer, StreamBuffer};
use crate::audio::frame::{bytes_to_samples, samples_to_bytes, AudioFormat};
use crate::audio::jitter::{JitterBuffer, JitterState, Playout};
use crate::audio::sink::AudioSink;
use crate::audio::source::SourceSet;
use crate::codec::{FrameDecoder, FrameEncoder};
use crate::config::FaultConfig;
use crate::error::DeviceError;
use crate::network::Transport;
use crate::pipeline::health::{FailureGuard, Gate, LogThrottle, TimeoutTracker};
use crate::pipeline::Shared;
use crate::protocol::Packetizer;

const LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Transmit-side collaborators owned by the encode task while running
pub(crate) struct EncodeParts {
    pub(crate) encoder: Box<dyn FrameEncoder>,
    pub(crate) packetizer: Packetizer,
    pub(crate) transport: Box<dyn Transport>,
}

/// What a task hands back when joined
pub(crate) enum TaskOutput {
    Capture(SourceSet),
    Encode(EncodeParts),
    Decode(Box<dyn FrameDecoder>),
    Playback(Box<dyn AudioSink>),
}

fn elapsed_us(started: Instant) -> u32 {
    started.elapsed().as_micros().min(u32::MAX as u128) as u32
}

/// Counts a device failure and resets the channel after a run of them.
/// Returns true when the channel was reset.
fn device_fault(
    shared: &Shared,
    timeouts: &mut TimeoutTracker,
    err: &DeviceError,
    reset: impl FnOnce() -> Result<(), DeviceError>,
    log: &mut LogThrottle,
    channel: &str,
) -> bool {
    let is_timeout = matches!(err, DeviceError::Timeout(_));
    if is_timeout {
        shared.stats.update(|s| s.device_timeouts += 1);
    } else if let Some(skipped) = log.ready() {
        warn!(channel, error = %err, skipped, "Device I/O failed");
    }

    if !timeouts.timed_out() {
        return false;
    }

    warn!(channel, "Resetting device channel after consecutive failures");
    if let Err(e) = reset() {
        warn!(channel, error = %e, "Device reset failed");
    }
    shared.stats.update(|s| s.device_resets += 1);
    true
}

pub(crate) struct CaptureTask {
    pub(crate) shared: Arc<Shared>,
    pub(crate) pcm: Arc<StreamBuffer>,
    pub(crate) sources: SourceSet,
    pub(crate) format: AudioFormat,
    pub(crate) faults: FaultConfig,
}

impl CaptureTask {
    pub(crate) fn run(self) -> TaskOutput {
        let CaptureTask { shared, pcm, mut sources, format, faults } = self;
        let period = format.frame_duration();
        let mut frame = vec![0i16; format.samples_per_frame()];
        let mut bytes = vec![0u8; format.frame_bytes()];
        let mut timeouts = TimeoutTracker::new(faults.device_timeout_threshold);
        let mut overflow_log = LogThrottle::new(LOG_INTERVAL);
        let mut device_log = LogThrottle::new(LOG_INTERVAL);
        let mut selected = None;

        debug!("Capture task started");
        while shared.running.load(Ordering::Acquire) {
            // Mode is sampled once per frame so a switch never splits a frame
            let mode = shared.input_mode();
            if selected != Some(mode) {
                info!(?mode, available = sources.has(mode), "Capture source selected");
                selected = Some(mode);
                timeouts.ok();
            }

            let Some(source) = sources.get_mut(mode) else {
                thread::sleep(period);
                continue;
            };

            match source.read_frame(&mut frame, faults.device_timeout()) {
                Ok(n) => {
                    timeouts.ok();
                    let len = frame.len();
                    frame[n.min(len)..].fill(0);
                    samples_to_bytes(&frame, &mut bytes);
                    if let Err(e) = pcm.write(&bytes) {
                        shared.stats.update(|s| {
                            s.frames_dropped += 1;
                            s.buffer_overruns += 1;
                        });
                        if let Some(skipped) = overflow_log.ready() {
                            warn!(error = %e, skipped, "PCM buffer full, captured frame dropped");
                        }
                    }
                }
                Err(err) => {
                    let name = source.name().to_string();
                    device_fault(&shared, &mut timeouts, &err, || source.reset(), &mut device_log, &name);
                    if !matches!(err, DeviceError::Timeout(_)) {
                        // Hard errors return immediately; idle one frame
                        thread::sleep(period);
                    }
                }
            }
        }

        debug!("Capture task exiting");
        TaskOutput::Capture(sources)
    }
}

pub(crate) struct EncodeTask {
    pub(crate) shared: Arc<Shared>,
    pub(crate) pcm: Arc<StreamBuffer>,
    pub(crate) consumer: Consumer,
    pub(crate) parts: EncodeParts,
    pub(crate) format: AudioFormat,
    pub(crate) faults: FaultConfig,
}

impl EncodeTask {
    pub(crate) fn run(self) -> TaskOutput {
        let EncodeTask { shared, pcm, consumer, mut parts, format, faults } = self;
        let frame_bytes = format.frame_bytes();
        let frame_samples = format.frame_samples() as u32;
        let mut bytes = vec![0u8; frame_bytes];
        let mut samples = vec![0i16; format.samples_per_frame()];
        let mut guard = FailureGuard::new(faults.codec_failure_threshold, faults.codec_cooldown());
        let mut codec_log = LogThrottle::new(LOG_INTERVAL);
        let mut send_log = LogThrottle::new(LOG_INTERVAL);

        debug!("Encode task started");
        while shared.running.load(Ordering::Acquire) {
            consumer.wait(faults.task_wait());

            while pcm.available() >= frame_bytes {
                match pcm.read(&mut bytes) {
                    Ok(n) if n == frame_bytes => {}
                    _ => break,
                }
                bytes_to_samples(&bytes, &mut samples);

                match guard.check() {
                    Gate::Cooling => {
                        shared.stats.add_dropped(1);
                        continue;
                    }
                    Gate::Reopened => {
                        info!("Re-enabling encoder after cooldown");
                        if let Err(e) = parts.encoder.reset() {
                            warn!(error = %e, "Encoder reset failed");
                        }
                        shared.stats.update(|s| s.codec_resets += 1);
                    }
                    Gate::Open => {}
                }

                let started = Instant::now();
                let payload = match parts.encoder.encode(&samples) {
                    Ok(payload) => {
                        guard.success();
                        payload
                    }
                    Err(e) => {
                        shared.stats.update(|s| {
                            s.codec_errors += 1;
                            s.frames_dropped += 1;
                        });
                        if guard.failure() {
                            warn!(error = %e, cooldown_ms = faults.codec_cooldown_ms, "Encoder disabled after repeated failures");
                        } else if let Some(skipped) = codec_log.ready() {
                            warn!(error = %e, skipped, "Encode failed, frame skipped");
                        }
                        continue;
                    }
                };
                let latency_us = elapsed_us(started);

                let datagram = match parts.packetizer.process(&payload, frame_samples) {
                    Ok(datagram) => datagram,
                    Err(e) => {
                        shared.stats.add_dropped(1);
                        if let Some(skipped) = codec_log.ready() {
                            warn!(error = %e, skipped, "Packetizing failed, frame skipped");
                        }
                        continue;
                    }
                };

                match parts.transport.send(&datagram) {
                    Ok(()) => shared.stats.record_encoded(latency_us),
                    Err(e) => {
                        shared.stats.add_dropped(1);
                        if let Some(skipped) = send_log.ready() {
                            warn!(error = %e, skipped, "Send failed, frame dropped");
                        }
                    }
                }
            }

            shared.stats.set_fill(pcm.fill_percent());
        }

        debug!("Encode task exiting");
        TaskOutput::Encode(parts)
    }
}

pub(crate) struct DecodeTask {
    pub(crate) shared: Arc<Shared>,
    pub(crate) items: Arc<ItemBuffer>,
    pub(crate) consumer: Consumer,
    pub(crate) jitter: Arc<JitterBuffer>,
    pub(crate) decoder: Box<dyn FrameDecoder>,
    pub(crate) format: AudioFormat,
    pub(crate) faults: FaultConfig,
}

impl DecodeTask {
    pub(crate) fn run(self) -> TaskOutput {
        let DecodeTask { shared, items, consumer, jitter, mut decoder, format, faults } = self;
        let mut samples = vec![0i16; format.samples_per_frame()];
        let mut bytes = vec![0u8; format.frame_bytes()];
        let mut guard = FailureGuard::new(faults.codec_failure_threshold, faults.codec_cooldown());
        let mut codec_log = LogThrottle::new(LOG_INTERVAL);
        let mut overrun_log = LogThrottle::new(LOG_INTERVAL);

        debug!("Decode task started");
        while shared.running.load(Ordering::Acquire) {
            consumer.wait(faults.task_wait());

            while let Ok(item) = items.receive_item() {
                match guard.check() {
                    Gate::Cooling => {
                        drop(item);
                        shared.stats.add_dropped(1);
                        continue;
                    }
                    Gate::Reopened => {
                        info!("Re-enabling decoder after cooldown");
                        if let Err(e) = decoder.reset() {
                            warn!(error = %e, "Decoder reset failed");
                        }
                        shared.stats.update(|s| s.codec_resets += 1);
                    }
                    Gate::Open => {}
                }

                let started = Instant::now();
                let decoded = decoder.decode(&item, &mut samples);
                item.release();

                let n = match decoded {
                    Ok(n) => {
                        guard.success();
                        n
                    }
                    Err(e) => {
                        shared.stats.update(|s| {
                            s.codec_errors += 1;
                            s.frames_dropped += 1;
                        });
                        if guard.failure() {
                            warn!(error = %e, cooldown_ms = faults.codec_cooldown_ms, "Decoder disabled after repeated failures");
                        } else if let Some(skipped) = codec_log.ready() {
                            warn!(error = %e, skipped, "Decode failed, frame skipped");
                        }
                        continue;
                    }
                };
                let latency_us = elapsed_us(started);

                let len = samples.len();
                samples[n.min(len)..].fill(0);
                samples_to_bytes(&samples, &mut bytes);
                match jitter.push(&bytes) {
                    Ok(()) => shared.stats.record_decoded(latency_us),
                    Err(e) => {
                        shared.stats.update(|s| {
                            s.frames_dropped += 1;
                            s.buffer_overruns += 1;
                        });
                        if let Some(skipped) = overrun_log.ready() {
                            warn!(error = %e, skipped, "Jitter buffer overrun, frame dropped");
                        }
                    }
                }
            }

            shared.stats.set_fill(jitter.fill_level());
        }

        debug!("Decode task exiting");
        TaskOutput::Decode(decoder)
    }
}

pub(crate) struct PlaybackTask {
    pub(crate) shared: Arc<Shared>,
    pub(crate) jitter: Arc<JitterBuffer>,
    pub(crate) consumer: Consumer,
    pub(crate) sink: Box<dyn AudioSink>,
    pub(crate) format: AudioFormat,
    pub(crate) output_gain: f32,
    pub(crate) faults: FaultConfig,
}

impl PlaybackTask {
    pub(crate) fn run(self) -> TaskOutput {
        let PlaybackTask { shared, jitter, consumer, mut sink, format, output_gain, faults } = self;
        let period = format.frame_duration();
        let frame_bytes = jitter.frame_bytes();
        let mut bytes = vec![0u8; frame_bytes];
        let mut samples = vec![0i16; format.samples_per_frame()];
        let mut timeouts = TimeoutTracker::new(faults.device_timeout_threshold);
        let mut device_log = LogThrottle::new(LOG_INTERVAL);

        debug!("Playback task started");
        while shared.running.load(Ordering::Acquire) {
            let ready = match jitter.state() {
                JitterState::Filling => jitter.buffered_frames() >= jitter.prefill_frames(),
                JitterState::Playing => jitter.available() >= frame_bytes,
            };
            if !ready {
                consumer.wait(period);
                if !shared.running.load(Ordering::Acquire) {
                    break;
                }
            }

            // Silence still goes to the device while prefilling or after an
            // underrun so the output never starves
            let playout = jitter.pop(&mut bytes);
            if playout == Playout::Underrun {
                shared.stats.update(|s| s.buffer_underruns += 1);
                debug!("Jitter buffer underrun");
            }

            bytes_to_samples(&bytes, &mut samples);
            if playout.is_frame() && output_gain != 1.0 {
                for sample in samples.iter_mut() {
                    // float to int casts saturate
                    *sample = (*sample as f32 * output_gain) as i16;
                }
            }

            match sink.write_frame(&samples, faults.device_timeout()) {
                Ok(()) => timeouts.ok(),
                Err(err) => {
                    let name = sink.name().to_string();
                    device_fault(&shared, &mut timeouts, &err, || sink.reset(), &mut device_log, &name);
                }
            }

            shared.stats.set_fill(jitter.fill_level());
        }

        debug!("Playback task exiting");
        TaskOutput::Playback(sink)
    }
}
