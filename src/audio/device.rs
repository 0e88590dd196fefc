//! cpal-backed capture and playback devices
//!
//! Device callbacks run in the audio driver's context and must never block
//! or allocate. They exchange samples with the pipeline through preallocated
//! lock-free queues and post wakes on a depth-1 channel with `try_send`,
//! mirroring the non-blocking write contract of the ring buffers.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::frame::AudioFormat;
use crate::audio::sink::AudioSink;
use crate::audio::source::AudioSource;
use crate::error::DeviceError;

/// Device description for listings
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all available audio devices
pub fn list_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<DeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = capabilities(&device, true);
                devices.push(DeviceInfo {
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                    continue;
                }
                let (sample_rates, channels) = capabilities(&device, false);
                devices.push(DeviceInfo {
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

fn capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device.supported_input_configs().map(|c| c.collect()).unwrap_or_default()
    } else {
        device.supported_output_configs().map(|c| c.collect()).unwrap_or_default()
    };

    let mut rates = Vec::new();
    let mut channels = Vec::new();
    for config in &configs {
        for rate in [16000u32, 44100, 48000, 96000] {
            let sr = cpal::SampleRate(rate);
            if sr >= config.min_sample_rate() && sr <= config.max_sample_rate() && !rates.contains(&rate) {
                rates.push(rate);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }
    rates.sort_unstable();
    channels.sort_unstable();
    (rates, channels)
}

/// Find a device by name, or the host default when `name` is `None`
fn find_device(name: Option<&str>, input: bool) -> Result<cpal::Device, DeviceError> {
    let host = cpal::default_host();
    let Some(name) = name else {
        let device = if input {
            host.default_input_device()
        } else {
            host.default_output_device()
        };
        return device.ok_or_else(|| DeviceError::NotFound("default device".to_string()));
    };

    let matches = |d: &cpal::Device| d.name().map(|n| n == name).unwrap_or(false);
    let found = if input {
        host.input_devices()
            .map_err(|e| DeviceError::NotFound(e.to_string()))?
            .find(matches)
    } else {
        host.output_devices()
            .map_err(|e| DeviceError::NotFound(e.to_string()))?
            .find(matches)
    };

    found.ok_or_else(|| DeviceError::NotFound(name.to_string()))
}

fn stream_config(format: &AudioFormat) -> StreamConfig {
    StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Owns a cpal stream on a dedicated thread. cpal streams are not `Send` on
/// every platform, so the stream is built and dropped on that thread.
struct StreamThread {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn spawn<F>(name: &str, build: F) -> Result<Self, DeviceError>
    where
        F: FnOnce() -> Result<cpal::Stream, DeviceError> + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<(), DeviceError>>(1);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::Stream(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until asked to stop; the stream drops with this frame
                let _ = stop_rx.recv();
            })
            .map_err(|e| DeviceError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(DeviceError::Disconnected)
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Wake channel posted from a device callback
fn wake_pair() -> (Sender<()>, Receiver<()>) {
    bounded(1)
}

/// Capture from a cpal input device
pub struct CpalInput {
    device_name: Option<String>,
    format: AudioFormat,
    samples: Arc<ArrayQueue<i16>>,
    data_rx: Receiver<()>,
    data_tx: Sender<()>,
    overflows: Arc<AtomicU64>,
    stream: Option<StreamThread>,
    label: String,
}

impl CpalInput {
    /// Open `device_name` (or the default input) and start capturing
    pub fn open(device_name: Option<&str>, format: AudioFormat) -> Result<Self, DeviceError> {
        let (data_tx, data_rx) = wake_pair();
        let mut input = Self {
            device_name: device_name.map(str::to_string),
            samples: Arc::new(ArrayQueue::new(format.samples_per_frame() * 8)),
            format,
            data_rx,
            data_tx,
            overflows: Arc::new(AtomicU64::new(0)),
            stream: None,
            label: format!("input:{}", device_name.unwrap_or("default")),
        };
        input.start_stream()?;
        Ok(input)
    }

    /// Samples dropped because the pipeline fell behind the device
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    fn start_stream(&mut self) -> Result<(), DeviceError> {
        let device_name = self.device_name.clone();
        let config = stream_config(&self.format);
        let samples = self.samples.clone();
        let overflows = self.overflows.clone();
        let data_tx = self.data_tx.clone();

        let stream = StreamThread::spawn("meshnet-cpal-in", move || {
            let device = find_device(device_name.as_deref(), true)?;
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        for &sample in data {
                            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                            if samples.push(value).is_err() {
                                overflows.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        let _ = data_tx.try_send(());
                    },
                    |err| tracing::warn!("Input stream error: {}", err),
                    None,
                )
                .map_err(|e| DeviceError::Stream(e.to_string()))
        })?;

        self.stream = Some(stream);
        tracing::info!("Capture started on {}", self.label);
        Ok(())
    }
}

impl AudioSource for CpalInput {
    fn read_frame(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;

        while filled < buf.len() {
            while filled < buf.len() {
                match self.samples.pop() {
                    Some(sample) => {
                        buf[filled] = sample;
                        filled += 1;
                    }
                    None => break,
                }
            }
            if filled == buf.len() {
                break;
            }

            let now = Instant::now();
            if now >= deadline || self.data_rx.recv_timeout(deadline - now).is_err() {
                break;
            }
        }

        if filled == 0 {
            return Err(DeviceError::Timeout(timeout));
        }
        Ok(filled)
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        tracing::warn!("Resetting capture device {}", self.label);
        self.stream = None;
        while self.samples.pop().is_some() {}
        self.start_stream()
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Playback to a cpal output device
pub struct CpalOutput {
    device_name: Option<String>,
    format: AudioFormat,
    samples: Arc<ArrayQueue<i16>>,
    space_rx: Receiver<()>,
    space_tx: Sender<()>,
    starved: Arc<AtomicU64>,
    stream: Option<StreamThread>,
    label: String,
}

impl CpalOutput {
    /// Open `device_name` (or the default output) and start playback.
    /// `queued_frames` bounds how much audio may sit in the device queue.
    pub fn open(device_name: Option<&str>, format: AudioFormat, queued_frames: usize) -> Result<Self, DeviceError> {
        let (space_tx, space_rx) = wake_pair();
        let mut output = Self {
            device_name: device_name.map(str::to_string),
            samples: Arc::new(ArrayQueue::new(format.samples_per_frame() * queued_frames.max(1))),
            format,
            space_rx,
            space_tx,
            starved: Arc::new(AtomicU64::new(0)),
            stream: None,
            label: format!("output:{}", device_name.unwrap_or("default")),
        };
        output.start_stream()?;
        Ok(output)
    }

    /// Device callbacks that found no queued audio
    pub fn starved_callbacks(&self) -> u64 {
        self.starved.load(Ordering::Relaxed)
    }

    fn start_stream(&mut self) -> Result<(), DeviceError> {
        let device_name = self.device_name.clone();
        let config = stream_config(&self.format);
        let samples = self.samples.clone();
        let starved = self.starved.clone();
        let space_tx = self.space_tx.clone();

        let stream = StreamThread::spawn("meshnet-cpal-out", move || {
            let device = find_device(device_name.as_deref(), false)?;
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut empty = false;
                        for out in data.iter_mut() {
                            *out = match samples.pop() {
                                Some(sample) => sample as f32 / i16::MAX as f32,
                                None => {
                                    empty = true;
                                    0.0
                                }
                            };
                        }
                        if empty {
                            starved.fetch_add(1, Ordering::Relaxed);
                        }
                        let _ = space_tx.try_send(());
                    },
                    |err| tracing::warn!("Output stream error: {}", err),
                    None,
                )
                .map_err(|e| DeviceError::Stream(e.to_string()))
        })?;

        self.stream = Some(stream);
        tracing::info!("Playback started on {}", self.label);
        Ok(())
    }
}

impl AudioSink for CpalOutput {
    fn write_frame(&mut self, buf: &[i16], timeout: Duration) -> Result<(), DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut written = 0;

        while written < buf.len() {
            while written < buf.len() && self.samples.push(buf[written]).is_ok() {
                written += 1;
            }
            if written == buf.len() {
                break;
            }

            let now = Instant::now();
            if now >= deadline || self.space_rx.recv_timeout(deadline - now).is_err() {
                return Err(DeviceError::Timeout(timeout));
            }
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        tracing::warn!("Resetting playback device {}", self.label);
        self.stream = None;
        while self.samples.pop().is_some() {}
        self.start_stream()
    }

    fn name(&self) -> &str {
        &self.label
    }
}
