//! Prefill jitter buffer
//!
//! Wraps a [`StreamBuffer`] of PCM with two watermarks. Playback is withheld
//! (silence is emitted) until `prefill_frames` frames have accumulated, then
//! one frame is consumed per pop. Any pop that finds the buffer empty counts
//! an underrun and drops back to filling, so playback resumes only after a
//! full prefill rather than on the next non-empty read.
//!
//! The decode task is the only writer and the playback task the only reader.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::audio::buffer::{Consumer, RingBuffer, StreamBuffer};
use crate::error::{BufferError, Error};

/// Playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterState {
    /// Below prefill; emitting silence
    Filling,
    /// Emitting buffered frames
    Playing,
}

/// Result of one [`JitterBuffer::pop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Playout {
    /// A real frame was copied out
    Frame,
    /// Still prefilling; silence was written
    Silence,
    /// Buffer ran dry while playing; silence was written and the buffer
    /// went back to filling
    Underrun,
}

impl Playout {
    pub fn is_frame(&self) -> bool {
        matches!(self, Playout::Frame)
    }
}

pub struct JitterBuffer {
    buffer: StreamBuffer,
    frame_bytes: usize,
    prefill_frames: usize,
    depth_frames: usize,
    playing: AtomicBool,
    underruns: AtomicU64,
    overruns: AtomicU64,
}

impl JitterBuffer {
    /// Create a jitter buffer of `depth_frames` frames of `frame_bytes` each.
    ///
    /// `prefill_frames` must be non-zero and strictly less than
    /// `depth_frames`.
    pub fn new(frame_bytes: usize, prefill_frames: usize, depth_frames: usize) -> Result<Self, Error> {
        if frame_bytes == 0 || prefill_frames == 0 {
            return Err(Error::Config(format!(
                "jitter buffer needs non-zero frame size and prefill (frame_bytes={}, prefill={})",
                frame_bytes, prefill_frames
            )));
        }
        if prefill_frames >= depth_frames {
            return Err(Error::Config(format!(
                "jitter prefill ({} frames) must be less than depth ({} frames)",
                prefill_frames, depth_frames
            )));
        }

        Ok(Self {
            buffer: StreamBuffer::new(frame_bytes * depth_frames)?,
            frame_bytes,
            prefill_frames,
            depth_frames,
            playing: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        })
    }

    /// Queue one frame. A full buffer drops the frame and counts an overrun;
    /// the write is never retried.
    pub fn push(&self, frame: &[u8]) -> Result<(), BufferError> {
        self.buffer.write(frame).map_err(|e| {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            e
        })
    }

    /// Fill `out` (one frame) with the next frame or with silence.
    pub fn pop(&self, out: &mut [u8]) -> Playout {
        if !self.playing.load(Ordering::Acquire) {
            if self.buffer.available() < self.prefill_frames * self.frame_bytes {
                out.fill(0);
                return Playout::Silence;
            }
            self.playing.store(true, Ordering::Release);
            tracing::debug!(
                "Jitter buffer prefilled ({} bytes)",
                self.buffer.available()
            );
        }

        if self.buffer.available() >= out.len() {
            if let Ok(n) = self.buffer.read(out) {
                out[n..].fill(0);
                return Playout::Frame;
            }
        }

        self.underruns.fetch_add(1, Ordering::Relaxed);
        self.playing.store(false, Ordering::Release);
        out.fill(0);
        Playout::Underrun
    }

    /// Register the playback task as consumer of the underlying buffer
    pub fn set_consumer(&self) -> Result<Consumer, BufferError> {
        self.buffer.set_consumer()
    }

    pub fn wake_consumer(&self) {
        self.buffer.wake_consumer();
    }

    pub fn state(&self) -> JitterState {
        if self.playing.load(Ordering::Acquire) {
            JitterState::Playing
        } else {
            JitterState::Filling
        }
    }

    /// Buffered bytes
    pub fn available(&self) -> usize {
        self.buffer.available()
    }

    /// Buffered whole frames
    pub fn buffered_frames(&self) -> usize {
        self.buffer.available() / self.frame_bytes
    }

    /// Occupancy as a percentage of capacity
    pub fn fill_level(&self) -> u8 {
        self.buffer.fill_percent()
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn prefill_frames(&self) -> usize {
        self.prefill_frames
    }

    pub fn depth_frames(&self) -> usize {
        self.depth_frames
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Drop buffered audio and return to filling
    pub fn reset(&self) {
        self.buffer.clear();
        self.playing.store(false, Ordering::Release);
    }
}
