//! Capture sources for the transmit pipeline
//!
//! The capture task picks a source by [`InputMode`] at the start of every
//! frame, so switching modes never splits a frame between two sources.

use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use std::time::{Duration, Instant};

use crate::audio::frame::AudioFormat;
use crate::error::DeviceError;

/// Upstream source selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Codec line input
    #[default]
    Line,
    /// Built-in tone generator
    Tone,
    /// USB audio
    Usb,
}

impl InputMode {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            InputMode::Line => 0,
            InputMode::Tone => 1,
            InputMode::Usb => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => InputMode::Tone,
            2 => InputMode::Usb,
            _ => InputMode::Line,
        }
    }
}

/// A capture device.
///
/// `read_frame` fills `buf` with interleaved samples and returns how many
/// were written. Fewer than `buf.len()` is a partial read; the pipeline pads
/// the remainder with silence. [`DeviceError::Timeout`] means no data arrived
/// this cycle.
pub trait AudioSource: Send {
    fn read_frame(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize, DeviceError>;

    /// Disable and re-enable the hardware path after repeated timeouts
    fn reset(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn name(&self) -> &str;
}

/// One optional source per input mode
#[derive(Default)]
pub struct SourceSet {
    line: Option<Box<dyn AudioSource>>,
    tone: Option<Box<dyn AudioSource>>,
    usb: Option<Box<dyn AudioSource>>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a source for `mode`, replacing any previous one
    pub fn with(mut self, mode: InputMode, source: Box<dyn AudioSource>) -> Self {
        *self.slot(mode) = Some(source);
        self
    }

    pub fn get_mut(&mut self, mode: InputMode) -> Option<&mut (dyn AudioSource + 'static)> {
        self.slot(mode).as_deref_mut()
    }

    pub fn has(&self, mode: InputMode) -> bool {
        match mode {
            InputMode::Line => self.line.is_some(),
            InputMode::Tone => self.tone.is_some(),
            InputMode::Usb => self.usb.is_some(),
        }
    }

    fn slot(&mut self, mode: InputMode) -> &mut Option<Box<dyn AudioSource>> {
        match mode {
            InputMode::Line => &mut self.line,
            InputMode::Tone => &mut self.tone,
            InputMode::Usb => &mut self.usb,
        }
    }
}

/// Sine tone generator paced to real time.
///
/// Each read sleeps until the frame's deadline so the generator behaves like
/// a device delivering one frame per frame period.
pub struct ToneSource {
    phase: f64,
    phase_increment: f64,
    amplitude: f64,
    channels: usize,
    frame_duration: Duration,
    next_deadline: Option<Instant>,
    paced: bool,
}

impl ToneSource {
    pub fn new(format: &AudioFormat, frequency_hz: f64) -> Self {
        Self {
            phase: 0.0,
            phase_increment: TAU * frequency_hz / format.sample_rate as f64,
            amplitude: 16000.0,
            channels: format.channels.max(1) as usize,
            frame_duration: format.frame_duration(),
            next_deadline: None,
            paced: true,
        }
    }

    /// Generate as fast as frames are requested
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Change the tone; phase restarts to avoid a discontinuity
    pub fn set_frequency(&mut self, sample_rate: u32, frequency_hz: f64) {
        self.phase_increment = TAU * frequency_hz / sample_rate as f64;
        self.phase = 0.0;
    }

    fn fill(&mut self, buf: &mut [i16]) {
        for frame in buf.chunks_mut(self.channels) {
            let value = (self.phase.sin() * self.amplitude) as i16;
            frame.fill(value);
            self.phase += self.phase_increment;
            if self.phase >= TAU {
                self.phase -= TAU;
            }
        }
    }
}

impl AudioSource for ToneSource {
    fn read_frame(&mut self, buf: &mut [i16], _timeout: Duration) -> Result<usize, DeviceError> {
        if self.paced {
            let now = Instant::now();
            let deadline = *self.next_deadline.get_or_insert(now);
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            // Resynchronise instead of bursting after a long stall
            let next = deadline + self.frame_duration;
            self.next_deadline = Some(if next < now { now + self.frame_duration } else { next });
        }

        self.fill(buf);
        Ok(buf.len())
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.next_deadline = None;
        Ok(())
    }

    fn name(&self) -> &str {
        "tone"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_fills_full_frame() {
        let format = AudioFormat::default();
        let mut tone = ToneSource::new(&format, 440.0).unpaced();
        let mut buf = vec![0i16; format.samples_per_frame()];

        let n = tone.read_frame(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(buf[0], 0);
        assert!(buf.iter().any(|&s| s > 10_000));
        assert!(buf.iter().any(|&s| s < -10_000));
    }

    #[test]
    fn test_tone_duplicates_across_channels() {
        let format = AudioFormat {
            channels: 2,
            ..AudioFormat::default()
        };
        let mut tone = ToneSource::new(&format, 1000.0).unpaced();
        let mut buf = vec![0i16; format.samples_per_frame()];
        tone.read_frame(&mut buf, Duration::ZERO).unwrap();

        for pair in buf.chunks_exact(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }

    #[test]
    fn test_source_set_slots() {
        let format = AudioFormat::default();
        let mut set = SourceSet::new().with(InputMode::Tone, Box::new(ToneSource::new(&format, 440.0)));
        assert!(set.has(InputMode::Tone));
        assert!(!set.has(InputMode::Line));
        assert!(set.get_mut(InputMode::Usb).is_none());
        assert_eq!(set.get_mut(InputMode::Tone).map(|s| s.name().to_string()), Some("tone".into()));
    }

    #[test]
    fn test_input_mode_round_trips_through_u8() {
        for mode in [InputMode::Line, InputMode::Tone, InputMode::Usb] {
            assert_eq!(InputMode::from_u8(mode.to_u8()), mode);
        }
    }
}
