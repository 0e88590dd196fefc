//! Playback sinks for the receive pipeline

use std::time::{Duration, Instant};

use crate::error::DeviceError;

/// An output device.
///
/// `write_frame` hands one frame of interleaved samples to the device and may
/// block until the device accepts it, bounded by `timeout`. That blocking is
/// what paces the playback task.
pub trait AudioSink: Send {
    fn write_frame(&mut self, buf: &[i16], timeout: Duration) -> Result<(), DeviceError>;

    /// Disable and re-enable the hardware path after repeated timeouts
    fn reset(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn name(&self) -> &str;
}

/// Discards audio at real-time pace
pub struct NullSink {
    frame_duration: Duration,
    next_deadline: Option<Instant>,
    frames_written: u64,
}

impl NullSink {
    pub fn new(frame_duration: Duration) -> Self {
        Self {
            frame_duration,
            next_deadline: None,
            frames_written: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl AudioSink for NullSink {
    fn write_frame(&mut self, _buf: &[i16], _timeout: Duration) -> Result<(), DeviceError> {
        let now = Instant::now();
        let deadline = *self.next_deadline.get_or_insert(now);
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        let next = deadline + self.frame_duration;
        self.next_deadline = Some(if next < now { now + self.frame_duration } else { next });
        self.frames_written += 1;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.next_deadline = None;
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sink_paces_writes() {
        let mut sink = NullSink::new(Duration::from_millis(5));
        let frame = [0i16; 16];
        let start = Instant::now();
        for _ in 0..4 {
            sink.write_frame(&frame, Duration::from_millis(50)).unwrap();
        }
        // First write is immediate, the next three wait one period each
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert_eq!(sink.frames_written(), 4);
    }
}
