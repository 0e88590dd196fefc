//! Pipeline statistics
//!
//! One [`PipelineStats`] block per pipeline, shared by its tasks and the
//! feed path. Each update is a single short lock acquisition and readers get
//! a copy.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Snapshot of pipeline counters. Counters only grow; they are never reset
/// after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    /// Frames that made it through the role's codec stage
    pub frames_processed: u64,
    /// Frames lost to full buffers, codec faults, send failures or sequence gaps
    pub frames_dropped: u64,
    pub buffer_underruns: u64,
    pub buffer_overruns: u64,
    pub packets_lost: u64,
    pub packets_reordered: u64,
    pub packets_stale: u64,
    pub codec_errors: u64,
    pub codec_resets: u64,
    pub device_timeouts: u64,
    pub device_resets: u64,
    /// Rolling average, microseconds
    pub avg_encode_latency_us: u32,
    /// Rolling average, microseconds
    pub avg_decode_latency_us: u32,
    /// Occupancy of the role's PCM buffer
    pub buffer_fill_percent: u8,
    /// Sender timestamp of the most recent fed frame
    pub last_remote_timestamp: u32,
    pub created_at: DateTime<Utc>,
}

impl PipelineStats {
    fn new() -> Self {
        Self {
            frames_processed: 0,
            frames_dropped: 0,
            buffer_underruns: 0,
            buffer_overruns: 0,
            packets_lost: 0,
            packets_reordered: 0,
            packets_stale: 0,
            codec_errors: 0,
            codec_resets: 0,
            device_timeouts: 0,
            device_resets: 0,
            avg_encode_latency_us: 0,
            avg_decode_latency_us: 0,
            buffer_fill_percent: 0,
            last_remote_timestamp: 0,
            created_at: Utc::now(),
        }
    }

    /// Fraction of packets lost to sequence gaps, in percent
    pub fn loss_percent(&self) -> f32 {
        let total = self.frames_processed + self.packets_lost;
        if total == 0 {
            0.0
        } else {
            self.packets_lost as f32 * 100.0 / total as f32
        }
    }
}

/// 1/8 weight exponential average; the first sample seeds it
pub(crate) fn rolling_average(avg: u32, sample: u32) -> u32 {
    if avg == 0 {
        sample
    } else {
        ((avg as u64 * 7 + sample as u64) / 8) as u32
    }
}

pub(crate) struct StatsCell {
    inner: Mutex<PipelineStats>,
}

impl StatsCell {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(PipelineStats::new()),
        }
    }

    /// Apply one update under a single lock acquisition
    pub(crate) fn update(&self, f: impl FnOnce(&mut PipelineStats)) {
        f(&mut self.inner.lock());
    }

    pub(crate) fn snapshot(&self) -> PipelineStats {
        self.inner.lock().clone()
    }

    pub(crate) fn record_encoded(&self, latency_us: u32) {
        self.update(|s| {
            s.frames_processed += 1;
            s.avg_encode_latency_us = rolling_average(s.avg_encode_latency_us, latency_us);
        });
    }

    pub(crate) fn record_decoded(&self, latency_us: u32) {
        self.update(|s| {
            s.frames_processed += 1;
            s.avg_decode_latency_us = rolling_average(s.avg_decode_latency_us, latency_us);
        });
    }

    pub(crate) fn add_dropped(&self, frames: u64) {
        self.update(|s| s.frames_dropped += frames);
    }

    pub(crate) fn set_fill(&self, percent: u8) {
        self.update(|s| s.buffer_fill_percent = percent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_average() {
        assert_eq!(rolling_average(0, 800), 800);
        assert_eq!(rolling_average(800, 0), 700);
        assert_eq!(rolling_average(800, 1600), 900);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let cell = StatsCell::new();
        cell.record_decoded(100);
        let snap = cell.snapshot();
        cell.add_dropped(2);

        assert_eq!(snap.frames_processed, 1);
        assert_eq!(snap.frames_dropped, 0);
        assert_eq!(cell.snapshot().frames_dropped, 2);
        assert_eq!(snap.created_at, cell.snapshot().created_at);
    }

    #[test]
    fn test_stats_serialize_for_logs() {
        let cell = StatsCell::new();
        cell.update(|s| s.packets_lost = 3);
        let json = serde_json::to_value(cell.snapshot()).unwrap();
        assert_eq!(json["packets_lost"], 3);
        assert!(json["created_at"].is_string());
    }
}
