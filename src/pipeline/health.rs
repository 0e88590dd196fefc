//! Fault policy for pipeline tasks and the process-wide device claims

use dashmap::DashSet;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::error::PipelineError;

/// Admission decision for the next codec call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gate {
    Open,
    /// Disabled after a failure run; drop the frame
    Cooling,
    /// Cooldown just ended; reset codec state before use
    Reopened,
}

/// Disables a codec path for a cooldown after a run of consecutive failures
pub(crate) struct FailureGuard {
    threshold: u32,
    cooldown: Duration,
    consecutive: u32,
    disabled_until: Option<Instant>,
}

impl FailureGuard {
    pub(crate) fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            consecutive: 0,
            disabled_until: None,
        }
    }

    pub(crate) fn check(&mut self) -> Gate {
        match self.disabled_until {
            Some(until) if Instant::now() < until => Gate::Cooling,
            Some(_) => {
                self.disabled_until = None;
                Gate::Reopened
            }
            None => Gate::Open,
        }
    }

    pub(crate) fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Returns true when this failure trips the guard
    pub(crate) fn failure(&mut self) -> bool {
        self.consecutive += 1;
        if self.consecutive < self.threshold {
            return false;
        }
        self.consecutive = 0;
        self.disabled_until = Some(Instant::now() + self.cooldown);
        true
    }
}

/// Counts consecutive device timeouts
pub(crate) struct TimeoutTracker {
    threshold: u32,
    consecutive: u32,
}

impl TimeoutTracker {
    pub(crate) fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    pub(crate) fn ok(&mut self) {
        self.consecutive = 0;
    }

    /// Returns true when the run is long enough to reset the channel
    pub(crate) fn timed_out(&mut self) -> bool {
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            self.consecutive = 0;
            return true;
        }
        false
    }
}

/// Emits at most one log line per interval and counts what it swallowed
pub(crate) struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// `Some(suppressed_since_last)` when a line may be logged now
    pub(crate) fn ready(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

fn claims() -> &'static DashSet<String> {
    static CLAIMS: OnceLock<DashSet<String>> = OnceLock::new();
    CLAIMS.get_or_init(DashSet::new)
}

/// Exclusive use of an audio device by one running pipeline. Released on drop.
#[derive(Debug)]
pub(crate) struct DeviceClaim {
    name: String,
}

impl DeviceClaim {
    pub(crate) fn acquire(name: &str) -> Result<Self, PipelineError> {
        if !claims().insert(name.to_string()) {
            return Err(PipelineError::DeviceBusy(name.to_string()));
        }
        Ok(Self { name: name.to_string() })
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        claims().remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_trips_and_reopens() {
        let mut guard = FailureGuard::new(3, Duration::from_millis(20));
        assert_eq!(guard.check(), Gate::Open);
        assert!(!guard.failure());
        guard.success();
        assert!(!guard.failure());
        assert!(!guard.failure());
        assert!(guard.failure());
        assert_eq!(guard.check(), Gate::Cooling);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(guard.check(), Gate::Reopened);
        assert_eq!(guard.check(), Gate::Open);
    }

    #[test]
    fn test_timeout_tracker_resets_after_run() {
        let mut tracker = TimeoutTracker::new(2);
        assert!(!tracker.timed_out());
        tracker.ok();
        assert!(!tracker.timed_out());
        assert!(tracker.timed_out());
        assert!(!tracker.timed_out());
    }

    #[test]
    fn test_log_throttle() {
        let mut throttle = LogThrottle::new(Duration::from_secs(60));
        assert_eq!(throttle.ready(), Some(0));
        assert_eq!(throttle.ready(), None);
        assert_eq!(throttle.ready(), None);
    }

    #[test]
    fn test_device_claim_is_exclusive() {
        let claim = DeviceClaim::acquire("health-test-device").unwrap();
        assert!(matches!(
            DeviceClaim::acquire("health-test-device"),
            Err(PipelineError::DeviceBusy(_))
        ));
        drop(claim);
        assert!(DeviceClaim::acquire("health-test-device").is_ok());
    }
}
