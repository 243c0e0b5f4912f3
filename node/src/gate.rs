use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Minimum-interval admission filter.
///
/// A frame is admitted when at least `interval` has elapsed since the last
/// admitted frame (or since the gate was created). The compare-and-update
/// runs under a lock, so two concurrent callers can never both pass for
/// the same window.
pub struct RateGate {
    interval: Duration,
    last_admitted: Mutex<Instant>,
}

impl RateGate {
    pub fn new(interval: Duration, started_at: Instant) -> Self {
        Self {
            interval,
            last_admitted: Mutex::new(started_at),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns `true` and records `now` if the frame may pass.
    ///
    /// `now` earlier than the last admission counts as zero elapsed time,
    /// and never moves the recorded admission backwards.
    pub fn try_admit(&self, now: Instant) -> bool {
        let mut last = self
            .last_admitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(*last);
        let admit = elapsed >= self.interval;
        debug!(
            elapsed_ms = elapsed.as_millis() as u64,
            interval_ms = self.interval.as_millis() as u64,
            admit,
            "rate gate check"
        );
        if admit {
            *last = (*last).max(now);
        }
        admit
    }

    pub fn last_admitted(&self) -> Instant {
        *self
            .last_admitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn drops_frames_inside_the_interval() {
        let start = Instant::now();
        let gate = RateGate::new(secs(5.0), start);
        for offset in [0.0, 1.0, 4.999] {
            assert!(!gate.try_admit(start + secs(offset)), "t={offset} should be dropped");
        }
        assert_eq!(gate.last_admitted(), start);
    }

    #[test]
    fn admits_at_exactly_the_interval_and_updates() {
        let start = Instant::now();
        let gate = RateGate::new(secs(5.0), start);
        let t = start + secs(5.0);
        assert!(gate.try_admit(t));
        assert_eq!(gate.last_admitted(), t);
        assert!(!gate.try_admit(t + secs(4.0)));
        assert!(gate.try_admit(t + secs(7.5)));
        assert_eq!(gate.last_admitted(), t + secs(7.5));
    }

    #[test]
    fn zero_interval_admits_everything() {
        let start = Instant::now();
        let gate = RateGate::new(Duration::ZERO, start);
        for _ in 0..100 {
            assert!(gate.try_admit(start));
        }
    }

    #[test]
    fn earlier_timestamp_never_moves_state_back() {
        let start = Instant::now();
        let gate = RateGate::new(Duration::ZERO, start + secs(10.0));
        assert!(gate.try_admit(start));
        assert_eq!(gate.last_admitted(), start + secs(10.0));
    }

    #[test]
    fn concurrent_callers_admit_once_per_window() {
        let start = Instant::now();
        let gate = Arc::new(RateGate::new(secs(5.0), start));
        let now = start + secs(6.0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || gate.try_admit(now))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&admitted| admitted)
            .count();
        assert_eq!(admitted, 1);
    }
}
