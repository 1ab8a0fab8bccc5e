//! Monotonic time and the backoff primitive that drives the cooperative
//! event loop (spec.md §2, "Clock & IdleStrategy").

use std::time::Duration;
use std::time::Instant;

use crate::TimestampMs;

/// Abstracts the node's time source so the agent reads it exactly once per
/// tick (spec.md §4.1) and so tests can drive deterministic time.
pub trait Clock: Send + Sync {
    /// A monotonic nanosecond counter, unrelated to wall-clock time.
    fn now_ns(&self) -> u64;

    /// Wall-clock time in epoch milliseconds, used only for persisted
    /// timestamps (recording-log entries, snapshot metadata).
    fn time_ms(&self) -> TimestampMs;
}

/// The real, OS-backed clock.
#[derive(Debug, Default)]
pub struct SystemClock {
    epoch: std::sync::OnceLock<Instant>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn epoch(&self) -> Instant {
        *self.epoch.get_or_init(Instant::now)
    }
}

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        self.epoch().elapsed().as_nanos() as u64
    }

    fn time_ms(&self) -> TimestampMs {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as TimestampMs
    }
}

/// A clock whose value is advanced explicitly by test code, so that
/// election/heartbeat timeouts can be exercised without real sleeps.
#[derive(Debug)]
pub struct TestClock {
    now_ns: std::sync::atomic::AtomicU64,
    time_ms: std::sync::atomic::AtomicI64,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            now_ns: std::sync::atomic::AtomicU64::new(0),
            time_ms: std::sync::atomic::AtomicI64::new(0),
        }
    }

    pub fn advance(&self, d: Duration) {
        self.now_ns.fetch_add(d.as_nanos() as u64, std::sync::atomic::Ordering::Relaxed);
        self.time_ms
            .fetch_add(d.as_millis() as i64, std::sync::atomic::Ordering::Relaxed);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn time_ms(&self) -> TimestampMs {
        self.time_ms.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Backoff primitive for the cooperative loop: spin, then yield, then park
/// with exponentially increasing sleeps, reset the moment any component
/// reports progress (spec.md §5).
#[derive(Debug, Clone)]
pub struct IdleStrategy {
    max_spins: u32,
    max_yields: u32,
    min_park: Duration,
    max_park: Duration,
    spins: u32,
    yields: u32,
    park: Duration,
}

impl IdleStrategy {
    pub fn new(max_spins: u32, max_yields: u32, min_park: Duration, max_park: Duration) -> Self {
        Self {
            max_spins,
            max_yields,
            min_park,
            max_park,
            spins: 0,
            yields: 0,
            park: min_park,
        }
    }

    /// A reasonable default: a short spin, a short yield phase, then parking
    /// for 1ms growing to 1s.
    pub fn backoff_default() -> Self {
        Self::new(100, 100, Duration::from_micros(100), Duration::from_millis(1000))
    }

    /// Call once per tick with the work count observed this tick. Returns the
    /// duration the caller should park for, or `None` if it should not wait
    /// at all (still within the spin/yield phase).
    pub fn idle(&mut self, work_count: u64) -> Option<Duration> {
        if work_count > 0 {
            self.reset();
            return None;
        }

        if self.spins < self.max_spins {
            self.spins += 1;
            std::hint::spin_loop();
            return None;
        }

        if self.yields < self.max_yields {
            self.yields += 1;
            std::thread::yield_now();
            return None;
        }

        let park = self.park;
        self.park = std::cmp::min(self.park * 2, self.max_park);
        Some(park)
    }

    fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park = self.min_park;
    }
}

impl Default for IdleStrategy {
    fn default() -> Self {
        Self::backoff_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_resets_on_progress() {
        let mut idle = IdleStrategy::new(2, 2, Duration::from_millis(1), Duration::from_millis(8));
        assert_eq!(idle.idle(0), None); // spin 1
        assert_eq!(idle.idle(0), None); // spin 2
        assert_eq!(idle.idle(0), None); // yield 1
        assert_eq!(idle.idle(0), None); // yield 2
        assert_eq!(idle.idle(0), Some(Duration::from_millis(1)));
        assert_eq!(idle.idle(0), Some(Duration::from_millis(2)));
        assert_eq!(idle.idle(1), None); // progress resets
        assert_eq!(idle.idle(0), None); // back to spin phase
    }

    #[test]
    fn test_clock_advances_monotonically() {
        let clock = TestClock::new();
        let t0 = clock.now_ns();
        clock.advance(Duration::from_millis(5));
        assert!(clock.now_ns() > t0);
    }
}
