use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

mod state;

pub use self::state::{ClockMode, ClockState, SharedClock, TimeReading, TimeSource};

/// Free-running hardware tick counter.
///
/// The counter never goes backwards. Its nominal rate is only a starting
/// point; the discipline controller measures the real rate against PPS.
pub trait TickCounter: Send + Sync {
    fn ticks(&self) -> u64;

    fn nominal_hz(&self) -> u32;
}

/// Hosted tick counter: nanoseconds of the OS monotonic clock since creation.
pub struct MonotonicTicks {
    origin: Instant,
}

impl MonotonicTicks {
    pub const NOMINAL_HZ: u32 = 1_000_000_000;

    pub fn new() -> Self {
        MonotonicTicks { origin: Instant::now() }
    }

    pub fn ticks_at(&self, instant: Instant) -> u64 {
        instant.saturating_duration_since(self.origin).as_nanos() as u64
    }
}

impl Default for MonotonicTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickCounter for MonotonicTicks {
    fn ticks(&self) -> u64 {
        self.ticks_at(Instant::now())
    }

    fn nominal_hz(&self) -> u32 {
        Self::NOMINAL_HZ
    }
}

/// Counter driven by hand, for deterministic tests and replay.
pub struct ManualTicks {
    now: AtomicU64,
    nominal_hz: u32,
}

impl ManualTicks {
    pub fn new(nominal_hz: u32) -> Self {
        ManualTicks {
            now: AtomicU64::new(0),
            nominal_hz,
        }
    }

    pub fn set(&self, ticks: u64) {
        self.now.store(ticks, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl TickCounter for ManualTicks {
    fn ticks(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn nominal_hz(&self) -> u32 {
        self.nominal_hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_monotonic_ticks_advance() {
        let counter = MonotonicTicks::new();
        let a = counter.ticks();
        std::thread::sleep(Duration::from_millis(2));
        let b = counter.ticks();
        assert!(b > a);
        assert!(b - a >= 2_000_000);
    }

    #[test]
    fn test_ticks_before_origin_saturate() {
        let before = Instant::now();
        let counter = MonotonicTicks::new();
        assert_eq!(counter.ticks_at(before), 0);
    }

    #[test]
    fn test_manual_ticks() {
        let counter = ManualTicks::new(1_000);
        counter.set(10);
        counter.advance(5);
        assert_eq!(counter.ticks(), 15);
        assert_eq!(counter.nominal_hz(), 1_000);
    }
}
