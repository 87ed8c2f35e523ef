use crate::ntp::{
    micros_to_units, NtpShort, NtpTimestamp, LEAP_ALARM, LEAP_NONE, REF_ID_INIT,
    STRATUM_UNSYNCHRONIZED,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// Frequency tolerance of an undisciplined oscillator (RFC 5905 PHI), in ppm.
/// Dispersion grows at this rate from the last reference update.
pub const DISPERSION_RATE_PPM: u64 = 15;

/// Dispersion reported while unsynchronized (RFC 5905 MAXDISP, 16 s).
pub const MAX_DISPERSION_US: u64 = 16_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimeSource {
    Gps,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClockMode {
    Unsynchronized,
    Synchronized(TimeSource),
    Holdover,
}

impl fmt::Display for ClockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockMode::Unsynchronized => write!(f, "UNSYNC"),
            ClockMode::Synchronized(TimeSource::Gps) => write!(f, "GPS"),
            ClockMode::Synchronized(TimeSource::Network) => write!(f, "NETWORK"),
            ClockMode::Holdover => write!(f, "HOLDOVER"),
        }
    }
}

/// Disciplined time model. Owned and mutated by the discipline controller,
/// copied out to every reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockState {
    pub anchor_ticks: u64,
    /// Unix seconds at `anchor_ticks`. Only ever advances.
    pub anchor_epoch: u64,
    pub tick_rate_hz: u32,
    pub mode: ClockMode,
    /// Tick count of the last GPS-labelled PPS edge.
    pub last_pps_ticks: Option<u64>,
    /// One-shot network correction applied on top of the anchor.
    pub correction_us: i64,
    pub stratum: u8,
    pub reference_id: [u8; 4],
    /// Unix seconds of the last reference update.
    pub reference_epoch: u64,
    /// Tick count of the last reference update; dispersion grows from here.
    pub reference_ticks: u64,
    pub root_delay_us: u64,
    pub base_dispersion_us: u64,
}

/// One read of the disciplined clock, with the quality fields NTP serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeReading {
    pub epoch_seconds: u64,
    pub fraction: u32,
    pub mode: ClockMode,
    pub stratum: u8,
    pub precision: i8,
    pub leap: u8,
    pub root_delay: NtpShort,
    pub root_dispersion: NtpShort,
    pub reference_id: [u8; 4],
    pub reference_ts: NtpTimestamp,
}

impl TimeReading {
    pub fn timestamp(&self) -> NtpTimestamp {
        NtpTimestamp::from_epoch(self.epoch_seconds, self.fraction)
    }

    pub fn is_synchronized(&self) -> bool {
        !matches!(self.mode, ClockMode::Unsynchronized)
    }
}

impl ClockState {
    /// Free-running state anchored at epoch 0.
    pub fn unsynchronized(now_ticks: u64, nominal_hz: u32) -> Self {
        ClockState {
            anchor_ticks: now_ticks,
            anchor_epoch: 0,
            tick_rate_hz: nominal_hz.max(1),
            mode: ClockMode::Unsynchronized,
            last_pps_ticks: None,
            correction_us: 0,
            stratum: STRATUM_UNSYNCHRONIZED,
            reference_id: REF_ID_INIT,
            reference_epoch: 0,
            reference_ticks: now_ticks,
            root_delay_us: 0,
            base_dispersion_us: MAX_DISPERSION_US,
        }
    }

    fn rate(&self) -> i128 {
        self.tick_rate_hz.max(1) as i128
    }

    /// Extrapolated time at `ticks` in 32.32 fixed point (Unix seconds).
    /// Negative only if a correction pulls it before 1970.
    pub fn epoch_units(&self, ticks: u64) -> i128 {
        let elapsed = ticks as i128 - self.anchor_ticks as i128;
        ((self.anchor_epoch as i128) << 32)
            + (elapsed << 32) / self.rate()
            + micros_to_units(self.correction_us)
    }

    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        let nanos = ticks as u128 * 1_000_000_000 / self.tick_rate_hz.max(1) as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    pub fn seconds_to_ticks(&self, secs: u64) -> u64 {
        secs.saturating_mul(self.tick_rate_hz as u64)
    }

    pub fn last_pps_age(&self, now_ticks: u64) -> Option<Duration> {
        self.last_pps_ticks
            .map(|at| self.ticks_to_duration(now_ticks.saturating_sub(at)))
    }

    /// log2 of the tick period: the smallest power of two not shorter than
    /// one tick.
    pub fn precision(&self) -> i8 {
        let rate = self.tick_rate_hz.max(1);
        -((31 - rate.leading_zeros()) as i8)
    }

    pub fn root_dispersion_us(&self, now_ticks: u64) -> u64 {
        match self.mode {
            ClockMode::Unsynchronized => MAX_DISPERSION_US,
            _ => {
                let since = self.ticks_to_duration(now_ticks.saturating_sub(self.reference_ticks));
                let growth = since.as_micros() as u64 * DISPERSION_RATE_PPM / 1_000_000;
                (self.base_dispersion_us + growth).min(MAX_DISPERSION_US)
            }
        }
    }

    /// Read the clock at `ticks`, without the monotonic guard of
    /// [`SharedClock::now`].
    pub fn read(&self, ticks: u64) -> TimeReading {
        let units = self.epoch_units(ticks).clamp(0, u64::MAX as i128) as u64;
        self.reading_from_units(units, ticks)
    }

    fn reading_from_units(&self, units: u64, ticks: u64) -> TimeReading {
        let synchronized = !matches!(self.mode, ClockMode::Unsynchronized);
        TimeReading {
            epoch_seconds: units >> 32,
            fraction: units as u32,
            mode: self.mode,
            stratum: self.stratum,
            precision: self.precision(),
            leap: if synchronized { LEAP_NONE } else { LEAP_ALARM },
            root_delay: NtpShort::from_micros(self.root_delay_us),
            root_dispersion: NtpShort::from_micros(self.root_dispersion_us(ticks)),
            reference_id: self.reference_id,
            reference_ts: if synchronized {
                NtpTimestamp::from_epoch(self.reference_epoch, 0)
            } else {
                NtpTimestamp::ZERO
            },
        }
    }
}

/// Clock state shared between the controller and its readers.
///
/// Readers copy the whole state under a short read lock, so a reader never
/// sees a half-applied update. Served time never goes below a high-water
/// mark: after a backward step readers get the mark until the computed time
/// catches up with it.
pub struct SharedClock {
    state: RwLock<ClockState>,
    high_water: AtomicU64,
}

impl SharedClock {
    pub fn new(initial: ClockState) -> Self {
        SharedClock {
            state: RwLock::new(initial),
            high_water: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> ClockState {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn publish(&self, state: ClockState) {
        match self.state.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    /// Current disciplined time at `ticks`.
    pub fn now(&self, ticks: u64) -> TimeReading {
        let state = self.snapshot();
        let computed = state.epoch_units(ticks).clamp(0, u64::MAX as i128) as u64;

        let mut prev = self.high_water.load(Ordering::Acquire);
        let served = loop {
            if computed <= prev {
                break prev;
            }
            match self.high_water.compare_exchange_weak(
                prev,
                computed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break computed,
                Err(current) => prev = current,
            }
        };

        state.reading_from_units(served, ticks)
    }
}
