use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{ClockMode, ClockState, SharedClock, TickCounter, TimeReading, TimeSource};
use crate::config::ClockConfig;
use crate::ntp::{REF_ID_GPS, STRATUM_MAX};
use crate::ntp_client::NetworkCorrection;
use crate::pps::{PpsMailbox, PpsSample};
use crate::status::DisciplineStatus;

const HOLDOVER_STRATUM: u8 = 2;
const RATE_FRAC_BITS: u32 = 16;
const LOOP_PERIOD: Duration = Duration::from_millis(250);
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Why an edge was not used for discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeRejection {
    /// The edge did not come after the previous accepted edge.
    NotMonotonic,
    /// Measured rate outside the tolerance around nominal.
    RateOutOfTolerance { measured_hz: u64 },
    /// GPS label does not move past the current anchor.
    LabelNotAdvancing { gps_second: u64 },
}

#[derive(Debug, Clone, Copy)]
struct AcceptedEdge {
    ticks: u64,
    gps_second: Option<u64>,
}

/// Sole owner of the clock state. Turns PPS edges and network corrections
/// into published [`ClockState`] updates.
pub struct DisciplineController<C: TickCounter + ?Sized> {
    clock: Arc<SharedClock>,
    counter: Arc<C>,
    config: ClockConfig,
    state: ClockState,
    nominal_hz: u64,
    /// Smoothed tick rate in Hz, 16 fractional bits.
    rate_fp: u64,
    last_edge: Option<AcceptedEdge>,
    rejected_edges: u64,
}

impl<C: TickCounter + ?Sized> DisciplineController<C> {
    pub fn new(clock: Arc<SharedClock>, counter: Arc<C>, config: ClockConfig) -> Self {
        let nominal_hz = config.nominal_tick_hz.max(1);
        let state = ClockState::unsynchronized(counter.ticks(), nominal_hz);
        clock.publish(state);
        DisciplineController {
            clock,
            counter,
            nominal_hz: nominal_hz as u64,
            rate_fp: (nominal_hz as u64) << RATE_FRAC_BITS,
            config,
            state,
            last_edge: None,
            rejected_edges: 0,
        }
    }

    pub fn state(&self) -> &ClockState {
        &self.state
    }

    pub fn mode(&self) -> ClockMode {
        self.state.mode
    }

    pub fn rejected_edges(&self) -> u64 {
        self.rejected_edges
    }

    /// Current disciplined time, monotonic across readers.
    pub fn now(&self) -> TimeReading {
        self.clock.now(self.counter.ticks())
    }

    /// Feed one PPS edge. A labelled edge re-anchors the clock and puts it in
    /// GPS mode whatever the previous mode; an unlabelled edge only refines
    /// the rate estimate.
    pub fn handle_pps(&mut self, sample: PpsSample) -> Result<(), EdgeRejection> {
        if let Err(rejection) = self.check_edge(&sample) {
            self.rejected_edges += 1;
            warn!(
                "[Discipline] Spurious PPS edge at tick {} discarded: {:?}",
                sample.capture_ticks, rejection
            );
            return Err(rejection);
        }

        self.last_edge = Some(AcceptedEdge {
            ticks: sample.capture_ticks,
            gps_second: sample.gps_second,
        });

        let Some(gps_second) = sample.gps_second else {
            debug!(
                "[Discipline] Unlabelled PPS edge at tick {}, rate estimate {} Hz",
                sample.capture_ticks,
                self.smoothed_rate_hz()
            );
            return Ok(());
        };

        let previous = self.state.mode;
        let mut next = self.state;
        next.anchor_ticks = sample.capture_ticks;
        next.anchor_epoch = gps_second;
        next.tick_rate_hz = self.smoothed_rate_hz();
        next.mode = ClockMode::Synchronized(TimeSource::Gps);
        next.last_pps_ticks = Some(sample.capture_ticks);
        next.correction_us = 0;
        next.stratum = 1;
        next.reference_id = REF_ID_GPS;
        next.reference_epoch = gps_second;
        next.reference_ticks = sample.capture_ticks;
        next.root_delay_us = 0;
        next.base_dispersion_us = tick_period_us(next.tick_rate_hz);
        self.commit(next);

        if previous != self.state.mode {
            info!(
                "[Discipline] {} -> {} at {} (rate {} Hz)",
                previous, self.state.mode, gps_second, self.state.tick_rate_hz
            );
        }
        Ok(())
    }

    fn check_edge(&mut self, sample: &PpsSample) -> Result<(), EdgeRejection> {
        // Once any labelled edge has anchored the clock, labels must move
        // forward from it, whatever mode the clock has moved on to since.
        if let Some(gps_second) = sample.gps_second {
            if self.state.last_pps_ticks.is_some() && gps_second <= self.state.anchor_epoch {
                return Err(EdgeRejection::LabelNotAdvancing { gps_second });
            }
        }

        let Some(prev) = self.last_edge else {
            return Ok(());
        };
        if sample.capture_ticks <= prev.ticks {
            return Err(EdgeRejection::NotMonotonic);
        }
        let interval = sample.capture_ticks - prev.ticks;

        // Whole seconds between the two edges: from the labels when both
        // have one, otherwise from the current rate estimate.
        let seconds = match (prev.gps_second, sample.gps_second) {
            (Some(a), Some(b)) if b > a => b - a,
            (Some(_), Some(_)) => 0,
            _ => {
                let rate = self.smoothed_rate_hz() as u64;
                (interval + rate / 2) / rate
            }
        };
        if seconds == 0 {
            return Err(EdgeRejection::RateOutOfTolerance {
                measured_hz: interval,
            });
        }

        let measured_fp = ((interval as u128) << RATE_FRAC_BITS) / seconds as u128;
        let nominal_fp = (self.nominal_hz as u128) << RATE_FRAC_BITS;
        let deviation = measured_fp.abs_diff(nominal_fp);
        if deviation * 1_000_000 > nominal_fp * self.config.rate_tolerance_ppm as u128 {
            return Err(EdgeRejection::RateOutOfTolerance {
                measured_hz: (measured_fp >> RATE_FRAC_BITS) as u64,
            });
        }

        // Exponential average, weight 2^-shift on the new measurement.
        let measured_fp = measured_fp as i128;
        let current = self.rate_fp as i128;
        let step = (measured_fp - current) >> self.config.rate_smoothing_shift;
        self.rate_fp = (current + step) as u64;
        Ok(())
    }

    fn smoothed_rate_hz(&self) -> u32 {
        let half = 1u64 << (RATE_FRAC_BITS - 1);
        ((self.rate_fp + half) >> RATE_FRAC_BITS).clamp(1, u32::MAX as u64) as u32
    }

    /// Move GPS discipline into holdover once the last labelled edge is
    /// older than the holdover timeout.
    pub fn check_holdover(&mut self, now_ticks: u64) {
        if self.state.mode != ClockMode::Synchronized(TimeSource::Gps) {
            return;
        }
        let Some(last) = self.state.last_pps_ticks else {
            return;
        };
        let timeout = self.state.seconds_to_ticks(self.config.holdover_timeout_secs);
        if now_ticks.saturating_sub(last) <= timeout {
            return;
        }

        let mut next = self.state;
        next.mode = ClockMode::Holdover;
        next.stratum = HOLDOVER_STRATUM;
        self.commit(next);
        warn!(
            "[Discipline] No PPS for {:?}, entering HOLDOVER at {} Hz",
            self.state.ticks_to_duration(now_ticks.saturating_sub(last)),
            self.state.tick_rate_hz
        );
    }

    /// Apply an averaged network offset. Used only while GPS is absent;
    /// returns whether the correction was taken.
    pub fn apply_network_correction(&mut self, correction: &NetworkCorrection, now_ticks: u64) -> bool {
        match self.state.mode {
            ClockMode::Synchronized(TimeSource::Gps) => {
                debug!(
                    "[Discipline] GPS is authoritative, ignoring network offset {:+}us",
                    correction.offset_us
                );
                return false;
            }
            ClockMode::Holdover
            | ClockMode::Unsynchronized
            | ClockMode::Synchronized(TimeSource::Network) => {}
        }

        let previous = self.state.mode;
        let mut next = self.state;
        next.correction_us = next.correction_us.saturating_add(correction.offset_us);
        next.mode = ClockMode::Synchronized(TimeSource::Network);
        next.stratum = correction.upstream_stratum.saturating_add(1).min(STRATUM_MAX);
        next.reference_id = correction.reference_id;
        next.reference_epoch = (next.epoch_units(now_ticks).max(0) >> 32) as u64;
        next.reference_ticks = now_ticks;
        next.root_delay_us = correction.mean_rtt_us;
        next.base_dispersion_us = correction.max_rtt_us / 2;
        self.commit(next);

        if previous != self.state.mode {
            info!("[Discipline] {} -> {}", previous, self.state.mode);
        }
        info!(
            "[Discipline] Network correction {:+}us from {} server(s), stratum {}",
            correction.offset_us, correction.responders, self.state.stratum
        );
        if correction.offset_us < 0 {
            info!(
                "[Discipline] Served time held for up to {}us while the clock falls back",
                correction.offset_us.unsigned_abs()
            );
        }
        true
    }

    pub fn status(&self, missed_edges: u64) -> DisciplineStatus {
        DisciplineStatus::from_state(
            &self.state,
            self.counter.ticks(),
            self.nominal_hz as u32,
            missed_edges,
            self.rejected_edges,
        )
    }

    fn commit(&mut self, next: ClockState) {
        self.state = next;
        self.clock.publish(next);
    }

    /// Controller task. Each iteration drains PPS before network
    /// corrections, so a GPS edge always wins over a pending offset.
    pub fn run(
        mut self,
        mailbox: Arc<PpsMailbox>,
        corrections: Receiver<NetworkCorrection>,
        running: Arc<AtomicBool>,
    ) {
        mailbox.register_consumer();
        notify_ready();
        info!(
            "[Discipline] Started: nominal {} Hz, tolerance {} ppm, holdover after {} s",
            self.nominal_hz, self.config.rate_tolerance_ppm, self.config.holdover_timeout_secs
        );

        let mut client_connected = true;
        let mut last_status = Instant::now();

        while running.load(Ordering::SeqCst) {
            while let Some(sample) = mailbox.take() {
                let _ = self.handle_pps(sample);
            }

            let now_ticks = self.counter.ticks();
            self.check_holdover(now_ticks);

            while client_connected {
                match corrections.try_recv() {
                    Ok(correction) => {
                        self.apply_network_correction(&correction, now_ticks);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        debug!("[Discipline] NTP client stopped");
                        client_connected = false;
                    }
                }
            }

            notify_watchdog();

            if last_status.elapsed() >= STATUS_INTERVAL {
                let status = self.status(mailbox.missed());
                info!("[Status] {}", status);
                match serde_json::to_string(&status) {
                    Ok(json) => debug!("[Status] {}", json),
                    Err(e) => debug!("[Status] Could not serialize status: {}", e),
                }
                last_status = Instant::now();
            }

            mailbox.wait(LOOP_PERIOD);
        }

        info!("[Discipline] Shutting down");
    }
}

/// Smallest whole number of microseconds covering one tick.
fn tick_period_us(rate_hz: u32) -> u64 {
    let rate = rate_hz.max(1) as u64;
    (1_000_000 + rate - 1) / rate
}

#[cfg(unix)]
fn notify_ready() {
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        debug!("[Discipline] sd_notify ready failed: {}", e);
    }
}

#[cfg(unix)]
fn notify_watchdog() {
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
        debug!("[Discipline] sd_notify watchdog failed: {}", e);
    }
}

#[cfg(not(unix))]
fn notify_ready() {}

#[cfg(not(unix))]
fn notify_watchdog() {}
