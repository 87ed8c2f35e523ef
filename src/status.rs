use chrono::DateTime;
use serde::Serialize;
use std::fmt;

use crate::clock::{ClockMode, ClockState};

/// Point-in-time view of the discipline state for status logging.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct DisciplineStatus {
    pub mode: ClockMode,
    pub stratum: u8,
    pub tick_rate_hz: u32,
    /// Rate deviation from nominal, parts per million.
    pub rate_offset_ppm: f64,
    pub anchor_utc: String,
    pub last_pps_age_ms: Option<u64>,
    pub correction_us: i64,
    pub root_dispersion_us: u64,
    pub missed_edges: u64,
    pub rejected_edges: u64,
}

impl DisciplineStatus {
    pub fn from_state(
        state: &ClockState,
        now_ticks: u64,
        nominal_hz: u32,
        missed_edges: u64,
        rejected_edges: u64,
    ) -> Self {
        let rate_offset_ppm = if nominal_hz > 0 {
            (state.tick_rate_hz as f64 - nominal_hz as f64) / nominal_hz as f64 * 1_000_000.0
        } else {
            0.0
        };

        DisciplineStatus {
            mode: state.mode,
            stratum: state.stratum,
            tick_rate_hz: state.tick_rate_hz,
            rate_offset_ppm,
            anchor_utc: format_utc(state.anchor_epoch),
            last_pps_age_ms: state
                .last_pps_age(now_ticks)
                .map(|age| age.as_millis() as u64),
            correction_us: state.correction_us,
            root_dispersion_us: state.root_dispersion_us(now_ticks),
            missed_edges,
            rejected_edges,
        }
    }
}

fn format_utc(epoch: u64) -> String {
    match DateTime::from_timestamp(epoch as i64, 0) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => format!("epoch {}", epoch),
    }
}

impl fmt::Display for DisciplineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | stratum {} | rate {} Hz ({:+.3} ppm) | anchor {}",
            self.mode, self.stratum, self.tick_rate_hz, self.rate_offset_ppm, self.anchor_utc
        )?;
        match self.last_pps_age_ms {
            Some(ms) => write!(f, " | PPS {} ms ago", ms)?,
            None => write!(f, " | no PPS")?,
        }
        if self.correction_us != 0 {
            write!(f, " | correction {:+} us", self.correction_us)?;
        }
        write!(
            f,
            " | dispersion {} us | missed {} rejected {}",
            self.root_dispersion_us, self.missed_edges, self.rejected_edges
        )
    }
}
