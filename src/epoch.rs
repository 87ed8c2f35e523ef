//! Calendar <-> epoch-seconds conversion.
//!
//! Pure proleptic Gregorian arithmetic in UTC. Epoch seconds count from
//! 1970-01-01T00:00:00 and the supported range ends at 9999-12-31T23:59:59.
//! These are the only conversion primitives the rest of the crate uses; NTP
//! timestamps are derived from epoch seconds plus the fixed 1900 offset
//! (see [`crate::ntp::NTP_EPOCH_OFFSET`]).

use anyhow::{anyhow, Result};
use std::fmt;

pub const MIN_YEAR: u16 = 1970;
pub const MAX_YEAR: u16 = 9999;

/// Last representable second (9999-12-31T23:59:59).
pub const MAX_EPOCH: u64 = 253_402_300_799;

const SECS_PER_DAY: u64 = 86_400;

/// Days between 0000-03-01 and 1970-01-01 in the shifted-year calendar.
const DAYS_TO_UNIX_EPOCH: i64 = 719_468;

/// Broken-down UTC time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    /// 1..=12
    pub month: u8,
    /// 1..=31
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// 0 = Sunday
    pub weekday: u8,
    /// 1..=366
    pub day_of_year: u16,
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

pub fn is_leap_year(year: u16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Number of days in `month` (1..=12), or 0 for an out-of-range month.
pub fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

/// Convert a UTC calendar date and time into seconds since the Unix epoch.
///
/// Impossible dates (month 13, April 31st, February 29th outside leap years,
/// hour 24, ...) and years outside 1970..=9999 are rejected.
pub fn datetime_to_epoch(
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
) -> Result<u64> {
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return Err(anyhow!("Year {} outside supported range {}..={}", year, MIN_YEAR, MAX_YEAR));
    }
    if !(1..=12).contains(&month) {
        return Err(anyhow!("Invalid month {}", month));
    }
    if day == 0 || day > days_in_month(year, month) {
        return Err(anyhow!("Invalid day {} for {:04}-{:02}", day, year, month));
    }
    if hour > 23 || minute > 59 || second > 59 {
        return Err(anyhow!("Invalid time of day {:02}:{:02}:{:02}", hour, minute, second));
    }

    let days = days_from_civil(year as i64, month as i64, day as i64);
    // days >= 0 because year >= 1970
    Ok(days as u64 * SECS_PER_DAY + hour as u64 * 3600 + minute as u64 * 60 + second as u64)
}

/// Inverse of [`datetime_to_epoch`].
pub fn epoch_to_datetime(epoch: u64) -> Result<DateTime> {
    if epoch > MAX_EPOCH {
        return Err(anyhow!("Epoch {} beyond supported range", epoch));
    }

    let days = (epoch / SECS_PER_DAY) as i64;
    let secs_of_day = epoch % SECS_PER_DAY;
    let (year, month, day) = civil_from_days(days);

    let day_of_year = (days - days_from_civil(year, 1, 1)) as u16 + 1;
    // 1970-01-01 was a Thursday
    let weekday = ((days + 4) % 7) as u8;

    Ok(DateTime {
        year: year as u16,
        month: month as u8,
        day: day as u8,
        hour: (secs_of_day / 3600) as u8,
        minute: (secs_of_day / 60 % 60) as u8,
        second: (secs_of_day % 60) as u8,
        weekday,
        day_of_year,
    })
}

// Years are shifted to start in March so the leap day is the last day of the
// year; each 400-year era then has a fixed 146097 days.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - DAYS_TO_UNIX_EPOCH
}

fn civil_from_days(days: i64) -> (i64, i64, i64) {
    let z = days + DAYS_TO_UNIX_EPOCH;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}
