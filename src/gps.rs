//! GPS collaborator boundary.
//!
//! Message decoding (NMEA/UBX) happens outside this crate. The decoder hands
//! over one event per second: the UTC label of the PPS edge that just
//! passed, and whether the receiver vouches that the label belongs to that
//! edge. The hosted daemon reads these events as text lines from a feed
//! (typically a FIFO the decoder writes):
//!
//! ```text
//! 2026-10-19T17:24:05Z 1
//! ```

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::TickCounter;
use crate::epoch::datetime_to_epoch;
use crate::pps::PpsCapture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpsEvent {
    pub utc_second: u64,
    pub pps_correlated: bool,
}

/// Parse one feed line: `YYYY-MM-DDTHH:MM:SSZ <0|1>`.
pub fn parse_event_line(line: &str) -> Result<GpsEvent> {
    let mut fields = line.split_whitespace();
    let stamp = fields.next().ok_or_else(|| anyhow!("Empty GPS line"))?;
    let flag = fields.next().ok_or_else(|| anyhow!("Missing PPS flag in {:?}", line))?;
    if fields.next().is_some() {
        return Err(anyhow!("Trailing fields in {:?}", line));
    }

    let pps_correlated = match flag {
        "1" => true,
        "0" => false,
        other => return Err(anyhow!("Invalid PPS flag {:?}", other)),
    };

    let stamp = stamp
        .strip_suffix('Z')
        .ok_or_else(|| anyhow!("GPS time {:?} is not UTC", stamp))?;
    let (date, time) = stamp
        .split_once('T')
        .ok_or_else(|| anyhow!("Malformed GPS time {:?}", stamp))?;

    let date: Vec<&str> = date.split('-').collect();
    let time: Vec<&str> = time.split(':').collect();
    if date.len() != 3 || time.len() != 3 {
        return Err(anyhow!("Malformed GPS time {:?}", stamp));
    }

    let utc_second = datetime_to_epoch(
        date[0].parse()?,
        date[1].parse()?,
        date[2].parse()?,
        time[0].parse()?,
        time[1].parse()?,
        time[2].parse()?,
    )?;

    Ok(GpsEvent {
        utc_second,
        pps_correlated,
    })
}

/// Feed reader loop. Each event is stamped with the tick count at which it
/// was read and passed to the PPS capture for correlation. Malformed lines
/// are dropped.
pub fn run<R: BufRead, C: TickCounter + ?Sized>(
    reader: R,
    counter: Arc<C>,
    capture: Arc<PpsCapture>,
    running: Arc<AtomicBool>,
) {
    for line in reader.lines() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("[GPS] Feed read error: {}", e);
                break;
            }
        };
        let arrival = counter.ticks();
        if line.trim().is_empty() {
            continue;
        }
        match parse_event_line(&line) {
            Ok(event) => capture.gps_event(event, arrival),
            Err(e) => debug!("[GPS] Discarding line: {}", e),
        }
    }
    info!("[GPS] Feed closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTicks;
    use crate::pps::PpsMailbox;
    use std::io::Cursor;

    #[test]
    fn test_parse_event_line() {
        let event = parse_event_line("2023-11-14T22:13:20Z 1").unwrap();
        assert_eq!(event, GpsEvent { utc_second: 1_700_000_000, pps_correlated: true });

        let event = parse_event_line("  2024-02-29T00:00:00Z   0 ").unwrap();
        assert!(!event.pps_correlated);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_event_line("").is_err());
        assert!(parse_event_line("2023-11-14T22:13:20Z").is_err());
        assert!(parse_event_line("2023-11-14T22:13:20 1").is_err());
        assert!(parse_event_line("2023-11-14 22:13:20Z 1").is_err());
        assert!(parse_event_line("2023-02-29T00:00:00Z 1").is_err());
        assert!(parse_event_line("2023-11-14T22:13:20Z yes").is_err());
        assert!(parse_event_line("2023-11-14T22:13:20Z 1 extra").is_err());
        assert!(parse_event_line("2023-11-xxT22:13:20Z 1").is_err());
    }

    #[test]
    fn test_feed_drives_capture() {
        let counter = Arc::new(ManualTicks::new(1_000_000));
        let mailbox = Arc::new(PpsMailbox::new());
        let capture = Arc::new(PpsCapture::new(mailbox.clone(), 500_000));
        let running = Arc::new(AtomicBool::new(true));

        counter.set(10_000_000);
        capture.on_edge(10_000_000);
        mailbox.take();

        counter.set(10_200_000);
        let feed = Cursor::new("garbage\n\n2023-11-14T22:13:20Z 1\n");
        run(feed, counter.clone(), capture.clone(), running);

        capture.on_edge(11_000_000);
        assert_eq!(mailbox.take().unwrap().gps_second, Some(1_700_000_001));
    }
}
