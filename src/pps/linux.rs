//! Linux PPS API (RFC 2783) edge source for `/dev/ppsN`.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::PpsCapture;
use crate::clock::TickCounter;

/// `_IOWR('p', 0xa4, struct pps_fdata *)`. The size field is that of the
/// pointer, as in `linux/pps.h`.
const PPS_FETCH: nix::sys::ioctl::ioctl_num_type =
    nix::request_code_readwrite!(b'p', 0xa4, std::mem::size_of::<*mut PpsFdata>());

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PpsKtime {
    sec: i64,
    nsec: i32,
    flags: u32,
}

impl PpsKtime {
    fn to_system_time(self) -> Option<SystemTime> {
        if self.sec <= 0 || !(0..1_000_000_000).contains(&self.nsec) {
            return None;
        }
        Some(UNIX_EPOCH + Duration::new(self.sec as u64, self.nsec as u32))
    }
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, Default)]
struct PpsKinfo {
    assert_sequence: u32,
    clear_sequence: u32,
    assert_tu: PpsKtime,
    clear_tu: PpsKtime,
    current_mode: i32,
    _padding: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PpsFdata {
    info: PpsKinfo,
    timeout: PpsKtime,
}

/// Blocking reader of kernel-timestamped PPS assert events.
pub struct KernelPps {
    file: File,
    last_sequence: Option<u32>,
}

impl KernelPps {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open PPS device {}", path.display()))?;
        info!("[PPS] Using kernel PPS device {}", path.display());
        Ok(KernelPps {
            file,
            last_sequence: None,
        })
    }

    /// Wait up to `timeout` for the next assert edge and return its kernel
    /// (CLOCK_REALTIME) timestamp, or `None` if no new edge arrived.
    pub fn fetch(&mut self, timeout: Duration) -> Result<Option<SystemTime>> {
        let mut data = PpsFdata {
            timeout: PpsKtime {
                sec: timeout.as_secs() as i64,
                nsec: timeout.subsec_nanos() as i32,
                flags: 0,
            },
            ..PpsFdata::default()
        };

        let result = unsafe {
            libc::ioctl(self.file.as_raw_fd(), PPS_FETCH as _, &mut data as *mut PpsFdata)
        };
        if result < 0 {
            return match Errno::last() {
                Errno::ETIMEDOUT | Errno::EINTR => Ok(None),
                e => Err(anyhow!("PPS_FETCH failed: {}", e)),
            };
        }

        let sequence = data.info.assert_sequence;
        if self.last_sequence == Some(sequence) {
            return Ok(None);
        }
        self.last_sequence = Some(sequence);
        Ok(data.info.assert_tu.to_system_time())
    }
}

/// Map a realtime edge timestamp onto the tick counter by measuring how long
/// ago it happened.
pub fn edge_ticks<C: TickCounter + ?Sized>(counter: &C, edge: SystemTime) -> u64 {
    let now_ticks = counter.ticks();
    let age = SystemTime::now().duration_since(edge).unwrap_or_default();
    let age_ticks = age.as_nanos() * counter.nominal_hz() as u128 / 1_000_000_000;
    now_ticks.saturating_sub(age_ticks.min(u64::MAX as u128) as u64)
}

/// Edge thread: the hosted stand-in for the PPS interrupt.
pub fn run<C: TickCounter + ?Sized>(
    mut device: KernelPps,
    counter: Arc<C>,
    capture: Arc<PpsCapture>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match device.fetch(Duration::from_secs(1)) {
            Ok(Some(edge)) => capture.on_edge(edge_ticks(counter.as_ref(), edge)),
            Ok(None) => debug!("[PPS] No edge within 1 s"),
            Err(e) => {
                warn!("[PPS] {}", e);
                std::thread::sleep(Duration::from_millis(500));
            }
        }
    }
    info!("[PPS] Edge reader shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTicks;

    #[test]
    fn test_fdata_layout() {
        assert_eq!(std::mem::size_of::<PpsKtime>(), 16);
        assert_eq!(std::mem::size_of::<PpsKinfo>(), 48);
        assert_eq!(std::mem::size_of::<PpsFdata>(), 64);
    }

    #[test]
    fn test_fetch_request_code() {
        #[cfg(target_pointer_width = "64")]
        assert_eq!(PPS_FETCH as u32, 0xc008_70a4);
        #[cfg(target_pointer_width = "32")]
        assert_eq!(PPS_FETCH as u32, 0xc004_70a4);
    }

    #[test]
    fn test_ktime_conversion() {
        let kt = PpsKtime { sec: 1_700_000_000, nsec: 500_000_000, flags: 0 };
        let t = kt.to_system_time().unwrap();
        assert_eq!(
            t.duration_since(UNIX_EPOCH).unwrap(),
            Duration::new(1_700_000_000, 500_000_000)
        );
        assert!(PpsKtime::default().to_system_time().is_none());
    }

    #[test]
    fn test_edge_ticks_subtracts_age() {
        let counter = ManualTicks::new(1_000_000_000);
        counter.set(10_000_000_000);
        let edge = SystemTime::now() - Duration::from_millis(200);
        let ticks = edge_ticks(&counter, edge);
        // 200 ms ago, plus whatever elapsed between the two clock reads.
        assert!(ticks <= 9_800_000_000);
        assert!(ticks > 9_700_000_000);
    }

    #[test]
    fn test_open_missing_device() {
        assert!(KernelPps::open(Path::new("/dev/pps-does-not-exist")).is_err());
    }
}
