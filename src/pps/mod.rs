//! PPS edge capture.
//!
//! [`PpsCapture::on_edge`] runs in interrupt context (or the thread standing
//! in for it): it does a fixed amount of work, never blocks, and hands one
//! [`PpsSample`] per edge to the discipline controller through a single-slot
//! [`PpsMailbox`]. A sample that has not been taken yet is overwritten by
//! the next edge.

use log::debug;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};
use std::time::Duration;

use crate::gps::GpsEvent;

#[cfg(target_os = "linux")]
pub mod linux;

const NO_SECOND: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsSample {
    pub capture_ticks: u64,
    /// UTC second (Unix) that this edge marks, if GPS labelled it.
    pub gps_second: Option<u64>,
}

/// Two words published together under a sequence counter.
///
/// One writer only. The counter is odd while a write is in progress;
/// [`read`](Self::read) retries until it sees the same even value before
/// and after, [`try_read`](Self::try_read) makes a single attempt.
struct SeqPair {
    seq: AtomicU64,
    a: AtomicU64,
    b: AtomicU64,
}

impl SeqPair {
    const fn new() -> Self {
        SeqPair {
            seq: AtomicU64::new(0),
            a: AtomicU64::new(0),
            b: AtomicU64::new(0),
        }
    }

    fn write(&self, a: u64, b: u64) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.a.store(a, Ordering::Relaxed);
        self.b.store(b, Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Returns `(seq, a, b)`; `seq == 0` means never written.
    fn read(&self) -> (u64, u64, u64) {
        loop {
            match self.try_read() {
                Some(read) => return read,
                None => std::hint::spin_loop(),
            }
        }
    }

    /// Like [`read`](Self::read), but `None` if a write is in progress or
    /// lands during the read. Bounded, for the edge handler: it may have
    /// preempted the writer, which cannot finish until the handler returns.
    fn try_read(&self) -> Option<(u64, u64, u64)> {
        let before = self.seq.load(Ordering::Acquire);
        if before & 1 == 1 {
            return None;
        }
        let a = self.a.load(Ordering::Relaxed);
        let b = self.b.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        (self.seq.load(Ordering::Relaxed) == before).then_some((before, a, b))
    }
}

/// Single-slot, latest-wins handoff from the edge handler to the controller.
pub struct PpsMailbox {
    slot: SeqPair,
    taken: AtomicU64,
    missed: AtomicU64,
    consumer: OnceLock<Thread>,
}

impl PpsMailbox {
    pub fn new() -> Self {
        PpsMailbox {
            slot: SeqPair::new(),
            taken: AtomicU64::new(0),
            missed: AtomicU64::new(0),
            consumer: OnceLock::new(),
        }
    }

    /// Register the calling thread as the one woken by [`post`](Self::post).
    pub fn register_consumer(&self) {
        let _ = self.consumer.set(thread::current());
    }

    /// Producer side. O(1), never blocks.
    pub fn post(&self, sample: PpsSample) {
        self.slot
            .write(sample.capture_ticks, sample.gps_second.unwrap_or(NO_SECOND));
        if let Some(consumer) = self.consumer.get() {
            consumer.unpark();
        }
    }

    /// Consumer side: the newest sample not yet taken.
    pub fn take(&self) -> Option<PpsSample> {
        let (seq, ticks, second) = self.slot.read();
        let taken = self.taken.load(Ordering::Relaxed);
        if seq == taken {
            return None;
        }
        let skipped = seq.wrapping_sub(taken) / 2 - 1;
        if skipped > 0 {
            self.missed.fetch_add(skipped, Ordering::Relaxed);
            debug!("[PPS] {} edge(s) overwritten before they were taken", skipped);
        }
        self.taken.store(seq, Ordering::Relaxed);
        Some(PpsSample {
            capture_ticks: ticks,
            gps_second: (second != NO_SECOND).then_some(second),
        })
    }

    /// Park the consumer until a post or the timeout.
    pub fn wait(&self, timeout: Duration) {
        thread::park_timeout(timeout);
    }

    pub fn missed(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }
}

impl Default for PpsMailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Pairs PPS edges with GPS time messages.
///
/// A GPS message names the UTC second of the edge that preceded it. It
/// counts only if it arrived within `window_ticks` after that edge; the next
/// edge is then labelled with the following second. Without such a message
/// the edge is still posted, unlabelled, as a free-running reference.
pub struct PpsCapture {
    mailbox: Arc<PpsMailbox>,
    gps: SeqPair,
    last_edge: AtomicU64,
    edges: AtomicU64,
    window_ticks: u64,
}

impl PpsCapture {
    pub fn new(mailbox: Arc<PpsMailbox>, window_ticks: u64) -> Self {
        PpsCapture {
            mailbox,
            gps: SeqPair::new(),
            last_edge: AtomicU64::new(0),
            edges: AtomicU64::new(0),
            window_ticks,
        }
    }

    /// GPS collaborator side. `arrival_ticks` is the tick count when the
    /// decoded message became available.
    pub fn gps_event(&self, event: GpsEvent, arrival_ticks: u64) {
        if !event.pps_correlated {
            debug!("[PPS] GPS second {} not PPS-correlated, ignored", event.utc_second);
            return;
        }
        self.gps.write(event.utc_second, arrival_ticks);
    }

    /// Edge handler. Reads only atomics, never waits, and posts one sample.
    /// An edge that lands while a GPS message is being stored goes out
    /// unlabelled.
    pub fn on_edge(&self, capture_ticks: u64) {
        let edges = self.edges.fetch_add(1, Ordering::Relaxed);
        let prev_edge = self.last_edge.swap(capture_ticks, Ordering::Relaxed);

        let mut gps_second = None;
        if let Some((seq, second, arrival)) = self.gps.try_read() {
            if seq != 0 && edges > 0 {
                let after_prev = arrival >= prev_edge && arrival - prev_edge <= self.window_ticks;
                if after_prev && arrival < capture_ticks {
                    gps_second = Some(second + 1);
                }
            }
        }

        self.mailbox.post(PpsSample {
            capture_ticks,
            gps_second,
        });
    }

    pub fn edge_count(&self) -> u64 {
        self.edges.load(Ordering::Relaxed)
    }
}
