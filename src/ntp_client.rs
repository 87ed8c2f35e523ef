//! Upstream NTP pool client.
//!
//! Every cycle re-resolves each pool slot, queries each resolved server once
//! and averages the answers into a single [`NetworkCorrection`] for the
//! discipline controller. The controller decides whether to use it; GPS
//! always takes precedence.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{ClockState, SharedClock, TickCounter};
use crate::config::PoolConfig;
use crate::ntp::{
    reference_id_for, units_to_micros, NtpPacket, NtpTimestamp, TimestampAccumulator,
    LEAP_ALARM, MODE_SERVER, STRATUM_MAX,
};
use crate::traits::NtpTransport;

/// Diagnostics for one pool slot. Only the client task mutates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtpServerEntry {
    pub hostname: String,
    /// `None` when the last resolution failed; not retried until next cycle.
    pub address: Option<SocketAddr>,
    pub last_rtt: Option<Duration>,
    pub last_offset_us: Option<i64>,
    pub consecutive_failures: u8,
}

impl NtpServerEntry {
    fn new(hostname: String) -> Self {
        NtpServerEntry {
            hostname,
            address: None,
            last_rtt: None,
            last_offset_us: None,
            consecutive_failures: 0,
        }
    }

    fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

/// Averaged result of one polling cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCorrection {
    /// Add to local time to get upstream time.
    pub offset_us: i64,
    pub responders: usize,
    pub mean_rtt_us: u64,
    pub max_rtt_us: u64,
    /// Lowest stratum among responders.
    pub upstream_stratum: u8,
    pub reference_id: [u8; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Steady,
    Retry,
}

/// Two-speed poll timing: a long steady interval after a good cycle, a short
/// retry interval after a cycle with no usable responses.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    steady: Duration,
    retry: Duration,
    state: PollState,
}

impl PollSchedule {
    pub fn new(steady: Duration, retry: Duration) -> Self {
        PollSchedule {
            steady,
            retry,
            state: PollState::Retry,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// Record a cycle's outcome and return how long to wait before the next.
    pub fn record(&mut self, success: bool) -> Duration {
        self.state = if success { PollState::Steady } else { PollState::Retry };
        self.interval()
    }

    pub fn interval(&self) -> Duration {
        match self.state {
            PollState::Steady => self.steady,
            PollState::Retry => self.retry,
        }
    }
}

struct ServerSample {
    /// Server time projected onto the cycle's reference instant (32.32).
    signal: u64,
    rtt: Duration,
    offset_us: i64,
    stratum: u8,
}

pub struct NtpClient<T, C>
where
    T: NtpTransport,
    C: TickCounter + ?Sized,
{
    transport: T,
    clock: Arc<SharedClock>,
    counter: Arc<C>,
    config: PoolConfig,
    servers: Vec<NtpServerEntry>,
    schedule: PollSchedule,
}

impl<T, C> NtpClient<T, C>
where
    T: NtpTransport,
    C: TickCounter + ?Sized,
{
    pub fn new(transport: T, clock: Arc<SharedClock>, counter: Arc<C>, config: PoolConfig) -> Self {
        let servers = (0..config.size)
            .map(|i| NtpServerEntry::new(config.hostname(i)))
            .collect();
        let schedule = PollSchedule::new(config.poll_interval(), config.retry_interval());
        NtpClient {
            transport,
            clock,
            counter,
            config,
            servers,
            schedule,
        }
    }

    pub fn servers(&self) -> &[NtpServerEntry] {
        &self.servers
    }

    pub fn schedule(&self) -> &PollSchedule {
        &self.schedule
    }

    /// One full polling cycle. `None` when no server gave a usable reply.
    pub fn run_cycle(&mut self) -> Option<NetworkCorrection> {
        for entry in self.servers.iter_mut() {
            match self.transport.resolve(&entry.hostname) {
                Ok(addr) => entry.address = Some(addr),
                Err(e) => {
                    warn!("[NTP-Client] {}: {}", entry.hostname, e);
                    entry.address = None;
                }
            }
        }

        // Every local time in this cycle comes from one snapshot, so a
        // concurrent re-anchor cannot skew the per-server projections.
        let state = self.clock.snapshot();
        let ref_ticks = self.counter.ticks();
        let local_ref = state.epoch_units(ref_ticks);

        let mut accumulator = TimestampAccumulator::new(self.servers.len());
        let mut rtt_sum_us = 0u64;
        let mut max_rtt_us = 0u64;
        let mut upstream_stratum = STRATUM_MAX;
        let mut reference_id = None;

        for index in 0..self.servers.len() {
            let Some(addr) = self.servers[index].address else {
                continue;
            };
            match self.query(addr, &state, local_ref) {
                Ok(sample) => {
                    let entry = &mut self.servers[index];
                    info!(
                        "[NTP-Client] {} ({}) rtt={}us offset={:+}us stratum={}",
                        entry.hostname,
                        addr,
                        sample.rtt.as_micros(),
                        sample.offset_us,
                        sample.stratum
                    );
                    entry.last_rtt = Some(sample.rtt);
                    entry.last_offset_us = Some(sample.offset_us);
                    entry.consecutive_failures = 0;

                    if accumulator.add(sample.signal).is_err() {
                        continue;
                    }
                    let rtt_us = sample.rtt.as_micros() as u64;
                    rtt_sum_us += rtt_us;
                    max_rtt_us = max_rtt_us.max(rtt_us);
                    upstream_stratum = upstream_stratum.min(sample.stratum);
                    if reference_id.is_none() {
                        reference_id = Some(reference_id_for(addr.ip()));
                    }
                }
                Err(e) => {
                    let entry = &mut self.servers[index];
                    entry.record_failure();
                    info!(
                        "[NTP-Client] {} ({}) failed: {} ({} in a row)",
                        entry.hostname, addr, e, entry.consecutive_failures
                    );
                }
            }
        }

        let responders = accumulator.count();
        let Some(mean) = accumulator.mean() else {
            warn!("[NTP-Client] No server responded; no correction this cycle");
            return None;
        };

        let correction = NetworkCorrection {
            offset_us: units_to_micros(mean as i128 - local_ref),
            responders,
            mean_rtt_us: rtt_sum_us / responders as u64,
            max_rtt_us,
            upstream_stratum,
            reference_id: reference_id.unwrap_or([0; 4]),
        };
        info!(
            "[NTP-Client] {}/{} servers responded, offset {:+}us, mean rtt {}us",
            responders,
            self.servers.len(),
            correction.offset_us,
            correction.mean_rtt_us
        );
        Some(correction)
    }

    fn query(&mut self, addr: SocketAddr, state: &ClockState, local_ref: i128) -> Result<ServerSample> {
        let send_ticks = self.counter.ticks();
        let origin = NtpTimestamp::from_epoch_units(clamp_units(state.epoch_units(send_ticks)));
        let request = NtpPacket::client_request(self.config.poll_exponent as i8, origin);

        self.transport.send(addr, &request.to_bytes())?;

        let timeout = self.config.query_timeout();
        let started = Instant::now();
        let reply = loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(anyhow!("timed out after {:?}", timeout));
            }
            let Some(bytes) = self.transport.recv(remaining)? else {
                return Err(anyhow!("timed out after {:?}", timeout));
            };
            match validate_reply(&bytes, origin) {
                Ok(packet) => break packet,
                Err(e) => debug!("[NTP-Client] Discarding reply from {}: {}", addr, e),
            }
        };
        let rx_ticks = self.counter.ticks();

        let rtt = state.ticks_to_duration(rx_ticks.saturating_sub(send_ticks));
        let half_rtt = (rtt.as_nanos() << 31) as i128 / 1_000_000_000;
        let server_units = reply.transmit_ts.to_epoch_units() as i128 + half_rtt;
        let local_rx = state.epoch_units(rx_ticks);

        let signal = server_units - (local_rx - local_ref);
        if signal < 0 || signal > u64::MAX as i128 {
            return Err(anyhow!("implausible server time"));
        }

        Ok(ServerSample {
            signal: signal as u64,
            rtt,
            offset_us: units_to_micros(server_units - local_rx),
            stratum: reply.stratum,
        })
    }

    /// Client task: poll forever on the two-speed schedule, sending every
    /// correction to the controller.
    pub fn run(mut self, sink: Sender<NetworkCorrection>, running: Arc<AtomicBool>) {
        info!(
            "[NTP-Client] Polling {} servers from {:?} (every {:?}, retry {:?})",
            self.servers.len(),
            self.config.host_template,
            self.config.poll_interval(),
            self.config.retry_interval()
        );

        while running.load(Ordering::SeqCst) {
            let correction = self.run_cycle();
            let interval = self.schedule.record(correction.is_some());
            if let Some(correction) = correction {
                if sink.send(correction).is_err() {
                    warn!("[NTP-Client] Controller gone, stopping");
                    break;
                }
            }
            debug!("[NTP-Client] Next cycle in {:?} ({:?})", interval, self.schedule.state());
            sleep_while_running(interval, &running);
        }

        info!("[NTP-Client] Shutting down");
    }
}

/// Reject anything that is not a sane server reply to our request.
fn validate_reply(bytes: &[u8], origin: NtpTimestamp) -> Result<NtpPacket> {
    let packet = NtpPacket::parse(bytes)?;
    if packet.mode != MODE_SERVER {
        return Err(anyhow!("mode {} is not server", packet.mode));
    }
    if !(3..=4).contains(&packet.version) {
        return Err(anyhow!("unsupported version {}", packet.version));
    }
    if packet.leap == LEAP_ALARM {
        return Err(anyhow!("server not synchronized"));
    }
    if packet.stratum == 0 || packet.stratum > STRATUM_MAX {
        return Err(anyhow!("stratum {}", packet.stratum));
    }
    if packet.origin_ts != origin {
        return Err(anyhow!("origin timestamp does not match request"));
    }
    if packet.transmit_ts.is_zero() {
        return Err(anyhow!("zero transmit timestamp"));
    }
    Ok(packet)
}

fn clamp_units(units: i128) -> u64 {
    units.clamp(0, u64::MAX as i128) as u64
}

fn sleep_while_running(total: Duration, running: &AtomicBool) {
    let step = Duration::from_millis(200);
    let started = Instant::now();
    while running.load(Ordering::SeqCst) {
        let remaining = total.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            break;
        }
        std::thread::sleep(remaining.min(step));
    }
}
