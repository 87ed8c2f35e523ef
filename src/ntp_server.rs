//! LAN-facing NTP server.
//!
//! Answers client-mode requests with server-mode replies stamped from the
//! disciplined clock. Stratum, precision, dispersion, reference id and leap
//! indicator all come from the same clock reading, so a reply always
//! describes the state the time was read from.
//!
//! Requests that are short, not client mode, or of an unsupported version
//! get no reply at all. A reply is never larger than the request, which
//! keeps the server useless as a reflection amplifier.

use anyhow::Result;
use log::{debug, error, info};
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{SharedClock, TickCounter};
use crate::ntp::{NtpPacket, MODE_CLIENT, MODE_SERVER, NTP_PACKET_SIZE};

pub struct NtpServer<C: TickCounter + ?Sized> {
    socket: UdpSocket,
    clock: Arc<SharedClock>,
    counter: Arc<C>,
}

impl<C: TickCounter + ?Sized> NtpServer<C> {
    /// `socket` should carry a read timeout so the loop can notice shutdown
    /// (see [`crate::net::create_server_socket`]).
    pub fn new(socket: UdpSocket, clock: Arc<SharedClock>, counter: Arc<C>) -> Self {
        NtpServer {
            socket,
            clock,
            counter,
        }
    }

    /// Run the server loop until the running flag is cleared.
    pub fn run(&self, running: Arc<AtomicBool>) -> Result<()> {
        if let Ok(addr) = self.socket.local_addr() {
            info!("[NTP-Server] Listening on {}", addr);
        }
        let mut buf = [0u8; 512];
        let mut served = 0u64;

        while running.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buf) {
                Ok((size, src)) => {
                    let rx_ticks = self.counter.ticks();
                    let Some(reply) = self.respond(&buf[..size], rx_ticks) else {
                        debug!("[NTP-Server] Ignoring {}-byte datagram from {}", size, src);
                        continue;
                    };
                    match self.socket.send_to(&reply, src) {
                        Ok(_) => {
                            served += 1;
                            debug!("[NTP-Server] Responded to {} (#{})", src, served);
                        }
                        Err(e) => debug!("[NTP-Server] Send to {} failed: {}", src, e),
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => {
                    error!("[NTP-Server] Socket error: {}", e);
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }

        info!("[NTP-Server] Shutting down after {} replies", served);
        Ok(())
    }

    /// Reply to one request received at `rx_ticks`, or `None` to drop it.
    /// The transmit timestamp is read as late as possible.
    pub fn respond(&self, request: &[u8], rx_ticks: u64) -> Option<[u8; NTP_PACKET_SIZE]> {
        let request = NtpPacket::parse(request).ok()?;
        if request.mode != MODE_CLIENT || !(3..=4).contains(&request.version) {
            return None;
        }

        let received = self.clock.now(rx_ticks);
        let mut reply = NtpPacket {
            leap: received.leap,
            version: request.version,
            mode: MODE_SERVER,
            stratum: received.stratum,
            poll: request.poll,
            precision: received.precision,
            root_delay: received.root_delay,
            root_dispersion: received.root_dispersion,
            reference_id: received.reference_id,
            reference_ts: received.reference_ts,
            origin_ts: request.transmit_ts,
            receive_ts: received.timestamp(),
            transmit_ts: received.timestamp(),
        };

        let transmit = self.clock.now(self.counter.ticks());
        reply.transmit_ts = transmit.timestamp();
        Some(reply.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockMode, ClockState, ManualTicks, TimeSource};
    use crate::ntp::{NtpTimestamp, LEAP_ALARM, LEAP_NONE, REF_ID_GPS, REF_ID_INIT, STRATUM_UNSYNCHRONIZED};

    const HZ: u32 = 1_000_000;
    const T0: u64 = 1_700_000_000;

    fn gps_clock() -> Arc<SharedClock> {
        let mut state = ClockState::unsynchronized(0, HZ);
        state.anchor_epoch = T0;
        state.mode = ClockMode::Synchronized(TimeSource::Gps);
        state.last_pps_ticks = Some(0);
        state.stratum = 1;
        state.reference_id = REF_ID_GPS;
        state.reference_epoch = T0;
        state.base_dispersion_us = 1;
        Arc::new(SharedClock::new(state))
    }

    fn server(clock: Arc<SharedClock>, counter: Arc<ManualTicks>) -> NtpServer<ManualTicks> {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        NtpServer::new(socket, clock, counter)
    }

    fn request(version: u8) -> NtpPacket {
        let mut packet = NtpPacket::client_request(6, NtpTimestamp { seconds: 0xDEAD_BEEF, fraction: 42 });
        packet.version = version;
        packet
    }

    #[test]
    fn test_reply_fields_from_gps_clock() {
        let counter = Arc::new(ManualTicks::new(HZ));
        counter.set(HZ as u64 / 4);
        let server = server(gps_clock(), counter.clone());

        let reply = server.respond(&request(4).to_bytes(), HZ as u64 / 4).unwrap();
        let reply = NtpPacket::parse(&reply).unwrap();

        assert_eq!(reply.mode, MODE_SERVER);
        assert_eq!(reply.version, 4);
        assert_eq!(reply.leap, LEAP_NONE);
        assert_eq!(reply.stratum, 1);
        assert_eq!(reply.poll, 6);
        assert_eq!(reply.precision, -19);
        assert_eq!(reply.reference_id, REF_ID_GPS);
        assert_eq!(reply.reference_ts, NtpTimestamp::from_epoch(T0, 0));
        assert_eq!(reply.origin_ts, NtpTimestamp { seconds: 0xDEAD_BEEF, fraction: 42 });
        assert_eq!(reply.receive_ts, NtpTimestamp::from_epoch(T0, 1 << 30));
        assert_eq!(reply.transmit_ts, reply.receive_ts);
    }

    #[test]
    fn test_transmit_read_after_receive() {
        let counter = Arc::new(ManualTicks::new(HZ));
        counter.set(HZ as u64 / 2);
        let server = server(gps_clock(), counter);

        // Request arrived a quarter second before the reply is built.
        let reply = server.respond(&request(4).to_bytes(), HZ as u64 / 4).unwrap();
        let reply = NtpPacket::parse(&reply).unwrap();
        assert_eq!(reply.receive_ts, NtpTimestamp::from_epoch(T0, 1 << 30));
        assert_eq!(reply.transmit_ts, NtpTimestamp::from_epoch(T0, 1 << 31));
    }

    #[test]
    fn test_unsynchronized_reply_flags_alarm() {
        let counter = Arc::new(ManualTicks::new(HZ));
        let clock = Arc::new(SharedClock::new(ClockState::unsynchronized(0, HZ)));
        let server = server(clock, counter);

        let reply = NtpPacket::parse(&server.respond(&request(4).to_bytes(), 0).unwrap()).unwrap();
        assert_eq!(reply.leap, LEAP_ALARM);
        assert_eq!(reply.stratum, STRATUM_UNSYNCHRONIZED);
        assert_eq!(reply.reference_id, REF_ID_INIT);
        assert!(reply.reference_ts.is_zero());
    }

    #[test]
    fn test_short_request_discarded() {
        let counter = Arc::new(ManualTicks::new(HZ));
        let server = server(gps_clock(), counter);
        let bytes = request(4).to_bytes();
        assert_eq!(server.respond(&bytes[..20], 0), None);
        assert_eq!(server.respond(&[], 0), None);
    }

    #[test]
    fn test_non_client_and_bad_version_discarded() {
        let counter = Arc::new(ManualTicks::new(HZ));
        let server = server(gps_clock(), counter);

        let mut not_client = request(4);
        not_client.mode = MODE_SERVER;
        assert_eq!(server.respond(&not_client.to_bytes(), 0), None);

        assert_eq!(server.respond(&request(2).to_bytes(), 0), None);
        assert_eq!(server.respond(&request(5).to_bytes(), 0), None);

        let reply = server.respond(&request(3).to_bytes(), 0).unwrap();
        assert_eq!(NtpPacket::parse(&reply).unwrap().version, 3);
    }

    #[test]
    fn test_udp_loop_answers_and_drops() {
        let counter = Arc::new(ManualTicks::new(HZ));
        let server = server(gps_clock(), counter);
        let addr = server.socket.local_addr().unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let stop = running.clone();
        let handle = std::thread::spawn(move || server.run(running));

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
        let mut buf = [0u8; 512];

        client.send_to(&request(4).to_bytes()[..20], addr).unwrap();
        assert!(client.recv_from(&mut buf).is_err(), "short request must get no reply");

        client.send_to(&request(4).to_bytes(), addr).unwrap();
        let (size, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(size, NTP_PACKET_SIZE);
        assert_eq!(NtpPacket::parse(&buf[..size]).unwrap().stratum, 1);

        stop.store(false, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
    }
}
