//! NTP wire format (RFC 5905 packet header) and fixed-point timestamp math.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::Cursor;
use std::net::IpAddr;

pub const NTP_PORT: u16 = 123;

/// NTP packet size (48 bytes, no extension fields)
pub const NTP_PACKET_SIZE: usize = 48;

/// Seconds from 1900-01-01 (NTP prime epoch) to 1970-01-01
pub const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

pub const NTP_VERSION: u8 = 4;

pub const MODE_CLIENT: u8 = 3;
pub const MODE_SERVER: u8 = 4;

pub const LEAP_NONE: u8 = 0;
/// Leap indicator 3: clock not synchronized
pub const LEAP_ALARM: u8 = 3;

/// Stratum reported while not synchronized
pub const STRATUM_UNSYNCHRONIZED: u8 = 16;
pub const STRATUM_MAX: u8 = 15;

pub const REF_ID_GPS: [u8; 4] = *b"GPS\0";
pub const REF_ID_INIT: [u8; 4] = *b"INIT";

const FRACTION_SCALE: u128 = 1 << 32;

/// 64-bit NTP timestamp: seconds since 1900 in the upper word, binary
/// fraction of a second in the lower word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    pub const ZERO: NtpTimestamp = NtpTimestamp { seconds: 0, fraction: 0 };

    /// Build from Unix epoch seconds. Seconds wrap into the next NTP era
    /// after 2036-02-07.
    pub fn from_epoch(epoch_secs: u64, fraction: u32) -> Self {
        NtpTimestamp {
            seconds: (epoch_secs + NTP_EPOCH_OFFSET) as u32,
            fraction,
        }
    }

    /// Unix epoch seconds and fraction. Values below the 1970 offset are
    /// taken to be in era 1, which keeps every epoch in `0..2^32` lossless.
    pub fn to_epoch(self) -> (u64, u32) {
        let secs = self.seconds as u64;
        let epoch = if secs >= NTP_EPOCH_OFFSET {
            secs - NTP_EPOCH_OFFSET
        } else {
            secs + (1u64 << 32) - NTP_EPOCH_OFFSET
        };
        (epoch, self.fraction)
    }

    /// From Unix-epoch 32.32 fixed point (seconds in the upper word).
    pub fn from_epoch_units(units: u64) -> Self {
        Self::from_epoch(units >> 32, units as u32)
    }

    pub fn to_epoch_units(self) -> u64 {
        let (secs, fraction) = self.to_epoch();
        secs << 32 | fraction as u64
    }

    pub fn from_bits(bits: u64) -> Self {
        NtpTimestamp {
            seconds: (bits >> 32) as u32,
            fraction: bits as u32,
        }
    }

    pub fn to_bits(self) -> u64 {
        (self.seconds as u64) << 32 | self.fraction as u64
    }

    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    /// Fraction expressed in nanoseconds (truncated).
    pub fn subsec_nanos(self) -> u32 {
        ((self.fraction as u64 * 1_000_000_000) >> 32) as u32
    }

    /// Convert nanoseconds (< 1s) to a binary fraction, rounding down.
    pub fn fraction_from_nanos(nanos: u32) -> u32 {
        (((nanos as u64) << 32) / 1_000_000_000) as u32
    }
}

/// Convert a 32.32 fixed-point difference to microseconds, rounding to nearest.
pub fn units_to_micros(units: i128) -> i64 {
    let scaled = units * 1_000_000;
    let half = (FRACTION_SCALE / 2) as i128;
    let rounded = if scaled >= 0 {
        (scaled + half) >> 32
    } else {
        -((-scaled + half) >> 32)
    };
    rounded as i64
}

pub fn micros_to_units(micros: i64) -> i128 {
    ((micros as i128) << 32) / 1_000_000
}

/// 32-bit NTP short format (16.16 seconds), used for root delay/dispersion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpShort(pub u32);

impl NtpShort {
    /// Saturates at the largest representable value (~65536 s).
    pub fn from_micros(micros: u64) -> Self {
        let units = ((micros as u128) << 16) / 1_000_000;
        NtpShort(units.min(u32::MAX as u128) as u32)
    }

    pub fn to_micros(self) -> u64 {
        ((self.0 as u64) * 1_000_000) >> 16
    }
}

/// NTP packet header. Built fresh for every request and reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtpPacket {
    pub leap: u8,
    pub version: u8,
    pub mode: u8,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: NtpShort,
    pub root_dispersion: NtpShort,
    pub reference_id: [u8; 4],
    pub reference_ts: NtpTimestamp,
    pub origin_ts: NtpTimestamp,
    pub receive_ts: NtpTimestamp,
    pub transmit_ts: NtpTimestamp,
}

impl NtpPacket {
    /// Client-mode request. `transmit` is echoed back by the server in the
    /// origin field, which lets the caller match the reply.
    pub fn client_request(poll: i8, transmit: NtpTimestamp) -> Self {
        NtpPacket {
            leap: LEAP_NONE,
            version: NTP_VERSION,
            mode: MODE_CLIENT,
            stratum: 0,
            poll,
            precision: 0,
            root_delay: NtpShort::default(),
            root_dispersion: NtpShort::default(),
            reference_id: [0; 4],
            reference_ts: NtpTimestamp::ZERO,
            origin_ts: NtpTimestamp::ZERO,
            receive_ts: NtpTimestamp::ZERO,
            transmit_ts: transmit,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < NTP_PACKET_SIZE {
            return Err(anyhow!("Packet too short for NTP header ({} bytes)", data.len()));
        }
        let mut rdr = Cursor::new(data);

        let li_vn_mode = rdr.read_u8()?;
        let stratum = rdr.read_u8()?;
        let poll = rdr.read_i8()?;
        let precision = rdr.read_i8()?;
        let root_delay = NtpShort(rdr.read_u32::<BigEndian>()?);
        let root_dispersion = NtpShort(rdr.read_u32::<BigEndian>()?);
        let mut reference_id = [0u8; 4];
        for byte in reference_id.iter_mut() {
            *byte = rdr.read_u8()?;
        }

        Ok(NtpPacket {
            leap: li_vn_mode >> 6,
            version: (li_vn_mode >> 3) & 0x07,
            mode: li_vn_mode & 0x07,
            stratum,
            poll,
            precision,
            root_delay,
            root_dispersion,
            reference_id,
            reference_ts: read_timestamp(&mut rdr)?,
            origin_ts: read_timestamp(&mut rdr)?,
            receive_ts: read_timestamp(&mut rdr)?,
            transmit_ts: read_timestamp(&mut rdr)?,
        })
    }

    pub fn to_bytes(&self) -> [u8; NTP_PACKET_SIZE] {
        let mut buf = [0u8; NTP_PACKET_SIZE];

        buf[0] = (self.leap & 0x03) << 6 | (self.version & 0x07) << 3 | (self.mode & 0x07);
        buf[1] = self.stratum;
        buf[2] = self.poll as u8;
        buf[3] = self.precision as u8;
        BigEndian::write_u32(&mut buf[4..8], self.root_delay.0);
        BigEndian::write_u32(&mut buf[8..12], self.root_dispersion.0);
        buf[12..16].copy_from_slice(&self.reference_id);

        let timestamps = [self.reference_ts, self.origin_ts, self.receive_ts, self.transmit_ts];
        for (i, ts) in timestamps.iter().enumerate() {
            let at = 16 + i * 8;
            BigEndian::write_u32(&mut buf[at..at + 4], ts.seconds);
            BigEndian::write_u32(&mut buf[at + 4..at + 8], ts.fraction);
        }

        buf
    }
}

fn read_timestamp(rdr: &mut Cursor<&[u8]>) -> Result<NtpTimestamp> {
    let seconds = rdr.read_u32::<BigEndian>()?;
    let fraction = rdr.read_u32::<BigEndian>()?;
    Ok(NtpTimestamp { seconds, fraction })
}

/// Reference id for an upstream server: its IPv4 address, or the first four
/// bytes of an IPv6 address.
pub fn reference_id_for(addr: IpAddr) -> [u8; 4] {
    match addr {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(v6) => {
            let o = v6.octets();
            [o[0], o[1], o[2], o[3]]
        }
    }
}

/// Averages up to `capacity` 64-bit timestamps without overflow.
///
/// Every value is shifted right by `log2(capacity)` before it is summed, so
/// the sum of `capacity` values always fits in 64 bits. The mean is shifted
/// back up, losing at most `2^shift` units (well under a nanosecond).
#[derive(Debug)]
pub struct TimestampAccumulator {
    shift: u32,
    capacity: usize,
    sum: u64,
    count: usize,
}

impl TimestampAccumulator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        TimestampAccumulator {
            shift: capacity.next_power_of_two().trailing_zeros(),
            capacity,
            sum: 0,
            count: 0,
        }
    }

    pub fn add(&mut self, value: u64) -> Result<()> {
        if self.count >= self.capacity {
            return Err(anyhow!("Accumulator full ({} samples)", self.capacity));
        }
        self.sum += value >> self.shift;
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `None` when nothing was accumulated.
    pub fn mean(&self) -> Option<u64> {
        if self.count == 0 {
            return None;
        }
        Some((self.sum / self.count as u64) << self.shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_ntp_packet_constants() {
        assert_eq!(NTP_PACKET_SIZE, 48);
        assert_eq!(NTP_EPOCH_OFFSET, 2_208_988_800);
        assert_eq!(MODE_SERVER, 4);
        assert_eq!(MODE_CLIENT, 3);
        assert_eq!(&REF_ID_GPS, b"GPS\0");
    }

    #[test]
    fn test_unix_epoch_maps_to_offset() {
        let ts = NtpTimestamp::from_epoch(0, 0);
        assert_eq!(ts.seconds as u64, NTP_EPOCH_OFFSET);
        assert_eq!(ts.to_epoch(), (0, 0));
    }

    #[test]
    fn test_era_rollover() {
        // 2036-02-07T06:28:16Z is the first second of NTP era 1.
        let era1 = (1u64 << 32) - NTP_EPOCH_OFFSET;
        let ts = NtpTimestamp::from_epoch(era1, 7);
        assert_eq!(ts.seconds, 0);
        assert_eq!(ts.to_epoch(), (era1, 7));
    }

    #[test]
    fn test_timestamp_roundtrip_random() {
        let mut rng = rand::rng();
        for _ in 0..10_000 {
            let epoch = rng.random_range(0..(1u64 << 32));
            let fraction: u32 = rng.random();
            let ts = NtpTimestamp::from_epoch(epoch, fraction);
            assert_eq!(ts.to_epoch(), (epoch, fraction));
            assert_eq!(NtpTimestamp::from_bits(ts.to_bits()), ts);
        }
    }

    #[test]
    fn test_fraction_conversion() {
        let half = NtpTimestamp::fraction_from_nanos(500_000_000);
        assert_eq!(half, 1 << 31);
        let quarter = NtpTimestamp::fraction_from_nanos(250_000_000);
        assert_eq!(quarter, 1 << 30);
        let ts = NtpTimestamp { seconds: 0, fraction: half };
        assert_eq!(ts.subsec_nanos(), 500_000_000);
    }

    #[test]
    fn test_micros_units() {
        assert_eq!(units_to_micros(micros_to_units(11_000)), 11_000);
        assert_eq!(units_to_micros(micros_to_units(-12_345)), -12_345);
        assert_eq!(units_to_micros(1i128 << 32), 1_000_000);
        assert_eq!(units_to_micros(-(1i128 << 32)), -1_000_000);
    }

    #[test]
    fn test_short_format() {
        assert_eq!(NtpShort::from_micros(1_000_000).0, 1 << 16);
        assert_eq!(NtpShort::from_micros(u64::MAX).0, u32::MAX);
        assert_eq!(NtpShort(1 << 16).to_micros(), 1_000_000);
    }

    #[test]
    fn test_packet_layout() {
        let mut pkt = NtpPacket::client_request(6, NtpTimestamp { seconds: 0x01020304, fraction: 0x05060708 });
        pkt.stratum = 2;
        pkt.precision = -20;
        pkt.reference_id = *b"LOCL";
        let bytes = pkt.to_bytes();

        assert_eq!(bytes[0], (NTP_VERSION << 3) | MODE_CLIENT);
        assert_eq!(bytes[1], 2);
        assert_eq!(bytes[2], 6);
        assert_eq!(bytes[3], 0xEC);
        assert_eq!(&bytes[12..16], b"LOCL");
        assert_eq!(&bytes[40..48], &[1, 2, 3, 4, 5, 6, 7, 8]);

        assert_eq!(NtpPacket::parse(&bytes).unwrap(), pkt);
    }

    #[test]
    fn test_parse_rejects_short_packet() {
        assert!(NtpPacket::parse(&[0u8; 20]).is_err());
        assert!(NtpPacket::parse(&[0u8; 47]).is_err());
        assert!(NtpPacket::parse(&[0u8; 48]).is_ok());
    }

    #[test]
    fn test_accumulator_mean_of_large_values() {
        // Naive summation of four of these would overflow u64.
        let values = [u64::MAX - 8, u64::MAX - 4, u64::MAX - 12, u64::MAX];
        let mut acc = TimestampAccumulator::new(4);
        for v in values {
            acc.add(v).unwrap();
        }
        let mean = acc.mean().unwrap();
        let exact = (values.iter().map(|&v| v as u128).sum::<u128>() / 4) as u64;
        assert!(exact.abs_diff(mean) < 4, "mean {} exact {}", mean, exact);
    }

    #[test]
    fn test_accumulator_empty_and_full() {
        let mut acc = TimestampAccumulator::new(2);
        assert_eq!(acc.mean(), None);
        acc.add(10u64 << 32).unwrap();
        acc.add(12u64 << 32).unwrap();
        assert!(acc.add(1).is_err());
        assert_eq!(acc.count(), 2);
        assert_eq!(acc.mean(), Some(11u64 << 32));
    }

    #[test]
    fn test_reference_id_for_ipv4() {
        let addr: IpAddr = "192.0.2.7".parse().unwrap();
        assert_eq!(reference_id_for(addr), [192, 0, 2, 7]);
    }
}
