//! Sample encoding and timing for the M1000 bulk stream.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use crate::signal::{CURRENT, VOLTAGE};
use crate::CHUNK_SIZE;

/// Firmware string reported by the initial production run.
pub const REV0_FIRMWARE: &str = "023314a*";

pub const TIMER_CLOCK_HZ: f64 = 48e6;
pub const REV0_TIMER_CLOCK_HZ: f64 = 3e6;

pub const DEFAULT_RATE: u32 = 100_000;
pub const REV0_DEFAULT_RATE: u32 = 62_500;

pub const MAX_SAMPLE_PERIOD: u16 = u16::MAX;

/// Output code that parks a channel in high impedance.
pub const HI_Z_CODE: u16 = 26214;

pub const OUT_SAMPLE_BYTES: usize = 4;
pub const IN_SAMPLE_BYTES: usize = 8;

/// Amount of signal buffered by one transfer pair, in seconds.
const BUFFER_TIME: f64 = 0.020;
const TRANSFERS: f64 = 2.0;

/// Firmware version compared numerically, so "2.10" is newer than "2.06".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> FirmwareVersion {
        FirmwareVersion { major, minor, patch }
    }

    /// Parses the leading digits of each dot-separated part. Missing or
    /// non-numeric parts count as zero.
    pub fn parse(s: &str) -> FirmwareVersion {
        let mut parts = s.trim().split('.').map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().unwrap_or(0)
        });
        FirmwareVersion {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
        }
    }

    /// Firmware 2.0 and newer interleave the signals of each sample.
    pub fn interleaved(&self) -> bool {
        self.major >= 2
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.patch == 0 {
            write!(f, "{}.{:02}", self.major, self.minor)
        } else {
            write!(f, "{}.{:02}.{}", self.major, self.minor, self.patch)
        }
    }
}

/// Sampling parameters derived from a requested rate.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Timing {
    pub clock: f64,
    /// Timer period programmed into the device.
    pub sam_per: u16,
    /// Rate the device actually runs at.
    pub rate: u32,
    pub packets_per_transfer: usize,
    /// How long a blocked writer may wait for queue space.
    pub write_timeout: Duration,
}

impl Timing {
    /// Quantizes `requested` to the nearest rate the timer can produce.
    /// Zero picks the firmware's default rate.
    pub fn new(requested: u32, firmware: &str) -> Timing {
        let rev0 = firmware == REV0_FIRMWARE;
        let (clock, default_rate) = if rev0 {
            (REV0_TIMER_CLOCK_HZ, REV0_DEFAULT_RATE)
        } else {
            (TIMER_CLOCK_HZ, DEFAULT_RATE)
        };
        let requested = if requested == 0 { default_rate } else { requested };
        let min_per = clock / (2.0 * f64::from(default_rate));

        let sam_per = ((clock / f64::from(requested)).round() / 2.0)
            .max(min_per)
            .min(f64::from(MAX_SAMPLE_PERIOD))
            .trunc();
        let sample_time = sam_per / clock;
        let rate = (1.0 / sample_time / 2.0).round() as u32;
        let packets = (BUFFER_TIME / (sample_time * CHUNK_SIZE as f64) / TRANSFERS).ceil() as usize;

        Timing {
            clock,
            sam_per: sam_per as u16,
            rate,
            packets_per_transfer: packets.max(1),
            write_timeout: Duration::from_millis((1e7 / f64::from(rate)) as u64),
        }
    }

    pub fn samples_per_transfer(&self) -> usize {
        self.packets_per_transfer * CHUNK_SIZE
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.rate))
    }
}

fn clamp_code(code: f32) -> u16 {
    code.max(0.0).min(65535.0) as u16
}

pub fn voltage_code(v: f32) -> u16 {
    clamp_code(v / VOLTAGE.resolution as f32)
}

pub fn current_code(i: f32) -> u16 {
    clamp_code(65536.0 * (0.4 + 1.6 * i))
}

pub fn decode_voltage(code: u16) -> f32 {
    (f64::from(code) * VOLTAGE.resolution) as f32
}

pub fn decode_current(code: u16) -> f32 {
    ((f64::from(code) * CURRENT.resolution - 0.195) * 1.25) as f32
}

/// Inverse of [`decode_current`], used by devices that synthesize readings.
pub fn measured_current_code(i: f32) -> u16 {
    clamp_code(((f64::from(i) / 1.25 + 0.195) / CURRENT.resolution) as f32)
}

/// Inverse of [`current_code`].
pub fn sourced_current(code: u16) -> f32 {
    (f32::from(code) / 65536.0 - 0.4) / 1.6
}

fn put(buf: &mut [u8], at: usize, code: u16) {
    buf[at..at + 2].copy_from_slice(&code.to_be_bytes());
}

fn get(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

/// Packs `[A, B]` output codes into OUT packets.
pub fn encode_out(codes: &[[u16; 2]], interleaved: bool) -> Vec<u8> {
    let mut buf = vec![0u8; codes.len() * OUT_SAMPLE_BYTES];
    let mut base = 0;
    for packet in codes.chunks(CHUNK_SIZE) {
        let n = packet.len();
        for (i, pair) in packet.iter().enumerate() {
            for (c, &code) in pair.iter().enumerate() {
                let at = if interleaved { (i * 2 + c) * 2 } else { (c * n + i) * 2 };
                put(&mut buf, base + at, code);
            }
        }
        base += n * OUT_SAMPLE_BYTES;
    }
    buf
}

pub fn decode_out(buf: &[u8], interleaved: bool) -> Vec<[u16; 2]> {
    let mut codes = Vec::with_capacity(buf.len() / OUT_SAMPLE_BYTES);
    for packet in buf.chunks(CHUNK_SIZE * OUT_SAMPLE_BYTES) {
        let n = packet.len() / OUT_SAMPLE_BYTES;
        for i in 0..n {
            let mut pair = [0u16; 2];
            for (c, code) in pair.iter_mut().enumerate() {
                let at = if interleaved { (i * 2 + c) * 2 } else { (c * n + i) * 2 };
                *code = get(packet, at);
            }
            codes.push(pair);
        }
    }
    codes
}

/// Packs raw ADC readings `[A V, A I, B V, B I]` into IN packets.
pub fn encode_in(codes: &[[u16; 4]], interleaved: bool) -> Vec<u8> {
    let mut buf = vec![0u8; codes.len() * IN_SAMPLE_BYTES];
    let mut base = 0;
    for packet in codes.chunks(CHUNK_SIZE) {
        let n = packet.len();
        for (i, sample) in packet.iter().enumerate() {
            for (s, &code) in sample.iter().enumerate() {
                let at = if interleaved { (i * 4 + s) * 2 } else { (s * n + i) * 2 };
                put(&mut buf, base + at, code);
            }
        }
        base += n * IN_SAMPLE_BYTES;
    }
    buf
}

pub fn decode_in(buf: &[u8], interleaved: bool) -> Vec<[u16; 4]> {
    let mut codes = Vec::with_capacity(buf.len() / IN_SAMPLE_BYTES);
    for packet in buf.chunks(CHUNK_SIZE * IN_SAMPLE_BYTES) {
        let n = packet.len() / IN_SAMPLE_BYTES;
        for i in 0..n {
            let mut sample = [0u16; 4];
            for (s, code) in sample.iter_mut().enumerate() {
                let at = if interleaved { (i * 4 + s) * 2 } else { (s * n + i) * 2 };
                *code = get(packet, at);
            }
            codes.push(sample);
        }
    }
    codes
}
