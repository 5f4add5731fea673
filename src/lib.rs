//! Host-side acquisition engine for ADALM1000-class source-measure units.
//!
//! A [`Session`] owns the devices it found on the bus and drives all of them
//! from one acquisition thread, so sample `i` of every device was taken on the
//! same frame. Each [`Device`] has two [`Channel`]s that can source a voltage
//! or a current while measuring the other quantity.

use std::time::Duration;

use log::LevelFilter;
use simplelog::{Config, SimpleLogger, TermLogger, TerminalMode};

mod capi;
pub use capi::*;

pub mod calibration;
pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod firmware;
mod hotplug;
pub mod queue;
pub mod session;
pub mod signal;

pub use calibration::Calibration;
pub use channel::Channel;
pub use config::{RunResetPolicy, SessionConfig};
pub use device::simulated::SimulatedBus;
pub use device::usb::{Transport, UsbDescriptor, UsbHandle};
pub use device::{Device, FirmwareVersion};
pub use error::{Error, Result};
pub use session::{Session, State};
pub use signal::{Mode, SignalInfo, Waveform};

#[cfg(feature = "usb")]
pub use device::libusb::LibusbTransport;

/// Samples carried by one USB packet.
pub const CHUNK_SIZE: usize = 256;

/// Environment variable read by [`init_logging_from_env`].
pub const LOG_ENV: &str = "SMU_LOG";

/// One of the two analog channels of a device.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelId {
    A,
    B,
}

impl ChannelId {
    pub const ALL: [ChannelId; 2] = [ChannelId::A, ChannelId::B];

    pub fn index(self) -> usize {
        match self {
            ChannelId::A => 0,
            ChannelId::B => 1,
        }
    }

    pub fn from_index(index: usize) -> Result<ChannelId> {
        match index {
            0 => Ok(ChannelId::A),
            1 => Ok(ChannelId::B),
            _ => Err(Error::invalid(format!("no channel {}", index))),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChannelId::A => "A",
            ChannelId::B => "B",
        }
    }
}

/// One simultaneous measurement of both channels:
/// `[[A voltage, A current], [B voltage, B current]]`.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug, PartialEq)]
pub struct Sample {
    pub channels: [[f32; 2]; 2],
}

impl Sample {
    pub fn new(a: [f32; 2], b: [f32; 2]) -> Sample {
        Sample { channels: [a, b] }
    }

    pub fn channel(&self, channel: ChannelId) -> [f32; 2] {
        self.channels[channel.index()]
    }

    pub fn voltage(&self, channel: ChannelId) -> f32 {
        self.channels[channel.index()][0]
    }

    pub fn current(&self, channel: ChannelId) -> f32 {
        self.channels[channel.index()][1]
    }
}

/// How long a read may wait for samples to arrive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Timeout {
    NonBlocking,
    Forever,
    After(Duration),
}

impl From<i32> for Timeout {
    /// Negative waits forever, zero never waits, positive is milliseconds.
    fn from(ms: i32) -> Timeout {
        if ms < 0 {
            Timeout::Forever
        } else if ms == 0 {
            Timeout::NonBlocking
        } else {
            Timeout::After(Duration::from_millis(ms as u64))
        }
    }
}

/// Installs the terminal logger, or a plain one when no terminal is attached.
///
/// Returns `false` when a logger was already installed.
pub fn init_logging(level: LevelFilter) -> bool {
    if TermLogger::init(level, Config::default(), TerminalMode::Mixed).is_ok() {
        return true;
    }
    SimpleLogger::init(level, Config::default()).is_ok()
}

/// Same as [`init_logging`], with the level taken from `SMU_LOG`.
/// Defaults to `warn` when the variable is unset or unparseable.
pub fn init_logging_from_env() -> bool {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Warn);
    init_logging(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_from_millis() {
        assert_eq!(Timeout::from(-1), Timeout::Forever);
        assert_eq!(Timeout::from(0), Timeout::NonBlocking);
        assert_eq!(Timeout::from(250), Timeout::After(Duration::from_millis(250)));
    }

    #[test]
    fn test_sample_accessors() {
        let s = Sample::new([1.0, 0.1], [2.0, -0.1]);
        assert_eq!(s.voltage(ChannelId::B), 2.0);
        assert_eq!(s.current(ChannelId::A), 0.1);
        assert_eq!(s.channel(ChannelId::B), [2.0, -0.1]);
    }

    #[test]
    fn test_channel_index() {
        assert_eq!(ChannelId::from_index(1).unwrap(), ChannelId::B);
        assert!(ChannelId::from_index(2).is_err());
    }
}
