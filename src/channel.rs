//! One analog half of a device.

use std::fmt;

use crate::device::Device;
use crate::error::Result;
use crate::signal::{Mode, SignalInfo, Waveform};
use crate::ChannelId;

/// A view onto channel A or B of a [`Device`]. It holds a handle to the
/// device, so it stays usable for as long as the caller keeps it.
#[derive(Clone)]
pub struct Channel {
    device: Device,
    id: ChannelId,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({} {})", self.device.serial(), self.id.label())
    }
}

impl Channel {
    pub(crate) fn new(device: Device, id: ChannelId) -> Channel {
        Channel { device, id }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn label(&self) -> &'static str {
        self.id.label()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn mode(&self) -> Mode {
        self.device.mode(self.id)
    }

    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        self.device.set_mode(self.id, mode)
    }

    /// Sets the mode from a token handed out by [`Mode::token`].
    pub fn set_mode_token(&self, token: u32) -> Result<()> {
        self.set_mode(Mode::from_token(token)?)
    }

    pub fn signal(&self) -> SignalInfo {
        self.device.signal(self.id)
    }

    pub fn write(&self, values: &[f32], cyclic: bool) -> Result<()> {
        self.device.write(values, self.id, cyclic)
    }

    /// Runs the device for `n` samples and keeps this channel's
    /// `[voltage, current]` pairs.
    pub fn get_samples(&self, n: usize) -> Result<Vec<[f32; 2]>> {
        let samples = self.device.get_samples(n)?;
        Ok(samples.iter().map(|s| s.channel(self.id)).collect())
    }

    /// Generates one cycle of `waveform` and replays it until replaced.
    pub fn source(&self, waveform: Waveform) -> Result<()> {
        let cycle = waveform.generate(waveform.cycle_len())?;
        self.write(&cycle, true)
    }

    pub fn constant(&self, value: f32) -> Result<()> {
        self.source(Waveform::Constant(value))
    }

    pub fn square(&self, low: f32, high: f32, period: f64, phase: f64, duty: f64) -> Result<()> {
        self.source(Waveform::Square {
            low,
            high,
            period,
            phase,
            duty,
        })
    }

    pub fn sawtooth(&self, low: f32, high: f32, period: f64, phase: f64) -> Result<()> {
        self.source(Waveform::Sawtooth { low, high, period, phase })
    }

    pub fn stairstep(&self, low: f32, high: f32, period: f64, phase: f64) -> Result<()> {
        self.source(Waveform::Stairstep { low, high, period, phase })
    }

    pub fn sine(&self, low: f32, high: f32, period: f64, phase: f64) -> Result<()> {
        self.source(Waveform::Sine { low, high, period, phase })
    }

    pub fn triangle(&self, low: f32, high: f32, period: f64, phase: f64) -> Result<()> {
        self.source(Waveform::Triangle { low, high, period, phase })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::SimulatedBus;
    use crate::device::usb::Transport;
    use crate::error::Error;

    fn channel_a() -> Channel {
        let bus = SimulatedBus::with_devices(1).with_realtime(false);
        let desc = bus.enumerate().unwrap().remove(0);
        Device::probe(&bus, &desc, 1000, false).unwrap().channel(ChannelId::A)
    }

    #[test]
    fn test_mode_tokens() {
        let ch = channel_a();
        ch.set_mode_token(Mode::Svmi.token()).unwrap();
        assert_eq!(ch.mode(), Mode::Svmi);
        let err = ch.set_mode_token(1).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(ch.mode(), Mode::Svmi);
    }

    #[test]
    fn test_signal_follows_mode() {
        let ch = channel_a();
        ch.set_mode(Mode::Simv).unwrap();
        let signal = ch.signal();
        assert_eq!(signal.label, "Current");
        assert_eq!((signal.min, signal.max), (-0.2, 0.2));
        ch.set_mode(Mode::Svmi).unwrap();
        assert_eq!(ch.signal().label, "Voltage");
    }

    #[test]
    fn test_waveform_is_cyclic() {
        let ch = channel_a();
        ch.set_mode(Mode::Svmi).unwrap();
        ch.sine(0.0, 5.0, 100.0, -25.0).unwrap();
        let queues = ch.device().queues();
        assert!(queues.output(ChannelId::A).is_cyclic());
        assert!(!queues.output(ChannelId::B).is_cyclic());
    }

    #[test]
    fn test_bad_waveform_is_rejected_locally() {
        let ch = channel_a();
        assert!(ch.square(0.0, 5.0, 0.0, 0.0, 0.5).is_err());
        assert!(!ch.device().queues().output(ChannelId::A).is_cyclic());
    }

    #[test]
    fn test_get_samples_needs_session() {
        let err = channel_a().get_samples(10).unwrap_err();
        assert_eq!(err.errno(), libc::ENODEV);
    }
}
