//! One M1000 unit: its USB handle, channel configuration and sample queues.
//!
//! [`Device`] is a cheap handle; clones share the same unit. The session's
//! acquisition thread drives the bulk transfers through the crate-private
//! `transfer_out`/`transfer_in` pair while caller threads read and write the
//! queues concurrently.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

pub mod codec;
#[cfg(feature = "usb")]
pub mod libusb;
pub mod simulated;
pub mod usb;

pub use codec::FirmwareVersion;

use self::codec::{Timing, HI_Z_CODE, IN_SAMPLE_BYTES};
use self::usb::{request, Transport, UsbDescriptor, UsbHandle, BULK_TIMEOUT, CONTROL_TIMEOUT, EP_IN, EP_OUT};
use crate::calibration::{Calibration, EEPROM_SIZE};
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::queue::{lock, OutputQueue, SampleQueue};
use crate::session::{Session, Shared};
use crate::signal::{Mode, SignalInfo, CURRENT, VOLTAGE};
use crate::{ChannelId, Sample, Timeout};

/// Longest a blocked read sleeps before re-checking detach and cancel state.
const WAIT_SLICE: Duration = Duration::from_millis(50);

const CALIBRATION_FIRMWARE: FirmwareVersion = FirmwareVersion::new(2, 6, 0);
const ADM1177_FIRMWARE: FirmwareVersion = FirmwareVersion::new(2, 7, 0);
const ADM1177_ALERT_FIRMWARE: FirmwareVersion = FirmwareVersion::new(2, 11, 0);

pub(crate) struct Queues {
    input: SampleQueue<Sample>,
    output: [OutputQueue; 2],
}

impl Queues {
    fn new(size: usize) -> Queues {
        Queues {
            input: SampleQueue::new(size),
            output: [OutputQueue::new(size), OutputQueue::new(size)],
        }
    }
}

pub(crate) struct DeviceInner {
    descriptor: UsbDescriptor,
    handle: Box<dyn UsbHandle>,
    hw_version: String,
    fw_version: String,
    firmware: FirmwareVersion,
    modes: Mutex<[Mode; 2]>,
    queues: RwLock<Arc<Queues>>,
    calibration: Mutex<Calibration>,
    timing: Mutex<Timing>,
    sof_start: AtomicU16,
    ignore_dataflow: AtomicBool,
    overcurrent: AtomicBool,
    detached: AtomicBool,
    /// An acquisition is feeding the input queue.
    active: AtomicBool,
    continuous: AtomicBool,
    /// First transfer-side error, surfaced by the next read or write.
    fault: Mutex<Option<Error>>,
    session: Mutex<Weak<Shared>>,
}

#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("serial", &self.inner.descriptor.serial)
            .field("fw_version", &self.inner.fw_version)
            .field("hw_version", &self.inner.hw_version)
            .finish()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Device {
    /// Opens a unit and reads its identity and stored calibration.
    pub(crate) fn probe(
        transport: &dyn Transport,
        descriptor: &UsbDescriptor,
        queue_size: usize,
        ignore_dataflow: bool,
    ) -> Result<Device> {
        let handle = transport.open(descriptor)?;
        let hw_version = read_version(handle.as_ref(), 0)?;
        let fw_version = read_version(handle.as_ref(), 1)?;

        let mut image = vec![0u8; EEPROM_SIZE];
        let calibration = match handle.control_in(request::READ_CALIBRATION, 0, 0, &mut image, CONTROL_TIMEOUT) {
            Ok(n) => Calibration::from_eeprom(&image[..n]),
            Err(e) => {
                warn!("{}: failed reading calibration, using defaults: {}", descriptor.serial, e);
                Calibration::identity()
            }
        };

        debug!(
            "probed {} (hw {}, fw {}), calibration {}",
            descriptor.serial,
            hw_version,
            fw_version,
            if calibration.is_identity() { "default" } else { "stored" }
        );

        Ok(Device {
            inner: Arc::new(DeviceInner {
                descriptor: descriptor.clone(),
                handle,
                firmware: FirmwareVersion::parse(&fw_version),
                timing: Mutex::new(Timing::new(0, &fw_version)),
                hw_version,
                fw_version,
                modes: Mutex::new([Mode::HiZ; 2]),
                queues: RwLock::new(Arc::new(Queues::new(queue_size))),
                calibration: Mutex::new(calibration),
                sof_start: AtomicU16::new(0),
                ignore_dataflow: AtomicBool::new(ignore_dataflow),
                overcurrent: AtomicBool::new(false),
                detached: AtomicBool::new(false),
                active: AtomicBool::new(false),
                continuous: AtomicBool::new(false),
                fault: Mutex::new(None),
                session: Mutex::new(Weak::new()),
            }),
        })
    }

    pub fn serial(&self) -> &str {
        &self.inner.descriptor.serial
    }

    pub fn hw_version(&self) -> &str {
        &self.inner.hw_version
    }

    pub fn fw_version(&self) -> &str {
        &self.inner.fw_version
    }

    pub fn firmware_version(&self) -> FirmwareVersion {
        self.inner.firmware
    }

    pub fn descriptor(&self) -> &UsbDescriptor {
        &self.inner.descriptor
    }

    pub fn channel(&self, id: ChannelId) -> Channel {
        Channel::new(self.clone(), id)
    }

    pub fn channels(&self) -> [Channel; 2] {
        [self.channel(ChannelId::A), self.channel(ChannelId::B)]
    }

    /// The session this device was added to, if that session still exists.
    pub fn session(&self) -> Option<Session> {
        lock(&self.inner.session).upgrade().map(Session::from_shared)
    }

    pub fn mode(&self, channel: ChannelId) -> Mode {
        lock(&self.inner.modes)[channel.index()]
    }

    /// Switches a channel's mode. Queued output belongs to the old mode's
    /// units, so it is discarded along with the hold value.
    pub fn set_mode(&self, channel: ChannelId, mode: Mode) -> Result<()> {
        self.check_attached()?;
        {
            let mut modes = lock(&self.inner.modes);
            if modes[channel.index()] == mode {
                return Ok(());
            }
            modes[channel.index()] = mode;
        }
        self.queues().output[channel.index()].reset();
        debug!("{}: channel {} -> {:?}", self.serial(), channel.label(), mode);
        if self.inner.active.load(Ordering::SeqCst) {
            self.apply_mode(channel, mode)?;
        }
        Ok(())
    }

    pub fn signal(&self, channel: ChannelId) -> SignalInfo {
        SignalInfo::for_mode(self.mode(channel))
    }

    /// Sample rate the device is configured for, in Hz.
    pub fn sample_rate(&self) -> u32 {
        lock(&self.inner.timing).rate
    }

    pub fn queue_size(&self) -> usize {
        self.queues().input.capacity()
    }

    pub fn ignore_dataflow(&self) -> bool {
        self.inner.ignore_dataflow.load(Ordering::SeqCst)
    }

    pub fn set_ignore_dataflow(&self, ignore: bool) {
        self.inner.ignore_dataflow.store(ignore, Ordering::SeqCst);
    }

    /// Whether the last run tripped the overcurrent detector.
    pub fn overcurrent(&self) -> bool {
        self.inner.overcurrent.load(Ordering::SeqCst)
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::SeqCst)
    }

    /// Samples waiting to be read.
    pub fn available(&self) -> usize {
        self.queues().input.len()
    }

    /// Reads up to `n` samples.
    ///
    /// While an acquisition is running, a blocking timeout keeps draining
    /// the input queue until `n` samples were collected, so `n` may exceed
    /// the queue size. The wait ends early when the acquisition stops or a
    /// transfer error is recorded. A non-blocking read, or one with nothing
    /// running, returns what is already queued.
    pub fn read<T: Into<Timeout>>(&self, n: usize, timeout: T) -> Result<Vec<Sample>> {
        self.read_samples(n, timeout.into(), false)
    }

    /// Like [`read`](Device::read), but first drops queued samples older
    /// than the newest `n`, so a streaming reader that fell behind gets
    /// current data.
    pub fn read_latest<T: Into<Timeout>>(&self, n: usize, timeout: T) -> Result<Vec<Sample>> {
        self.read_samples(n, timeout.into(), true)
    }

    fn read_samples(&self, n: usize, timeout: Timeout, skip_stale: bool) -> Result<Vec<Sample>> {
        self.check_attached()?;
        self.check_fault()?;

        let queues = self.queues();
        if skip_stale {
            let stale = queues.input.len().saturating_sub(n);
            let skipped = queues.input.skip(stale);
            if skipped > 0 {
                debug!("{}: skipped {} stale samples", self.serial(), skipped);
            }
        }

        let deadline = match timeout {
            Timeout::After(d) => Some(Instant::now() + d),
            _ => None,
        };
        let mut out = Vec::with_capacity(n.min(queues.input.capacity()));
        loop {
            // Sampled before popping: the acquisition thread queues its
            // last samples before it clears the flag.
            let active = self.inner.active.load(Ordering::SeqCst);
            out.extend(pop_samples(&queues.input, n - out.len()));
            if out.len() == n || timeout == Timeout::NonBlocking || !active {
                break;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            queues.input.wait_for_data(slice);
            self.check_attached()?;
            self.check_fault()?;
        }
        if timeout != Timeout::NonBlocking {
            self.check_attached()?;
        }
        Ok(out)
    }

    /// Queues output values for one channel.
    ///
    /// During continuous acquisition the call waits up to the write timeout
    /// for queue space; otherwise values that don't fit are refused.
    pub fn write(&self, values: &[f32], channel: ChannelId, cyclic: bool) -> Result<()> {
        self.check_attached()?;
        self.check_fault()?;

        let wait = self.inner.continuous.load(Ordering::SeqCst) && self.inner.active.load(Ordering::SeqCst);
        let timeout = lock(&self.inner.timing).write_timeout;
        self.queues().output[channel.index()]
            .write(values, cyclic, wait, timeout)
            .map_err(|free| {
                Error::BufferTimeout(format!(
                    "no queue space for {} samples on channel {} ({} free)",
                    values.len(),
                    channel.label(),
                    free
                ))
            })
    }

    /// Runs the owning session for `n` samples and returns this device's.
    pub fn get_samples(&self, n: usize) -> Result<Vec<Sample>> {
        let session = self
            .session()
            .ok_or_else(|| Error::session(format!("{} is not part of a session", self.serial()), libc::ENODEV))?;
        let batches = session.get_samples(n)?;
        let index = session
            .devices()
            .iter()
            .position(|d| d == self)
            .ok_or_else(|| Error::session(format!("{} was removed from its session", self.serial()), libc::ENXIO))?;
        batches
            .into_iter()
            .nth(index)
            .ok_or_else(|| Error::session("device list changed during acquisition", libc::EAGAIN))
    }

    /// Drops queued output of one channel, or both with `None`, and
    /// optionally any unread input.
    pub fn flush(&self, channel: Option<ChannelId>, read: bool) {
        let queues = self.queues();
        match channel {
            Some(channel) => queues.output[channel.index()].flush(),
            None => queues.output.iter().for_each(OutputQueue::flush),
        }
        if read {
            queues.input.clear();
        }
    }

    /// Raw vendor control transfer. Bit 7 of `request_type` selects the
    /// direction.
    pub fn ctrl_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.check_attached()?;
        let handle = &self.inner.handle;
        let result = if request_type & 0x80 != 0 {
            handle.control_in(request, value, index, data, timeout)
        } else {
            handle.control_out(request, value, index, data, timeout)
        };
        self.observe(result)
    }

    /// `[offset, positive gain, negative gain]` for each of the 8 rows.
    pub fn calibration(&self) -> Vec<[f32; 3]> {
        lock(&self.inner.calibration).rows()
    }

    /// Stores a calibration file on the device, or resets it to identity
    /// with `None`. A bad file leaves the stored calibration untouched.
    pub fn write_calibration(&self, path: Option<&Path>) -> Result<()> {
        self.check_attached()?;
        if self.inner.firmware < CALIBRATION_FIRMWARE {
            return Err(Error::device(
                format!(
                    "writing calibration needs firmware {} or newer, {} has {}",
                    CALIBRATION_FIRMWARE,
                    self.serial(),
                    self.fw_version()
                ),
                libc::ENOTSUP,
            ));
        }
        let calibration = match path {
            Some(path) => Calibration::from_file(path)?,
            None => Calibration::identity(),
        };
        let image = calibration.to_eeprom();
        let result = self
            .inner
            .handle
            .control_out(request::WRITE_CALIBRATION, 0, 0, &image, CONTROL_TIMEOUT);
        self.observe(result)?;
        *lock(&self.inner.calibration) = calibration;
        info!("{}: calibration updated", self.serial());
        Ok(())
    }

    /// Reboots the unit into its SAM-BA bootloader. The unit drops off the
    /// bus and this handle stays detached from then on.
    pub fn samba_mode(&self) -> Result<()> {
        self.check_attached()?;
        let result = self
            .inner
            .handle
            .control_out(request::SAMBA_MODE, 0, 0, &[], Duration::from_millis(500));
        match result {
            Ok(_) | Err(Error::Detached { .. }) => {}
            // The unit often resets before acknowledging.
            Err(ref e) if e.errno() == libc::EIO || e.errno() == libc::EPIPE => {}
            Err(e) => return Err(e),
        }
        info!("{}: entered SAM-BA mode", self.serial());
        self.mark_detached();
        Ok(())
    }

    pub fn set_leds(&self, leds: u8) -> Result<()> {
        if leds > 7 {
            return Err(Error::invalid(format!("LED mask {:#x} out of range 0..=7", leds)));
        }
        self.check_attached()?;
        let result = self
            .inner
            .handle
            .control_out(request::LEDS, u16::from(leds), 0, &[], CONTROL_TIMEOUT);
        self.observe(result).map(|_| ())
    }

    pub(crate) fn queues(&self) -> Arc<Queues> {
        self.inner
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn resize_queues(&self, size: usize) {
        *self.inner.queues.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(Queues::new(size));
    }

    pub(crate) fn set_session(&self, session: Weak<Shared>) {
        *lock(&self.inner.session) = session;
    }

    /// Quantizes and stores a new sample rate, returning the realized one.
    pub(crate) fn configure(&self, rate: u32) -> u32 {
        let timing = Timing::new(rate, &self.inner.fw_version);
        debug!(
            "{}: {} Hz requested, running at {} Hz ({} packets per transfer)",
            self.serial(),
            rate,
            timing.rate,
            timing.packets_per_transfer
        );
        *lock(&self.inner.timing) = timing;
        timing.rate
    }

    pub(crate) fn timing(&self) -> Timing {
        *lock(&self.inner.timing)
    }

    /// Marks the unit as gone and wakes anyone blocked on it.
    pub(crate) fn mark_detached(&self) {
        if !self.inner.detached.swap(true, Ordering::SeqCst) {
            debug!("{}: marked detached", self.serial());
        }
        self.inner.active.store(false, Ordering::SeqCst);
        self.notify();
    }

    pub(crate) fn set_active(&self, active: bool, continuous: bool) {
        self.inner.continuous.store(continuous && active, Ordering::SeqCst);
        self.inner.active.store(active, Ordering::SeqCst);
        if !active {
            self.notify();
        }
    }

    pub(crate) fn notify(&self) {
        let queues = self.queues();
        queues.input.notify();
        queues.output.iter().for_each(OutputQueue::notify);
    }

    pub(crate) fn cancel_transfers(&self) {
        self.inner.handle.cancel();
    }

    pub(crate) fn record_fault(&self, error: Error) {
        let mut fault = lock(&self.inner.fault);
        if fault.is_none() {
            warn!("{}: {}", self.serial(), error);
            *fault = Some(error);
        }
    }

    pub(crate) fn take_fault(&self) -> Option<Error> {
        lock(&self.inner.fault).take()
    }

    /// Pops exactly what a finished run left queued, up to `n`.
    pub(crate) fn drain(&self, n: usize) -> Vec<Sample> {
        pop_samples(&self.queues().input, n)
    }

    pub(crate) fn clear_input(&self) {
        self.queues().input.clear();
    }

    /// Whether the unit still answers on this handle.
    pub(crate) fn ping(&self) -> bool {
        !self.is_detached() && self.observe(read_version(self.inner.handle.as_ref(), 1)).is_ok()
    }

    /// Restores channel modes and arms sampling.
    pub(crate) fn on(&self) -> Result<()> {
        self.check_attached()?;
        let modes = *lock(&self.inner.modes);
        for &id in ChannelId::ALL.iter() {
            self.apply_mode(id, modes[id.index()])?;
        }
        self.control(request::CONFIGURE, 0, 0)?;
        self.control(request::START, 0, 0)
    }

    /// Latches the frame all devices of a run start sampling on.
    pub(crate) fn sync(&self) -> Result<()> {
        let mut frame = [0u8; 2];
        let result = self
            .inner
            .handle
            .control_in(request::FRAME_NUMBER, 0, 0, &mut frame, CONTROL_TIMEOUT);
        self.observe(result)?;
        let sof = u16::from_le_bytes(frame).wrapping_add(0xff) & 0x3c00;
        self.inner.sof_start.store(sof, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn run(&self) -> Result<()> {
        let sam_per = lock(&self.inner.timing).sam_per;
        let sof = self.inner.sof_start.load(Ordering::SeqCst);
        self.control(request::CONFIGURE, sam_per, sof)
    }

    /// Stops sampling and floats both channels. The configured modes are
    /// kept for the next run.
    pub(crate) fn off(&self) -> Result<()> {
        self.check_attached()?;
        let firmware = self.inner.firmware;
        if firmware >= ADM1177_FIRMWARE {
            let mut status = [0u8; 1];
            let result = self
                .inner
                .handle
                .control_in(request::ADM1177_STATUS, 0, 1, &mut status, CONTROL_TIMEOUT);
            let n = self.observe(result)?;
            let alert = if firmware >= ADM1177_ALERT_FIRMWARE { 0x8 } else { 0x4 };
            let tripped = n == 1 && status[0] & alert != 0;
            if tripped {
                warn!("{}: overcurrent during the last run", self.serial());
            }
            self.inner.overcurrent.store(tripped, Ordering::SeqCst);
        }
        for &id in ChannelId::ALL.iter() {
            self.apply_mode(id, Mode::HiZ)?;
        }
        self.control(request::CONFIGURE, 0, 0)
    }

    /// Sends one transfer worth of output. Only the first `needed` values
    /// of each channel come out of the queues; the rest of the packet
    /// repeats the last one.
    pub(crate) fn transfer_out(&self, samples: usize, needed: usize, bounded: bool) -> Result<()> {
        let queues = self.queues();
        let modes = *lock(&self.inner.modes);
        let calibration = *lock(&self.inner.calibration);
        let mut codes = vec![[HI_Z_CODE; 2]; samples];
        let mut values = vec![0.0f32; samples];

        for &id in ChannelId::ALL.iter() {
            let c = id.index();
            let mode = modes[c];
            if !mode.is_sourcing() {
                continue;
            }
            let needed = needed.min(samples);
            let fill = queues.output[c].fill(&mut values[..needed]);
            let pad = if needed > 0 { values[needed - 1] } else { queues.output[c].hold_value().unwrap_or(0.0) };
            values[needed..].iter_mut().for_each(|v| *v = pad);

            if fill.starved > 0 && bounded && !self.ignore_dataflow() {
                self.record_fault(Error::BufferTimeout(format!(
                    "channel {} sources but no data was ever written",
                    id.label()
                )));
            }

            for (code, &v) in codes.iter_mut().zip(values.iter()) {
                code[c] = encode_output(&calibration, id, mode, v);
            }
        }

        let interleaved = self.inner.firmware.interleaved();
        let buf = codec::encode_out(&codes, interleaved);
        let result = self.inner.handle.bulk_out(EP_OUT, &buf, BULK_TIMEOUT);
        self.observe(result).map(|_| ())
    }

    /// Receives one transfer worth of input and queues its first `take`
    /// samples.
    pub(crate) fn transfer_in(&self, samples: usize, take: usize) -> Result<()> {
        let mut buf = vec![0u8; samples * IN_SAMPLE_BYTES];
        let result = self.inner.handle.bulk_in(EP_IN, &mut buf, BULK_TIMEOUT);
        let n = self.observe(result)?;

        let calibration = *lock(&self.inner.calibration);
        let decoded: Vec<Sample> = codec::decode_in(&buf[..n], self.inner.firmware.interleaved())
            .iter()
            .take(take)
            .map(|raw| decode_sample(&calibration, raw))
            .collect();

        let queues = self.queues();
        if queues.input.remaining() >= decoded.len() {
            queues.input.push_slice(&decoded);
        } else if self.ignore_dataflow() {
            let dropped = queues.input.force_push(&decoded);
            debug!("{}: dropped {} stale samples", self.serial(), dropped);
        } else {
            let pushed = queues.input.push_slice(&decoded);
            self.record_fault(Error::BufferOverflow);
            debug!("{}: dropped {} incoming samples", self.serial(), decoded.len() - pushed);
        }
        Ok(())
    }

    fn apply_mode(&self, channel: ChannelId, mode: Mode) -> Result<()> {
        let ch = channel.index() as u16;
        self.control(request::SET_POTENTIOMETER, ch, mode.potentiometer())?;
        self.control(request::SET_MODE, ch, mode.firmware_code())
    }

    fn control(&self, req: u8, value: u16, index: u16) -> Result<()> {
        let result = self.inner.handle.control_out(req, value, index, &[], CONTROL_TIMEOUT);
        self.observe(result).map(|_| ())
    }

    /// Passes a transfer result through, noting when it says the unit is gone.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::Detached { .. }) = result {
            self.mark_detached();
        }
        result
    }

    pub(crate) fn check_attached(&self) -> Result<()> {
        if self.is_detached() {
            return Err(Error::Detached {
                serial: self.serial().to_string(),
            });
        }
        Ok(())
    }

    fn check_fault(&self) -> Result<()> {
        match self.take_fault() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
impl Queues {
    pub(crate) fn output(&self, channel: ChannelId) -> &OutputQueue {
        &self.output[channel.index()]
    }
}

fn read_version(handle: &dyn UsbHandle, index: u16) -> Result<String> {
    let mut buf = [0u8; 64];
    let n = handle.control_in(request::VERSION, 0, index, &mut buf, CONTROL_TIMEOUT)?;
    let text = String::from_utf8_lossy(&buf[..n]);
    Ok(text.trim_end_matches('\0').trim().to_string())
}

fn pop_samples(queue: &SampleQueue<Sample>, n: usize) -> Vec<Sample> {
    let mut out = vec![Sample::default(); n.min(queue.len())];
    let got = queue.pop_into(&mut out);
    out.truncate(got);
    out
}

fn encode_output(calibration: &Calibration, channel: ChannelId, mode: Mode, value: f32) -> u16 {
    match mode {
        Mode::Svmi => codec::voltage_code(VOLTAGE.clamp(calibration.source_voltage(channel, value))),
        Mode::Simv => codec::current_code(CURRENT.clamp(calibration.source_current(channel, value))),
        Mode::HiZ => HI_Z_CODE,
    }
}

fn decode_sample(calibration: &Calibration, raw: &[u16; 4]) -> Sample {
    let mut sample = Sample::default();
    for &id in ChannelId::ALL.iter() {
        let c = id.index();
        sample.channels[c] = [
            calibration.correct_voltage(id, codec::decode_voltage(raw[c * 2])),
            calibration.correct_current(id, codec::decode_current(raw[c * 2 + 1])),
        ];
    }
    sample
}

#[cfg(test)]
mod tests {
    use super::simulated::SimulatedBus;
    use super::*;
    use crate::calibration::tests::sample_file;
    use std::io::Write;

    fn probe(bus: &SimulatedBus) -> Device {
        let desc = bus.enumerate().unwrap().remove(0);
        Device::probe(bus, &desc, 1000, false).unwrap()
    }

    #[test]
    fn test_probe_reads_identity() {
        let bus = SimulatedBus::new();
        bus.attach_with("203B1234", "F", "2.11");
        let dev = probe(&bus);
        assert_eq!(dev.serial(), "203B1234");
        assert_eq!(dev.fw_version(), "2.11");
        assert_eq!(dev.hw_version(), "F");
        assert_eq!(dev.sample_rate(), 100_000);
        assert_eq!(dev.calibration(), vec![[0.0, 1.0, 1.0]; 8]);
        assert_eq!(dev.mode(ChannelId::A), Mode::HiZ);
    }

    #[test]
    fn test_write_calibration_file_and_reset() {
        let bus = SimulatedBus::with_devices(1);
        let dev = probe(&bus);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_file().as_bytes()).unwrap();
        dev.write_calibration(Some(file.path())).unwrap();
        assert!((dev.calibration()[0][0] - 0.01).abs() < 1e-6);
        assert_eq!(bus.eeprom("SIM0000").unwrap().len(), EEPROM_SIZE);

        // A fresh probe sees what was stored.
        let again = probe(&bus);
        assert_eq!(again.calibration(), dev.calibration());

        dev.write_calibration(None).unwrap();
        assert_eq!(dev.calibration(), vec![[0.0, 1.0, 1.0]; 8]);
    }

    #[test]
    fn test_bad_calibration_keeps_previous() {
        let bus = SimulatedBus::with_devices(1);
        let dev = probe(&bus);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"</>\n<0.0, 0.1>\n<\\>\n").unwrap();
        assert!(dev.write_calibration(Some(file.path())).is_err());
        assert!(dev.write_calibration(Some(Path::new("/nonexistent/cal.txt"))).is_err());
        assert_eq!(dev.calibration(), vec![[0.0, 1.0, 1.0]; 8]);
    }

    #[test]
    fn test_old_firmware_cannot_store_calibration() {
        let bus = SimulatedBus::new();
        bus.attach_with("OLD", "D", "2.02");
        let err = probe(&bus).write_calibration(None).unwrap_err();
        assert!(matches!(err, Error::Device { .. }));
    }

    #[test]
    fn test_leds() {
        let bus = SimulatedBus::with_devices(1);
        let dev = probe(&bus);
        dev.set_leds(5).unwrap();
        assert_eq!(bus.leds("SIM0000"), Some(5));
        assert!(dev.set_leds(8).is_err());
    }

    #[test]
    fn test_ctrl_transfer_reads_version() {
        let bus = SimulatedBus::with_devices(1);
        let dev = probe(&bus);
        let mut buf = [0u8; 64];
        let n = dev.ctrl_transfer(0xC0, 0x00, 0, 0, &mut buf, CONTROL_TIMEOUT).unwrap();
        assert_eq!(&buf[..n], b"F");
    }

    #[test]
    fn test_samba_mode_detaches() {
        let bus = SimulatedBus::with_devices(1);
        let dev = probe(&bus);
        dev.samba_mode().unwrap();
        assert!(dev.is_detached());
        assert!(bus.in_bootloader("SIM0000"));
        assert!(matches!(dev.read(1, 0), Err(Error::Detached { .. })));
    }

    #[test]
    fn test_mode_change_resets_output() {
        let bus = SimulatedBus::with_devices(1);
        let dev = probe(&bus);
        dev.set_mode(ChannelId::A, Mode::Svmi).unwrap();
        dev.write(&[1.0, 2.0], ChannelId::A, false).unwrap();
        assert_eq!(dev.queues().output(ChannelId::A).len(), 2);
        dev.set_mode(ChannelId::A, Mode::Simv).unwrap();
        assert_eq!(dev.queues().output(ChannelId::A).len(), 0);
        assert_eq!(dev.signal(ChannelId::A).label, "Current");
    }

    #[test]
    fn test_idle_write_refuses_overfill() {
        let bus = SimulatedBus::with_devices(1);
        let dev = probe(&bus);
        dev.write(&vec![1.0; 1000], ChannelId::B, false).unwrap();
        let err = dev.write(&[1.0], ChannelId::B, false).unwrap_err();
        assert!(err.is_dataflow());
    }
}
