//! An in-process USB bus populated with simulated M1000 units.
//!
//! Each unit answers the same vendor requests and bulk traffic as the real
//! firmware, including the SAM-BA bootloader, and closes the analog loop
//! through a resistive load tied to ground, so what is sourced on a channel
//! comes back in its readings.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;

use super::codec::{self, FirmwareVersion, HI_Z_CODE, TIMER_CLOCK_HZ};
use super::usb::{self, request, Transport, UsbDescriptor, UsbHandle, M1000_IDS, SAMBA_ID};
use crate::calibration::EEPROM_SIZE;
use crate::error::{Error, Result};
use crate::firmware::{EEFC_FCR, EEFC_FSR, FLASH_BASE, PAGE_SIZE};
use crate::queue::lock;
use crate::signal::{CURRENT, VOLTAGE};

pub const DEFAULT_HW_VERSION: &str = "F";
pub const DEFAULT_FW_VERSION: &str = "2.17";

/// Longest stretch a paced transfer sleeps before re-checking cancellation.
const PACING_SLICE: Duration = Duration::from_millis(10);

#[derive(Copy, Clone, Debug)]
struct Settings {
    realtime: bool,
    load_ohms: f32,
    noise: f32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Presence {
    Present,
    Bootloader,
    /// Unplugged, or rebooted out of the bootloader and waiting for a replug.
    Gone,
}

struct UnitState {
    presence: Presence,
    /// Bumped whenever the unit re-enumerates; older handles go stale.
    generation: u64,
    hw_version: String,
    fw_version: String,
    next_fw_version: Option<String>,
    eeprom: Vec<u8>,
    modes: [u16; 2],
    pots: [u16; 2],
    leds: u8,
    sam_per: u16,
    sampling: bool,
    running: bool,
    overcurrent: bool,
    deadline: Option<Instant>,
    pending_out: VecDeque<[u16; 2]>,
    last_out: [u16; 2],
    latch: BTreeMap<u32, u32>,
    flash: Vec<u8>,
    boot_from_flash: bool,
    replies: VecDeque<Vec<u8>>,
}

impl UnitState {
    fn new(hw_version: &str, fw_version: &str) -> UnitState {
        UnitState {
            presence: Presence::Present,
            generation: 0,
            hw_version: hw_version.to_string(),
            fw_version: fw_version.to_string(),
            next_fw_version: None,
            eeprom: Vec::new(),
            modes: [0; 2],
            pots: [0x3000; 2],
            leds: 0,
            sam_per: 0,
            sampling: false,
            running: false,
            overcurrent: false,
            deadline: None,
            pending_out: VecDeque::new(),
            last_out: [HI_Z_CODE; 2],
            latch: BTreeMap::new(),
            flash: Vec::new(),
            boot_from_flash: false,
            replies: VecDeque::new(),
        }
    }

    /// Re-enumerates with the given presence, dropping volatile state.
    fn reenumerate(&mut self, presence: Presence) {
        self.presence = presence;
        self.generation += 1;
        self.modes = [0; 2];
        self.pots = [0x3000; 2];
        self.sampling = false;
        self.running = false;
        self.deadline = None;
        self.pending_out.clear();
        self.last_out = [HI_Z_CODE; 2];
        self.replies.clear();
        if presence == Presence::Present {
            if let Some(fw) = self.next_fw_version.take() {
                self.fw_version = fw;
            }
        }
    }
}

struct Unit {
    serial: String,
    address: u8,
    state: Mutex<UnitState>,
}

struct BusInner {
    units: Mutex<Vec<Arc<Unit>>>,
    settings: Mutex<Settings>,
    epoch: Instant,
}

/// A bus of simulated units, usable anywhere a [`Transport`] is expected.
///
/// Cloning yields another handle to the same bus, so tests can keep one to
/// plug and unplug units while a session owns the other.
#[derive(Clone)]
pub struct SimulatedBus {
    inner: Arc<BusInner>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        SimulatedBus::new()
    }
}

impl SimulatedBus {
    /// An empty bus whose transfers take as long as they would on hardware.
    pub fn new() -> SimulatedBus {
        SimulatedBus {
            inner: Arc::new(BusInner {
                units: Mutex::new(Vec::new()),
                settings: Mutex::new(Settings {
                    realtime: true,
                    load_ohms: 1000.0,
                    noise: 0.0,
                }),
                epoch: Instant::now(),
            }),
        }
    }

    /// Bus with `count` units named `SIM0000`, `SIM0001`, ...
    pub fn with_devices(count: usize) -> SimulatedBus {
        let bus = SimulatedBus::new();
        for i in 0..count {
            bus.attach(&format!("SIM{:04}", i));
        }
        bus
    }

    /// Without pacing, bulk transfers complete immediately.
    pub fn with_realtime(self, realtime: bool) -> Self {
        lock(&self.inner.settings).realtime = realtime;
        self
    }

    pub fn with_load(self, ohms: f32) -> Self {
        lock(&self.inner.settings).load_ohms = ohms.max(f32::MIN_POSITIVE);
        self
    }

    /// Peak amplitude of uniform noise added to every reading.
    pub fn with_noise(self, amplitude: f32) -> Self {
        lock(&self.inner.settings).noise = amplitude.abs();
        self
    }

    pub fn attach(&self, serial: &str) -> UsbDescriptor {
        self.attach_with(serial, DEFAULT_HW_VERSION, DEFAULT_FW_VERSION)
    }

    /// Plugs in a new unit. A unit with the same serial that was unplugged
    /// earlier is replugged instead.
    pub fn attach_with(&self, serial: &str, hw_version: &str, fw_version: &str) -> UsbDescriptor {
        let mut units = lock(&self.inner.units);
        if let Some(unit) = units.iter().find(|u| u.serial == serial) {
            let mut st = lock(&unit.state);
            st.hw_version = hw_version.to_string();
            st.next_fw_version = Some(fw_version.to_string());
            st.reenumerate(Presence::Present);
            return m1000_descriptor(unit);
        }
        let address = units.iter().map(|u| u.address).max().unwrap_or(0) + 1;
        let unit = Arc::new(Unit {
            serial: serial.to_string(),
            address,
            state: Mutex::new(UnitState::new(hw_version, fw_version)),
        });
        info!("simulated {} attached at address {}", serial, address);
        let desc = m1000_descriptor(&unit);
        units.push(unit);
        desc
    }

    /// Unplugs a unit. Open handles fail from now on.
    pub fn detach(&self, serial: &str) -> bool {
        let found = self.with_unit(serial, |st| st.reenumerate(Presence::Gone)).is_some();
        if found {
            info!("simulated {} detached", serial);
        }
        found
    }

    /// Unplugs and replugs a unit, leaving its bootloader if it was in it.
    pub fn replug(&self, serial: &str) -> bool {
        self.with_unit(serial, |st| st.reenumerate(Presence::Present)).is_some()
    }

    /// Firmware version the unit reports after its next re-enumeration.
    pub fn set_next_firmware_version(&self, serial: &str, fw_version: &str) -> bool {
        self.with_unit(serial, |st| st.next_fw_version = Some(fw_version.to_string()))
            .is_some()
    }

    pub fn firmware_version(&self, serial: &str) -> Option<String> {
        self.with_unit(serial, |st| st.fw_version.clone())
    }

    pub fn in_bootloader(&self, serial: &str) -> bool {
        self.with_unit(serial, |st| st.presence == Presence::Bootloader)
            .unwrap_or(false)
    }

    pub fn is_present(&self, serial: &str) -> bool {
        self.with_unit(serial, |st| st.presence == Presence::Present)
            .unwrap_or(false)
    }

    /// Flash contents written through the bootloader, if any.
    pub fn flashed_image(&self, serial: &str) -> Option<Vec<u8>> {
        self.with_unit(serial, |st| st.flash.clone())
            .filter(|flash| !flash.is_empty())
    }

    pub fn eeprom(&self, serial: &str) -> Option<Vec<u8>> {
        self.with_unit(serial, |st| st.eeprom.clone())
    }

    pub fn leds(&self, serial: &str) -> Option<u8> {
        self.with_unit(serial, |st| st.leds)
    }

    /// Firmware mode register of one channel.
    pub fn channel_mode(&self, serial: &str, channel: usize) -> Option<u16> {
        self.with_unit(serial, |st| st.modes.get(channel).copied()).flatten()
    }

    fn with_unit<T, F: FnOnce(&mut UnitState) -> T>(&self, serial: &str, f: F) -> Option<T> {
        let units = lock(&self.inner.units);
        let unit = units.iter().find(|u| u.serial == serial)?;
        let mut st = lock(&unit.state);
        Some(f(&mut st))
    }
}

fn m1000_descriptor(unit: &Unit) -> UsbDescriptor {
    UsbDescriptor {
        vendor_id: M1000_IDS[1].0,
        product_id: M1000_IDS[1].1,
        serial: unit.serial.clone(),
        bus: 1,
        address: unit.address,
    }
}

fn samba_descriptor(unit: &Unit) -> UsbDescriptor {
    UsbDescriptor {
        vendor_id: SAMBA_ID.0,
        product_id: SAMBA_ID.1,
        serial: String::new(),
        bus: 1,
        address: unit.address,
    }
}

impl Transport for SimulatedBus {
    fn enumerate(&self) -> Result<Vec<UsbDescriptor>> {
        let units = lock(&self.inner.units);
        Ok(units
            .iter()
            .filter_map(|unit| match lock(&unit.state).presence {
                Presence::Present => Some(m1000_descriptor(unit)),
                Presence::Bootloader => Some(samba_descriptor(unit)),
                Presence::Gone => None,
            })
            .collect())
    }

    fn open(&self, descriptor: &UsbDescriptor) -> Result<Box<dyn UsbHandle>> {
        let units = lock(&self.inner.units);
        let unit = units
            .iter()
            .find(|u| u.address == descriptor.address)
            .cloned()
            .ok_or_else(|| Error::Detached {
                serial: descriptor.serial.clone(),
            })?;
        let st = lock(&unit.state);
        let wanted = if descriptor.is_samba() {
            Presence::Bootloader
        } else {
            Presence::Present
        };
        if st.presence != wanted {
            return Err(Error::Detached {
                serial: descriptor.serial.clone(),
            });
        }
        let generation = st.generation;
        drop(st);
        debug!("opened simulated {} ({:?})", unit.serial, wanted);
        Ok(Box::new(SimHandle {
            unit,
            bus: self.inner.clone(),
            presence: wanted,
            generation,
            cancelled: AtomicBool::new(false),
        }))
    }
}

struct SimHandle {
    unit: Arc<Unit>,
    bus: Arc<BusInner>,
    presence: Presence,
    generation: u64,
    cancelled: AtomicBool,
}

impl SimHandle {
    /// Locks the unit's state if this handle still refers to it.
    fn state(&self) -> Result<std::sync::MutexGuard<'_, UnitState>> {
        let st = lock(&self.unit.state);
        if st.presence != self.presence || st.generation != self.generation {
            return Err(Error::Detached {
                serial: self.unit.serial.clone(),
            });
        }
        Ok(st)
    }

    fn settings(&self) -> Settings {
        *lock(&self.bus.settings)
    }

    /// Sleeps until `deadline`, in slices, bailing out on cancel or unplug.
    fn pace(&self, deadline: Instant) -> Result<()> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            if self.cancelled.swap(false, Ordering::SeqCst) {
                return Err(Error::device("transfer cancelled", libc::ECANCELED));
            }
            self.state()?;
            thread::sleep((deadline - now).min(PACING_SLICE));
        }
    }

    fn samples_in(&self, buf: &mut [u8]) -> Result<usize> {
        let settings = self.settings();
        let n = buf.len() / codec::IN_SAMPLE_BYTES;
        let mut rng = rand::thread_rng();

        let (codes, interleaved, deadline) = {
            let mut st = self.state()?;
            if !st.running {
                return Err(Error::device("bulk IN on an idle device", libc::ETIMEDOUT));
            }
            let mut codes = Vec::with_capacity(n);
            for _ in 0..n {
                let out = st.pending_out.pop_front().unwrap_or(st.last_out);
                st.last_out = out;
                let mut sample = [0u16; 4];
                for c in 0..2 {
                    let (mut v, mut i) = respond(st.modes[c], out[c], settings.load_ohms);
                    if i.abs() > CURRENT.max as f32 {
                        st.overcurrent = true;
                        i = i.max(CURRENT.min as f32).min(CURRENT.max as f32);
                    }
                    if settings.noise > 0.0 {
                        v += rng.gen_range(-settings.noise, settings.noise);
                        i += rng.gen_range(-settings.noise, settings.noise) * 0.01;
                    }
                    sample[c * 2] = codec::voltage_code(v);
                    sample[c * 2 + 1] = codec::measured_current_code(i);
                }
                codes.push(sample);
            }

            let deadline = if settings.realtime {
                let period = f64::from(st.sam_per) * 2.0 / TIMER_CLOCK_HZ;
                let start = st.deadline.unwrap_or_else(Instant::now);
                let next = start + Duration::from_secs_f64(period * n as f64);
                st.deadline = Some(next);
                Some(next)
            } else {
                None
            };
            let fw = FirmwareVersion::parse(&st.fw_version);
            (codes, fw.interleaved(), deadline)
        };

        if let Some(deadline) = deadline {
            self.pace(deadline)?;
        }
        let packed = codec::encode_in(&codes, interleaved);
        buf[..packed.len()].copy_from_slice(&packed);
        Ok(packed.len())
    }

    fn samba_command(&self, data: &[u8]) -> Result<usize> {
        let text = String::from_utf8_lossy(data);
        let cmd = text.trim_end_matches('#');
        let mut st = self.state()?;
        let mut chars = cmd.chars();
        let op = chars.next();
        let mut fields = chars.as_str().split(',');
        let addr = fields.next().and_then(|a| u32::from_str_radix(a, 16).ok());
        let value = fields.next().and_then(|v| u32::from_str_radix(v, 16).ok());

        match (op, addr, value) {
            (Some('W'), Some(EEFC_FCR), Some(value)) => {
                if value >> 24 != 0x5A {
                    return Ok(data.len());
                }
                let arg = (value >> 8) & 0xffff;
                match value & 0xff {
                    0x05 => {
                        st.flash.clear();
                        st.latch.clear();
                    }
                    0x03 => {
                        let base = FLASH_BASE + arg * PAGE_SIZE as u32;
                        let start = (arg as usize) * PAGE_SIZE;
                        if st.flash.len() < start + PAGE_SIZE {
                            st.flash.resize(start + PAGE_SIZE, 0xff);
                        }
                        for word in 0..PAGE_SIZE / 4 {
                            let addr = base + (word * 4) as u32;
                            let data = st.latch.remove(&addr).unwrap_or(u32::MAX);
                            let at = start + word * 4;
                            st.flash[at..at + 4].copy_from_slice(&data.to_le_bytes());
                        }
                    }
                    0x0B if arg == 1 => st.boot_from_flash = true,
                    _ => {}
                }
            }
            (Some('W'), Some(addr), Some(value)) if addr >= FLASH_BASE => {
                st.latch.insert(addr, value);
            }
            (Some('w'), Some(addr), Some(_)) => {
                // Flash is always ready once a command returns.
                let word: u32 = if addr == EEFC_FSR { 1 } else { 0 };
                st.replies.push_back(word.to_le_bytes().to_vec());
            }
            (Some('G'), Some(_), None) => {
                if st.boot_from_flash {
                    info!("simulated {} booting new firmware, waiting for replug", self.unit.serial);
                    st.boot_from_flash = false;
                    st.reenumerate(Presence::Gone);
                }
            }
            _ => debug!("simulated bootloader ignoring {:?}", cmd),
        }
        Ok(data.len())
    }
}

/// Voltage and current at a channel driving the bus's load resistor.
fn respond(mode: u16, code: u16, load_ohms: f32) -> (f32, f32) {
    match mode {
        1 => {
            let v = codec::decode_voltage(code);
            (v, v / load_ohms)
        }
        2 => {
            let i = codec::sourced_current(code);
            let v = (i * load_ohms).max(VOLTAGE.min as f32).min(VOLTAGE.max as f32);
            // Out of compliance the current is whatever the clamped voltage drives.
            if (v - i * load_ohms).abs() > f32::EPSILON {
                (v, v / load_ohms)
            } else {
                (v, i)
            }
        }
        _ => (0.0, 0.0),
    }
}

impl UsbHandle for SimHandle {
    fn control_in(&self, req: u8, _value: u16, index: u16, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut st = self.state()?;
        let reply: Vec<u8> = match req {
            request::VERSION => match index {
                0 => st.hw_version.clone().into_bytes(),
                1 => st.fw_version.clone().into_bytes(),
                _ => return Err(stall(req)),
            },
            request::READ_CALIBRATION => {
                if st.eeprom.is_empty() {
                    vec![0xff; EEPROM_SIZE]
                } else {
                    st.eeprom.clone()
                }
            }
            request::ADM1177_STATUS => {
                let bit = if FirmwareVersion::parse(&st.fw_version) >= FirmwareVersion::new(2, 11, 0) {
                    0x8
                } else {
                    0x4
                };
                let status = if st.overcurrent { bit } else { 0 };
                st.overcurrent = false;
                vec![status]
            }
            request::FRAME_NUMBER => {
                let frame = (self.bus.epoch.elapsed().as_micros() / 125) as u16 & 0x3fff;
                frame.to_le_bytes().to_vec()
            }
            _ => return Err(stall(req)),
        };
        let n = reply.len().min(buf.len());
        buf[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }

    fn control_out(&self, req: u8, value: u16, index: u16, data: &[u8], _timeout: Duration) -> Result<usize> {
        let mut st = self.state()?;
        match req {
            request::WRITE_CALIBRATION => st.eeprom = data.to_vec(),
            request::LEDS => st.leds = value as u8,
            request::SET_MODE | request::SET_POTENTIOMETER => {
                let channel = value as usize;
                if channel > 1 {
                    return Err(stall(req));
                }
                if req == request::SET_MODE {
                    st.modes[channel] = index;
                } else {
                    st.pots[channel] = index;
                }
            }
            request::SAMBA_MODE => {
                info!("simulated {} entering SAM-BA", self.unit.serial);
                st.reenumerate(Presence::Bootloader);
            }
            request::CONFIGURE => {
                if value == 0 {
                    st.running = false;
                } else {
                    st.sam_per = value;
                    st.running = st.sampling;
                    st.deadline = Some(Instant::now());
                    self.cancelled.store(false, Ordering::SeqCst);
                }
            }
            request::START => {
                st.sampling = true;
                st.pending_out.clear();
            }
            _ => return Err(stall(req)),
        }
        Ok(data.len())
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        match (self.presence, endpoint) {
            (Presence::Present, usb::EP_IN) => self.samples_in(buf),
            (Presence::Bootloader, usb::SAMBA_EP_IN) => {
                let mut st = self.state()?;
                match st.replies.pop_front() {
                    Some(reply) => {
                        let n = reply.len().min(buf.len());
                        buf[..n].copy_from_slice(&reply[..n]);
                        Ok(n)
                    }
                    None => Ok(0),
                }
            }
            _ => Err(stall(endpoint)),
        }
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
        match (self.presence, endpoint) {
            (Presence::Present, usb::EP_OUT) => {
                let mut st = self.state()?;
                let fw = FirmwareVersion::parse(&st.fw_version);
                st.pending_out.extend(codec::decode_out(data, fw.interleaved()));
                Ok(data.len())
            }
            (Presence::Bootloader, usb::SAMBA_EP_OUT) => self.samba_command(data),
            _ => Err(stall(endpoint)),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

fn stall(what: u8) -> Error {
    Error::device(format!("pipe stalled on {:#04x}", what), libc::EPIPE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::usb::{CONTROL_TIMEOUT, EP_IN, EP_OUT};

    fn open_first(bus: &SimulatedBus) -> Box<dyn UsbHandle> {
        let desc = bus.enumerate().unwrap().remove(0);
        bus.open(&desc).unwrap()
    }

    #[test]
    fn test_enumerate_and_detach() {
        let bus = SimulatedBus::with_devices(2).with_realtime(false);
        assert_eq!(bus.enumerate().unwrap().len(), 2);
        let handle = open_first(&bus);
        assert!(bus.detach("SIM0000"));
        assert_eq!(bus.enumerate().unwrap().len(), 1);
        let err = handle.control_out(request::LEDS, 1, 0, &[], CONTROL_TIMEOUT).unwrap_err();
        assert!(matches!(err, Error::Detached { .. }));
    }

    #[test]
    fn test_versions() {
        let bus = SimulatedBus::new();
        bus.attach_with("X", "E", "2.06");
        let handle = open_first(&bus);
        let mut buf = [0u8; 64];
        let n = handle.control_in(request::VERSION, 0, 1, &mut buf, CONTROL_TIMEOUT).unwrap();
        assert_eq!(&buf[..n], b"2.06");
    }

    #[test]
    fn test_loopback_through_load() {
        let bus = SimulatedBus::with_devices(1).with_realtime(false).with_load(1000.0);
        let handle = open_first(&bus);
        handle.control_out(request::SET_MODE, 0, 1, &[], CONTROL_TIMEOUT).unwrap();
        handle.control_out(request::START, 0, 0, &[], CONTROL_TIMEOUT).unwrap();
        handle.control_out(request::CONFIGURE, 240, 0, &[], CONTROL_TIMEOUT).unwrap();

        let out = vec![[codec::voltage_code(2.0), HI_Z_CODE]; 256];
        handle.bulk_out(EP_OUT, &codec::encode_out(&out, true), CONTROL_TIMEOUT).unwrap();
        let mut buf = vec![0u8; 256 * codec::IN_SAMPLE_BYTES];
        handle.bulk_in(EP_IN, &mut buf, CONTROL_TIMEOUT).unwrap();

        let codes = codec::decode_in(&buf, true);
        assert!((codec::decode_voltage(codes[0][0]) - 2.0).abs() < 1e-3);
        assert!((codec::decode_current(codes[0][1]) - 0.002).abs() < 1e-4);
    }

    #[test]
    fn test_samba_mode_reenumerates() {
        let bus = SimulatedBus::with_devices(1);
        let handle = open_first(&bus);
        handle.control_out(request::SAMBA_MODE, 0, 0, &[], CONTROL_TIMEOUT).unwrap();
        assert!(bus.in_bootloader("SIM0000"));
        let descs = bus.enumerate().unwrap();
        assert!(descs[0].is_samba());
        assert!(handle.control_out(request::LEDS, 0, 0, &[], CONTROL_TIMEOUT).is_err());
    }
}
