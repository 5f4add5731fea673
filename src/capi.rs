//! C entry points for the binding layer.
//!
//! Every fallible call returns a negative errno on failure. Devices are
//! addressed by their index in the session's device list.

use std::os::raw::c_char;
use std::sync::Arc;

use log::{error, LevelFilter};

use crate::config::SessionConfig;
use crate::device::simulated::SimulatedBus;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::signal::Mode;
use crate::{ChannelId, Sample, Timeout};

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SmuBackend {
    Libusb,
    Simulated,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct SmuArgs {
    pub backend: SmuBackend,
    /// 0 keeps the default depth.
    pub queue_size: usize,
    /// 0 picks the device default.
    pub sample_rate: u32,
    /// Units put on the bus by the simulated backend.
    pub simulated_devices: usize,
    pub hotplug: bool,
}

impl SmuArgs {
    fn config(&self) -> SessionConfig {
        let mut config = SessionConfig::default()
            .with_sample_rate(self.sample_rate)
            .with_hotplug(self.hotplug);
        if self.queue_size > 0 {
            config = config.with_queue_size(self.queue_size);
        }
        config
    }
}

fn status(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => fail(&e),
    }
}

fn fail(e: &Error) -> i32 {
    error!("{}", e);
    -e.errno()
}

fn null() -> i32 {
    -libc::EINVAL
}

fn device_at(session: &Session, index: usize) -> Result<Device> {
    session
        .devices()
        .into_iter()
        .nth(index)
        .ok_or_else(|| Error::session(format!("no device at index {}", index), libc::ENXIO))
}

fn create(args: &SmuArgs) -> Result<Session> {
    let config = args.config();
    match args.backend {
        SmuBackend::Simulated => Session::new(Arc::new(SimulatedBus::with_devices(args.simulated_devices)), config),
        #[cfg(feature = "usb")]
        SmuBackend::Libusb => Session::open(config),
        #[cfg(not(feature = "usb"))]
        SmuBackend::Libusb => Err(Error::session("built without libusb support", libc::ENOSYS)),
    }
}

/// Installs the terminal logger. `level` runs from 0 (off) to 5 (trace).
#[no_mangle]
pub extern fn smu_init_logging(level: i32) -> bool {
    let level = match level {
        i32::MIN..=0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    crate::init_logging(level)
}

/// Creates a session, or returns null on failure.
#[no_mangle]
pub unsafe extern fn smu_session_create(args: *const SmuArgs) -> *mut Session {
    let args = match args.as_ref() {
        Some(args) => args,
        None => return std::ptr::null_mut(),
    };
    match create(args) {
        Ok(session) => Box::into_raw(Box::new(session)),
        Err(e) => {
            error!("failed creating session: {}", e);
            std::ptr::null_mut()
        }
    }
}

/// Destroys a session, stopping acquisition and releasing every device.
#[no_mangle]
pub unsafe extern fn smu_session_destroy(session: *mut Session) {
    if !session.is_null() {
        let session = Box::from_raw(session);
        drop(session)
    }
}

/// Rescans the bus; returns the number of units found.
#[no_mangle]
pub unsafe extern fn smu_scan(session: *const Session) -> i32 {
    match session.as_ref() {
        Some(session) => session.scan().map_or_else(|e| fail(&e), |n| n as i32),
        None => null(),
    }
}

/// Scans and adds every unit; returns the number of devices in the session.
#[no_mangle]
pub unsafe extern fn smu_add_all(session: *const Session) -> i32 {
    match session.as_ref() {
        Some(session) => session.add_all().map_or_else(|e| fail(&e), |n| n as i32),
        None => null(),
    }
}

#[no_mangle]
pub unsafe extern fn smu_device_count(session: *const Session) -> i32 {
    match session.as_ref() {
        Some(session) => session.devices().len() as i32,
        None => null(),
    }
}

/// Sets the sample rate; returns the realized rate.
#[no_mangle]
pub unsafe extern fn smu_configure(session: *const Session, rate: u32) -> i64 {
    match session.as_ref() {
        Some(session) => session.configure(rate).map_or_else(|e| i64::from(fail(&e)), i64::from),
        None => i64::from(null()),
    }
}

#[no_mangle]
pub unsafe extern fn smu_run(session: *const Session, samples: usize) -> i32 {
    match session.as_ref() {
        Some(session) => status(session.run(samples)),
        None => null(),
    }
}

/// Starts acquiring; `samples == 0` streams until `smu_end`.
#[no_mangle]
pub unsafe extern fn smu_start(session: *const Session, samples: usize) -> i32 {
    match session.as_ref() {
        Some(session) => status(session.start(samples)),
        None => null(),
    }
}

#[no_mangle]
pub unsafe extern fn smu_end(session: *const Session) -> i32 {
    match session.as_ref() {
        Some(session) => status(session.end()),
        None => null(),
    }
}

#[no_mangle]
pub unsafe extern fn smu_cancel(session: *const Session) -> i32 {
    match session.as_ref() {
        Some(session) => status(session.cancel()),
        None => null(),
    }
}

#[no_mangle]
pub unsafe extern fn smu_flush(session: *const Session) -> i32 {
    match session.as_ref() {
        Some(session) => {
            session.flush();
            0
        }
        None => null(),
    }
}

/// Copies the NUL-terminated serial of a device into `buf`, truncating to
/// fit. Returns the length of the full serial.
#[no_mangle]
pub unsafe extern fn smu_device_serial(session: *const Session, device: usize, buf: *mut c_char, len: usize) -> i32 {
    let session = match session.as_ref() {
        Some(session) => session,
        None => return null(),
    };
    if buf.is_null() || len == 0 {
        return null();
    }
    match device_at(session, device) {
        Ok(device) => {
            let serial = device.serial().as_bytes();
            let n = serial.len().min(len - 1);
            let out = std::slice::from_raw_parts_mut(buf as *mut u8, len);
            out[..n].copy_from_slice(&serial[..n]);
            out[n] = 0;
            serial.len() as i32
        }
        Err(e) => fail(&e),
    }
}

/// Sets a channel's mode from a token (`MODE_TOKEN_BASE` plus the mode's
/// ordinal). Bare ordinals are rejected.
#[no_mangle]
pub unsafe extern fn smu_set_mode(session: *const Session, device: usize, channel: usize, token: u32) -> i32 {
    let session = match session.as_ref() {
        Some(session) => session,
        None => return null(),
    };
    status((|| {
        let mode = Mode::from_token(token)?;
        let channel = ChannelId::from_index(channel)?;
        device_at(session, device)?.set_mode(channel, mode)
    })())
}

/// Returns the mode token of a channel.
#[no_mangle]
pub unsafe extern fn smu_get_mode(session: *const Session, device: usize, channel: usize) -> i64 {
    let session = match session.as_ref() {
        Some(session) => session,
        None => return i64::from(null()),
    };
    let token = ChannelId::from_index(channel).and_then(|channel| Ok(device_at(session, device)?.mode(channel).token()));
    token.map_or_else(|e| i64::from(fail(&e)), i64::from)
}

/// Queues `n` output values on one channel.
#[no_mangle]
pub unsafe extern fn smu_write(
    session: *const Session,
    device: usize,
    channel: usize,
    values: *const f32,
    n: usize,
    cyclic: bool,
) -> i32 {
    let session = match session.as_ref() {
        Some(session) => session,
        None => return null(),
    };
    if values.is_null() && n > 0 {
        return null();
    }
    let values = if n == 0 { &[][..] } else { std::slice::from_raw_parts(values, n) };
    status((|| {
        let channel = ChannelId::from_index(channel)?;
        device_at(session, device)?.write(values, channel, cyclic)
    })())
}

/// Reads up to `n` samples into `buf`; returns how many were read.
/// `timeout_ms` < 0 waits for all of them, 0 never waits.
#[no_mangle]
pub unsafe extern fn smu_read(session: *const Session, device: usize, buf: *mut Sample, n: usize, timeout_ms: i32) -> i64 {
    let session = match session.as_ref() {
        Some(session) => session,
        None => return i64::from(null()),
    };
    if buf.is_null() && n > 0 {
        return i64::from(null());
    }
    let samples = device_at(session, device).and_then(|d| d.read(n, Timeout::from(timeout_ms)));
    match samples {
        Ok(samples) => {
            if !samples.is_empty() {
                std::slice::from_raw_parts_mut(buf, samples.len()).copy_from_slice(&samples);
            }
            samples.len() as i64
        }
        Err(e) => i64::from(fail(&e)),
    }
}

/// Acquires `n` samples on every device. `buf` must hold `n` samples per
/// device; device `i`'s samples start at `buf + i * n`. Returns the number
/// of samples written.
#[no_mangle]
pub unsafe extern fn smu_get_samples(session: *const Session, n: usize, buf: *mut Sample) -> i64 {
    let session = match session.as_ref() {
        Some(session) => session,
        None => return i64::from(null()),
    };
    if buf.is_null() && n > 0 {
        return i64::from(null());
    }
    match session.get_samples(n) {
        Ok(batches) => {
            let total: usize = batches.iter().map(Vec::len).sum();
            if total > 0 {
                let out = std::slice::from_raw_parts_mut(buf, total);
                for (chunk, batch) in out.chunks_mut(n).zip(batches.iter()) {
                    chunk.copy_from_slice(batch);
                }
            }
            total as i64
        }
        Err(e) => i64::from(fail(&e)),
    }
}
