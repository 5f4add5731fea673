//! Device discovery, membership and lock-step acquisition.
//!
//! A session drives all of its devices from a single acquisition thread. Each
//! step sends one OUT transfer to every device and then collects one IN
//! transfer from every device, so sample `i` of each device was taken during
//! the same step.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::config::{RunResetPolicy, SessionConfig};
use crate::device::usb::{Transport, UsbDescriptor};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::firmware;
use crate::hotplug::Monitor;
use crate::queue::lock;
use crate::{Sample, CHUNK_SIZE};

/// Hotplug callback. Runs on the monitor thread.
pub type Callback = Arc<dyn Fn(&Device) + Send + Sync>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    /// A bounded acquisition started with `start(n)` is waiting for `end()`.
    Running,
    Streaming,
}

/// Flags shared with the acquisition thread.
struct Control {
    stop: AtomicBool,
    cancel: AtomicBool,
    devices: Vec<Device>,
}

struct Acquisition {
    handle: JoinHandle<()>,
    done: Receiver<()>,
    control: Arc<Control>,
    samples: usize,
    expected: Duration,
}

pub(crate) struct Shared {
    transport: Arc<dyn Transport>,
    config: Mutex<SessionConfig>,
    devices: Mutex<Vec<Device>>,
    available: Mutex<Vec<Device>>,
    state: Mutex<State>,
    acquisition: Mutex<Option<Acquisition>>,
    control: Mutex<Option<Arc<Control>>>,
    cancelled: AtomicBool,
    attach_callbacks: Mutex<Vec<Callback>>,
    detach_callbacks: Mutex<Vec<Callback>>,
    monitor: Mutex<Option<Monitor>>,
}

/// Handle to a session. Clones share the same session, which shuts down
/// once the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

/// A handle that doesn't keep the session alive.
#[derive(Clone)]
pub struct WeakSession {
    shared: Weak<Shared>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.shared.upgrade().map(Session::from_shared)
    }
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Result<Session> {
        config.validate()?;
        let hotplug = config.hotplug;
        let interval = config.hotplug_interval;

        let session = Session {
            shared: Arc::new(Shared {
                transport,
                config: Mutex::new(config),
                devices: Mutex::new(Vec::new()),
                available: Mutex::new(Vec::new()),
                state: Mutex::new(State::Idle),
                acquisition: Mutex::new(None),
                control: Mutex::new(None),
                cancelled: AtomicBool::new(false),
                attach_callbacks: Mutex::new(Vec::new()),
                detach_callbacks: Mutex::new(Vec::new()),
                monitor: Mutex::new(None),
            }),
        };

        if hotplug {
            let monitor = Monitor::spawn(session.downgrade(), session.shared.transport.clone(), interval)?;
            *lock(&session.shared.monitor) = Some(monitor);
        }
        info!("session created");
        Ok(session)
    }

    /// A session over real hardware.
    #[cfg(feature = "usb")]
    pub fn open(config: SessionConfig) -> Result<Session> {
        let transport = crate::device::libusb::LibusbTransport::new()?;
        Session::new(Arc::new(transport), config)
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Session {
        Session { shared }
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn config(&self) -> SessionConfig {
        lock(&self.shared.config).clone()
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.shared.transport.as_ref()
    }

    /// Devices taking part in acquisitions, in the order they were added.
    pub fn devices(&self) -> Vec<Device> {
        lock(&self.shared.devices).clone()
    }

    /// Every device found by the last scan or hotplug event.
    pub fn available_devices(&self) -> Vec<Device> {
        lock(&self.shared.available).clone()
    }

    pub fn state(&self) -> State {
        *lock(&self.shared.state)
    }

    /// Whether the last acquisition was cancelled.
    pub fn cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Re-enumerates the bus into the available set and returns how many
    /// units were found. Units already open are kept rather than reopened.
    pub fn scan(&self) -> Result<usize> {
        let descriptors: Vec<UsbDescriptor> = self
            .shared
            .transport
            .enumerate()?
            .into_iter()
            .filter(UsbDescriptor::is_m1000)
            .collect();
        let config = self.config();

        let known: Vec<Device> = {
            let devices = lock(&self.shared.devices);
            let available = lock(&self.shared.available);
            devices.iter().chain(available.iter()).cloned().collect()
        };

        let mut found = Vec::with_capacity(descriptors.len());
        for desc in descriptors.iter() {
            let live = known
                .iter()
                .find(|d| d.descriptor() == desc && !d.is_detached() && d.ping())
                .cloned();
            match live {
                Some(device) => found.push(device),
                None => match Device::probe(self.transport(), desc, config.queue_size, config.ignore_dataflow) {
                    Ok(device) => found.push(device),
                    Err(e) => warn!("skipping {}: {}", desc.serial, e),
                },
            }
        }

        for device in known.iter() {
            if !found.iter().any(|d| d == device) && !device.is_detached() {
                debug!("{} no longer on the bus", device.serial());
                device.mark_detached();
            }
        }

        let count = found.len();
        *lock(&self.shared.available) = found;
        debug!("scan found {} device(s)", count);
        Ok(count)
    }

    /// Adds a device to acquisitions. Adding a serial that is already part
    /// of the session does nothing; a detached entry with that serial is
    /// replaced.
    pub fn add(&self, device: &Device) -> Result<()> {
        if device.is_detached() {
            return Err(Error::Detached {
                serial: device.serial().to_string(),
            });
        }
        self.check_idle("add a device")?;
        if let Some(owner) = device.session() {
            if !Arc::ptr_eq(&owner.shared, &self.shared) {
                return Err(Error::session(
                    format!("{} belongs to another session", device.serial()),
                    libc::EBUSY,
                ));
            }
        }

        let config = self.config();
        let mut devices = lock(&self.shared.devices);
        if let Some(pos) = devices.iter().position(|d| d.serial() == device.serial()) {
            if !devices[pos].is_detached() {
                return Ok(());
            }
            devices.remove(pos).set_session(Weak::new());
        }

        if device.queue_size() != config.queue_size {
            device.resize_queues(config.queue_size);
        }
        let rate = match devices.first() {
            Some(first) => first.sample_rate(),
            None => config.sample_rate,
        };
        device.configure(rate);
        device.set_session(Arc::downgrade(&self.shared));
        devices.push(device.clone());
        info!("added {} ({} device(s))", device.serial(), devices.len());
        Ok(())
    }

    /// Scans and adds everything found. Returns the number of devices in
    /// the session afterwards.
    pub fn add_all(&self) -> Result<usize> {
        self.scan()?;
        for device in self.available_devices() {
            self.add(&device)?;
        }
        Ok(lock(&self.shared.devices).len())
    }

    /// Takes a device out of acquisitions. Unless `detached` is set the
    /// unit's outputs are floated on the way out.
    pub fn remove(&self, device: &Device, detached: bool) -> Result<()> {
        let removed = {
            let mut devices = lock(&self.shared.devices);
            let pos = devices
                .iter()
                .position(|d| d.serial() == device.serial())
                .ok_or_else(|| Error::session(format!("no such device: {}", device.serial()), libc::ENXIO))?;
            if !detached && self.state() != State::Idle {
                return Err(Error::session("cannot remove a device while acquiring", libc::EBUSY));
            }
            devices.remove(pos)
        };
        removed.set_session(Weak::new());
        if !detached && !removed.is_detached() {
            if let Err(e) = removed.off() {
                warn!("{}: failed floating outputs: {}", removed.serial(), e);
            }
        }
        info!("removed {}", removed.serial());
        Ok(())
    }

    /// Forgets an available device that is not part of acquisitions.
    pub fn destroy(&self, device: &Device) -> Result<()> {
        if lock(&self.shared.devices).iter().any(|d| d.serial() == device.serial()) {
            return Err(Error::session(
                format!("{} is still added, remove it first", device.serial()),
                libc::EBUSY,
            ));
        }
        let mut available = lock(&self.shared.available);
        let before = available.len();
        available.retain(|d| d.serial() != device.serial());
        if available.len() == before {
            return Err(Error::session(format!("no such device: {}", device.serial()), libc::ENXIO));
        }
        Ok(())
    }

    /// Sets the sample rate of every device and returns the rate the
    /// hardware will really run at.
    pub fn configure(&self, rate: u32) -> Result<u32> {
        self.check_idle("change the sample rate")?;
        let devices = self.devices();
        if devices.is_empty() {
            return Err(Error::session("no devices to configure", libc::ENODEV));
        }
        let realized = devices.iter().map(|d| d.configure(rate)).min().unwrap_or(0);
        lock(&self.shared.config).sample_rate = rate;
        info!("sample rate {} Hz (requested {})", realized, rate);
        Ok(realized)
    }

    pub fn sample_rate(&self) -> u32 {
        match lock(&self.shared.devices).first() {
            Some(device) => device.sample_rate(),
            None => lock(&self.shared.config).sample_rate,
        }
    }

    pub fn queue_size(&self) -> usize {
        lock(&self.shared.config).queue_size
    }

    /// Changes the depth of every device queue. Only allowed while no
    /// device is added.
    pub fn set_queue_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::invalid("queue size must be non-zero"));
        }
        if !lock(&self.shared.devices).is_empty() {
            return Err(Error::session("queue size is fixed while devices are added", libc::EBUSY));
        }
        lock(&self.shared.config).queue_size = size;
        for device in self.available_devices() {
            device.resize_queues(size);
        }
        Ok(())
    }

    /// Starts acquiring on every device. `samples == 0` streams until
    /// [`end`](Session::end) or [`cancel`](Session::cancel); otherwise the
    /// acquisition stops by itself after that many samples.
    pub fn start(&self, samples: usize) -> Result<()> {
        self.shared.start(samples)
    }

    /// Waits for the current acquisition to finish and powers the outputs
    /// down. A bounded acquisition reports the first error any device hit.
    /// Does nothing when idle.
    pub fn end(&self) -> Result<()> {
        self.shared.finish(false)
    }

    /// Aborts the current acquisition without waiting for in-flight
    /// transfers. Blocked readers wake up with what was already queued.
    pub fn cancel(&self) -> Result<()> {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        if let Some(control) = lock(&self.shared.control).clone() {
            control.cancel.store(true, Ordering::SeqCst);
            control.stop.store(true, Ordering::SeqCst);
            for device in control.devices.iter() {
                device.cancel_transfers();
                device.set_active(false, false);
            }
        }
        self.shared.finish(true)
    }

    /// Acquires `n` samples on every device and waits for them.
    pub fn run(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        self.start(n)?;
        self.end()
    }

    /// Acquires `n` samples and returns them per device, index-aligned with
    /// [`devices`](Session::devices). Requests larger than the queue are
    /// split into several runs.
    pub fn get_samples(&self, n: usize) -> Result<Vec<Vec<Sample>>> {
        self.check_idle("collect samples")?;
        let devices = self.devices();
        if devices.is_empty() {
            return Err(Error::session("no devices added", libc::ENODEV));
        }
        let mut batches: Vec<Vec<Sample>> = devices.iter().map(|_| Vec::with_capacity(n)).collect();

        // Each chunk is its own run, so outputs float between chunks.
        let step = self.queue_size();
        let mut left = n;
        while left > 0 {
            let m = left.min(step);
            for device in devices.iter() {
                device.clear_input();
            }
            self.run(m)?;
            for (batch, device) in batches.iter_mut().zip(devices.iter()) {
                let got = device.drain(m);
                if got.len() < m {
                    return Err(Error::session(
                        format!("{} returned {} of {} samples", device.serial(), got.len(), m),
                        libc::EIO,
                    ));
                }
                batch.extend(got);
            }
            left -= m;
        }
        Ok(batches)
    }

    /// Drops queued output and unread input on every device.
    pub fn flush(&self) {
        for device in self.devices() {
            device.flush(None, true);
        }
    }

    pub fn hotplug_attach<F>(&self, callback: F)
    where
        F: Fn(&Device) + Send + Sync + 'static,
    {
        lock(&self.shared.attach_callbacks).push(Arc::new(callback));
    }

    pub fn hotplug_detach<F>(&self, callback: F)
    where
        F: Fn(&Device) + Send + Sync + 'static,
    {
        lock(&self.shared.detach_callbacks).push(Arc::new(callback));
    }

    /// Flashes `path` onto `devices`, or onto every added device when the
    /// slice is empty. With nothing added, a unit already waiting in its
    /// bootloader is flashed instead. Returns how many units were flashed.
    /// Flashed units leave the session and show up again once replugged and
    /// rescanned.
    pub fn flash_firmware<P: AsRef<Path>>(&self, path: P, devices: &[Device]) -> Result<usize> {
        let image = firmware::load_image(path)?;
        self.check_idle("flash firmware")?;
        let settle = self.config().samba_settle;

        let added = self.devices();
        let targets: Vec<Device> = if devices.is_empty() {
            added.into_iter().filter(|d| !d.is_detached()).collect()
        } else {
            for device in devices.iter() {
                if !added.iter().any(|d| d.serial() == device.serial()) {
                    return Err(Error::session(format!("no such device: {}", device.serial()), libc::ENXIO));
                }
                device.check_attached()?;
            }
            devices.to_vec()
        };
        if targets.is_empty() {
            self.flash_bootloader(&image)?;
            return Ok(1);
        }

        for device in targets.iter() {
            info!("flashing {}", device.serial());
            device.samba_mode()?;
            self.remove(device, true)?;
            lock(&self.shared.available).retain(|d| d.serial() != device.serial());
            thread::sleep(settle);
            self.flash_bootloader(&image)?;
        }
        Ok(targets.len())
    }

    fn flash_bootloader(&self, image: &[u8]) -> Result<()> {
        let desc = self
            .shared
            .transport
            .enumerate()?
            .into_iter()
            .find(UsbDescriptor::is_samba)
            .ok_or_else(|| Error::device("no device in SAM-BA mode found", libc::ENODEV))?;
        let handle = self.shared.transport.open(&desc)?;
        firmware::flash(handle.as_ref(), image)
    }

    /// Probes a unit that just appeared and announces it.
    pub(crate) fn handle_attach(&self, desc: &UsbDescriptor) -> Result<Device> {
        let config = self.config();
        let device = Device::probe(self.transport(), desc, config.queue_size, config.ignore_dataflow)?;
        {
            let mut available = lock(&self.shared.available);
            available.retain(|d| d.serial() != desc.serial);
            available.push(device.clone());
        }
        info!("{} attached", device.serial());
        let callbacks = lock(&self.shared.attach_callbacks).clone();
        for callback in callbacks.iter() {
            callback(&device);
        }
        Ok(device)
    }

    /// Marks every handle of a vanished unit detached and announces it.
    /// A unit the session holds no handle for is not announced.
    pub(crate) fn handle_detach(&self, serial: &str) {
        let mut vanished = None;
        for device in lock(&self.shared.devices).iter().filter(|d| d.serial() == serial) {
            device.mark_detached();
            vanished = Some(device.clone());
        }
        {
            let mut available = lock(&self.shared.available);
            if let Some(pos) = available.iter().position(|d| d.serial() == serial) {
                let device = available.remove(pos);
                device.mark_detached();
                vanished = vanished.or(Some(device));
            }
        }
        let device = match vanished {
            Some(device) => device,
            None => return,
        };
        info!("{} detached", serial);
        let callbacks = lock(&self.shared.detach_callbacks).clone();
        for callback in callbacks.iter() {
            callback(&device);
        }
    }

    fn check_idle(&self, what: &str) -> Result<()> {
        if self.state() != State::Idle {
            return Err(Error::session(format!("cannot {} while acquiring", what), libc::EBUSY));
        }
        Ok(())
    }
}

impl Shared {
    fn start(&self, samples: usize) -> Result<()> {
        let mut slot = lock(&self.acquisition);
        if slot.is_some() {
            return Err(Error::session("an acquisition is already running", libc::EBUSY));
        }
        let devices = lock(&self.devices).clone();
        if devices.is_empty() {
            return Err(Error::session("no devices added", libc::ENODEV));
        }
        if let Some(gone) = devices.iter().find(|d| d.is_detached()) {
            return Err(Error::Detached {
                serial: gone.serial().to_string(),
            });
        }

        let policy = lock(&self.config).reset_policy;
        for device in devices.iter() {
            if policy == RunResetPolicy::FlushBeforeRun {
                device.flush(None, true);
            }
            device.take_fault();
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let continuous = samples == 0;
        if let Err(e) = arm(&devices, continuous) {
            power_down(&devices);
            return Err(e);
        }

        let control = Arc::new(Control {
            stop: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            devices: devices.clone(),
        });
        let (done_tx, done) = bounded(1);
        let thread_control = control.clone();
        let handle = thread::spawn(move || acquire(thread_control, samples, done_tx));

        let rate = devices[0].sample_rate().max(1);
        *slot = Some(Acquisition {
            handle,
            done,
            control: control.clone(),
            samples,
            expected: Duration::from_secs_f64(samples as f64 / f64::from(rate)),
        });
        *lock(&self.control) = Some(control);
        *lock(&self.state) = if continuous { State::Streaming } else { State::Running };
        info!(
            "acquisition started on {} device(s), {}",
            devices.len(),
            if continuous { "continuous".to_string() } else { format!("{} samples", samples) }
        );
        Ok(())
    }

    fn finish(&self, cancelled: bool) -> Result<()> {
        let mut slot = lock(&self.acquisition);
        let acquisition = match slot.take() {
            Some(acquisition) => acquisition,
            None => return Ok(()),
        };
        let control = acquisition.control.clone();
        let end_timeout = lock(&self.config).end_timeout;
        if acquisition.samples == 0 {
            control.stop.store(true, Ordering::SeqCst);
        }

        let budget = if cancelled {
            end_timeout
        } else {
            acquisition.expected + end_timeout
        };
        let mut finished = wait_done(&acquisition.done, budget);
        if !finished && !cancelled {
            warn!("acquisition still running after {:?}, cancelling", budget);
            control.cancel.store(true, Ordering::SeqCst);
            control.devices.iter().for_each(Device::cancel_transfers);
            finished = wait_done(&acquisition.done, end_timeout);
        }
        if finished {
            if acquisition.handle.join().is_err() {
                error!("acquisition thread panicked");
            }
        } else {
            error!("acquisition thread did not stop, abandoning it");
        }

        power_down(&control.devices);
        *lock(&self.control) = None;
        *lock(&self.state) = State::Idle;
        drop(slot);
        debug!("acquisition ended{}", if cancelled { " (cancelled)" } else { "" });

        if cancelled {
            control.devices.iter().for_each(|d| {
                d.take_fault();
            });
            return Ok(());
        }
        if acquisition.samples > 0 {
            for device in control.devices.iter() {
                if device.is_detached() {
                    return Err(Error::Detached {
                        serial: device.serial().to_string(),
                    });
                }
                if let Some(e) = device.take_fault() {
                    if !(e.is_dataflow() && device.ignore_dataflow()) {
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(control) = lock(&self.control).clone() {
            control.cancel.store(true, Ordering::SeqCst);
            control.devices.iter().for_each(Device::cancel_transfers);
        }
        if let Err(e) = self.finish(true) {
            debug!("while closing session: {}", e);
        }
        for device in lock(&self.devices).drain(..) {
            if !device.is_detached() {
                if let Err(e) = device.off() {
                    debug!("{}: {}", device.serial(), e);
                }
            }
        }
        // Joins the monitor unless this is the monitor thread itself.
        let monitor = lock(&self.monitor).take();
        drop(monitor);
        info!("session closed");
    }
}

/// Switches every device on and starts sampling on a common frame.
fn arm(devices: &[Device], continuous: bool) -> Result<()> {
    for device in devices.iter() {
        device.on()?;
    }
    if devices.len() > 1 {
        for device in devices.iter() {
            device.sync()?;
        }
    }
    for device in devices.iter() {
        device.set_active(true, continuous);
    }
    for device in devices.iter() {
        device.run()?;
    }
    Ok(())
}

fn power_down(devices: &[Device]) {
    for device in devices.iter() {
        device.set_active(false, false);
        if device.is_detached() {
            continue;
        }
        if let Err(e) = device.off() {
            warn!("{}: failed switching off: {}", device.serial(), e);
        }
    }
}

fn wait_done(done: &Receiver<()>, timeout: Duration) -> bool {
    !matches!(done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

/// Body of the acquisition thread.
fn acquire(control: Arc<Control>, samples: usize, done: Sender<()>) {
    let bounded = samples > 0;
    let per_transfer = control.devices[0].timing().samples_per_transfer();
    let mut live = control.devices.clone();
    let mut remaining = samples;

    while !live.is_empty() {
        if control.cancel.load(Ordering::SeqCst) || (!bounded && control.stop.load(Ordering::SeqCst)) {
            break;
        }
        if bounded && remaining == 0 {
            break;
        }
        let take = if bounded { remaining.min(per_transfer) } else { per_transfer };
        let packet = (take + CHUNK_SIZE - 1) / CHUNK_SIZE * CHUNK_SIZE;

        live.retain(|device| match device.transfer_out(packet, take, bounded) {
            Ok(()) => true,
            Err(e) => {
                drop_device(&control, device, e);
                false
            }
        });
        live.retain(|device| match device.transfer_in(packet, take) {
            Ok(()) => true,
            Err(e) => {
                drop_device(&control, device, e);
                false
            }
        });
        if bounded {
            remaining -= take;
        }
    }

    for device in control.devices.iter() {
        device.set_active(false, false);
    }
    let _ = done.send(());
}

fn drop_device(control: &Control, device: &Device, e: Error) {
    device.set_active(false, false);
    if control.cancel.load(Ordering::SeqCst) {
        debug!("{}: transfer aborted: {}", device.serial(), e);
        return;
    }
    match e {
        Error::Detached { .. } => warn!("{} vanished during acquisition", device.serial()),
        e => {
            error!("{}: stopping acquisition: {}", device.serial(), e);
            device.record_fault(e);
        }
    }
}
