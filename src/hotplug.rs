//! Background watcher for units being plugged in and out.
//!
//! The monitor polls the transport's enumeration and diffs it by serial
//! against what it reported last, so each unit alternates strictly between
//! attach and detach events. It only holds a weak reference to its session
//! and exits once the session is gone.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, trace, warn};

use crate::device::usb::{Transport, UsbDescriptor};
use crate::error::Result;
use crate::session::WeakSession;

pub(crate) struct Monitor {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    thread: ThreadId,
}

impl Monitor {
    /// Takes the current bus contents as the baseline and starts watching.
    /// Units already present produce no attach event. If such a unit leaves
    /// before the session ever scanned it, there is no handle to announce,
    /// so its departure is silent too and the first event the session sees
    /// for it is the attach when it returns. Announced events per unit still
    /// alternate.
    pub(crate) fn spawn(session: WeakSession, transport: Arc<dyn Transport>, interval: Duration) -> Result<Monitor> {
        let known = m1000_units(transport.as_ref())?;
        let (stop, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("smu-hotplug".into())
            .spawn(move || {
                let mut known = known;
                debug!("hotplug monitor watching {} unit(s)", known.len());
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    let session = match session.upgrade() {
                        Some(session) => session,
                        None => break,
                    };
                    let current = match m1000_units(transport.as_ref()) {
                        Ok(current) => current,
                        Err(e) => {
                            warn!("hotplug enumeration failed: {}", e);
                            continue;
                        }
                    };
                    trace!("hotplug poll: {} unit(s)", current.len());

                    let gone: Vec<String> = known.keys().filter(|s| !current.contains_key(*s)).cloned().collect();
                    for serial in gone {
                        known.remove(&serial);
                        session.handle_detach(&serial);
                    }

                    for (serial, desc) in current.iter() {
                        if known.contains_key(serial) {
                            continue;
                        }
                        // A unit that fails to probe is retried on the next poll.
                        match session.handle_attach(desc) {
                            Ok(_) => {
                                known.insert(serial.clone(), desc.clone());
                            }
                            Err(e) => warn!("failed probing {}: {}", serial, e),
                        }
                    }
                }
                debug!("hotplug monitor stopped");
            })?;

        Ok(Monitor {
            stop: Some(stop),
            thread: handle.thread().id(),
            handle: Some(handle),
        })
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        // Dropping the sender also wakes the thread.
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            // The last session handle can be released from a callback, in
            // which case this runs on the monitor thread and must not join.
            if thread::current().id() != self.thread {
                let _ = handle.join();
            }
        }
    }
}

fn m1000_units(transport: &dyn Transport) -> Result<BTreeMap<String, UsbDescriptor>> {
    Ok(transport
        .enumerate()?
        .into_iter()
        .filter(|d| d.is_m1000())
        .map(|d| (d.serial.clone(), d))
        .collect())
}
