use std::time::Duration;

use log::{debug, warn};
use rusb::{Context, DeviceHandle, Direction, Recipient, RequestType, UsbContext};

use super::usb::{Transport, UsbDescriptor, UsbHandle};
use crate::error::{Error, Result};

/// Real hardware, reached through libusb.
pub struct LibusbTransport {
    context: Context,
}

impl LibusbTransport {
    pub fn new() -> Result<LibusbTransport> {
        let context = Context::new().map_err(|e| usb_error(e, ""))?;
        Ok(LibusbTransport { context })
    }
}

impl Transport for LibusbTransport {
    fn enumerate(&self) -> Result<Vec<UsbDescriptor>> {
        let devices = self.context.devices().map_err(|e| usb_error(e, ""))?;
        let mut found = Vec::new();

        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            let mut entry = UsbDescriptor {
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                serial: String::new(),
                bus: device.bus_number(),
                address: device.address(),
            };
            if entry.is_samba() {
                found.push(entry);
                continue;
            }
            if !entry.is_m1000() {
                continue;
            }
            // The serial string needs an open handle.
            match device.open() {
                Ok(handle) => match handle.read_serial_number_string_ascii(&desc) {
                    Ok(serial) => {
                        entry.serial = serial;
                        found.push(entry);
                    }
                    Err(e) => warn!("failed reading serial of {}:{}: {}", entry.bus, entry.address, e),
                },
                Err(e) => debug!("skipping {}:{}, open failed: {}", entry.bus, entry.address, e),
            }
        }
        Ok(found)
    }

    fn open(&self, descriptor: &UsbDescriptor) -> Result<Box<dyn UsbHandle>> {
        let devices = self.context.devices().map_err(|e| usb_error(e, &descriptor.serial))?;
        let device = devices
            .iter()
            .find(|d| d.bus_number() == descriptor.bus && d.address() == descriptor.address)
            .ok_or_else(|| Error::Detached {
                serial: descriptor.serial.clone(),
            })?;

        let handle = device.open().map_err(|e| usb_error(e, &descriptor.serial))?;
        let _ = handle.set_auto_detach_kernel_driver(true);

        // The bootloader exposes its bulk pipes on interface 1.
        let interface = if descriptor.is_samba() { 1 } else { 0 };
        handle
            .claim_interface(interface)
            .map_err(|e| usb_error(e, &descriptor.serial))?;
        if !descriptor.is_samba() {
            handle
                .set_alternate_setting(0, 1)
                .map_err(|e| usb_error(e, &descriptor.serial))?;
        }

        Ok(Box::new(LibusbHandle {
            handle,
            interface,
            serial: descriptor.serial.clone(),
        }))
    }
}

struct LibusbHandle {
    handle: DeviceHandle<Context>,
    interface: u8,
    serial: String,
}

impl UsbHandle for LibusbHandle {
    fn control_in(&self, request: u8, value: u16, index: u16, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
            .map_err(|e| usb_error(e, &self.serial))
    }

    fn control_out(&self, request: u8, value: u16, index: u16, data: &[u8], timeout: Duration) -> Result<usize> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.handle
            .write_control(request_type, request, value, index, data, timeout)
            .map_err(|e| usb_error(e, &self.serial))
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.handle
            .read_bulk(endpoint, buf, timeout)
            .map_err(|e| usb_error(e, &self.serial))
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        self.handle
            .write_bulk(endpoint, data, timeout)
            .map_err(|e| usb_error(e, &self.serial))
    }
}

impl Drop for LibusbHandle {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.interface);
    }
}

fn usb_error(e: rusb::Error, serial: &str) -> Error {
    let errno = match e {
        rusb::Error::NoDevice => {
            return Error::Detached {
                serial: serial.to_string(),
            }
        }
        rusb::Error::Io => libc::EIO,
        rusb::Error::InvalidParam => libc::EINVAL,
        rusb::Error::Access => libc::EACCES,
        rusb::Error::NotFound => libc::ENOENT,
        rusb::Error::Busy => libc::EBUSY,
        rusb::Error::Timeout => libc::ETIMEDOUT,
        rusb::Error::Overflow => libc::EOVERFLOW,
        rusb::Error::Pipe => libc::EPIPE,
        rusb::Error::Interrupted => libc::EINTR,
        rusb::Error::NoMem => libc::ENOMEM,
        rusb::Error::NotSupported => libc::ENOSYS,
        _ => libc::EIO,
    };
    Error::device(format!("USB error: {}", e), errno)
}
