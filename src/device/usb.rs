//! The USB transport the engine talks through.
//!
//! Transfers are synchronous: the acquisition thread submits one OUT and one
//! IN transfer per device per step and blocks until both complete. Backends
//! report an unplugged device as [`Error::Detached`](crate::Error::Detached).

use std::time::Duration;

use crate::error::Result;

/// Vendor/product ids of M1000 units, old and new.
pub const M1000_IDS: [(u16, u16); 2] = [(0x0456, 0xcee2), (0x064b, 0x784c)];

/// Vendor/product id of a unit sitting in its SAM-BA bootloader.
pub const SAMBA_ID: (u16, u16) = (0x03eb, 0x6124);

pub const EP_OUT: u8 = 0x02;
pub const EP_IN: u8 = 0x81;
pub const SAMBA_EP_OUT: u8 = 0x01;
pub const SAMBA_EP_IN: u8 = 0x82;

/// Vendor requests understood by the M1000 firmware.
pub mod request {
    pub const VERSION: u8 = 0x00;
    pub const READ_CALIBRATION: u8 = 0x01;
    pub const WRITE_CALIBRATION: u8 = 0x02;
    pub const LEDS: u8 = 0x03;
    pub const ADM1177_STATUS: u8 = 0x17;
    pub const SET_MODE: u8 = 0x53;
    pub const SET_POTENTIOMETER: u8 = 0x59;
    pub const FRAME_NUMBER: u8 = 0x6F;
    pub const SAMBA_MODE: u8 = 0xBB;
    pub const CONFIGURE: u8 = 0xC5;
    pub const START: u8 = 0xCC;
}

pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(100);
pub const BULK_TIMEOUT: Duration = Duration::from_secs(10);

/// What enumeration learns about a device without claiming it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UsbDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Empty for bootloader devices, which carry no serial string.
    pub serial: String,
    pub bus: u8,
    pub address: u8,
}

impl UsbDescriptor {
    pub fn is_m1000(&self) -> bool {
        M1000_IDS.contains(&(self.vendor_id, self.product_id))
    }

    pub fn is_samba(&self) -> bool {
        (self.vendor_id, self.product_id) == SAMBA_ID
    }
}

/// An opened device. Vendor control transfers always target the device
/// recipient.
pub trait UsbHandle: Send + Sync {
    fn control_in(&self, request: u8, value: u16, index: u16, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    fn control_out(&self, request: u8, value: u16, index: u16, data: &[u8], timeout: Duration) -> Result<usize>;

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Aborts whatever transfer is in flight on another thread, if the
    /// backend can. Later transfers are unaffected.
    fn cancel(&self) {}
}

pub trait Transport: Send + Sync {
    /// Lists every supported device currently on the bus, bootloaders included.
    fn enumerate(&self) -> Result<Vec<UsbDescriptor>>;

    fn open(&self, descriptor: &UsbDescriptor) -> Result<Box<dyn UsbHandle>>;
}
