//! Firmware images and the SAM-BA flashing sequence.
//!
//! A unit in its bootloader accepts ASCII monitor commands on its bulk OUT
//! pipe: `W<addr>,<word>#` writes a word, `w<addr>,4#` reads one back on the
//! IN pipe and `G<addr>#` jumps.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::device::usb::{UsbHandle, SAMBA_EP_IN, SAMBA_EP_OUT};
use crate::error::{Error, Result};

/// Start of the application flash region.
pub const FLASH_BASE: u32 = 0x0008_0000;
pub const PAGE_SIZE: usize = 256;
pub const MAX_IMAGE: usize = 256 * 1024;

/// Flash controller command and status registers.
pub const EEFC_FCR: u32 = 0x400E_0804;
pub const EEFC_FSR: u32 = 0x400E_0808;

const FLASH_KEY: u32 = 0x5A00_0000;
const CMD_ERASE_ALL: u32 = 0x05;
const CMD_WRITE_PAGE: u32 = 0x03;
const CMD_SET_GPNVM: u32 = 0x0B;
const GPNVM_BOOT_FROM_FLASH: u32 = 1;
const FSR_READY: u32 = 0x1;

const SAMBA_TIMEOUT: Duration = Duration::from_secs(1);
const READY_ATTEMPTS: usize = 100;
const READY_POLL: Duration = Duration::from_millis(10);

/// Reads a raw firmware image, padded with 0xff to a whole number of pages.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let mut image = fs::read(path).map_err(|e| {
        Error::device(
            format!("failed reading firmware image {}: {}", path.display(), e),
            e.raw_os_error().unwrap_or(libc::ENOENT),
        )
    })?;
    if image.is_empty() {
        return Err(Error::device(format!("firmware image {} is empty", path.display()), libc::EINVAL));
    }
    if image.len() > MAX_IMAGE {
        return Err(Error::device(
            format!(
                "firmware image {} is {} bytes, flash holds {}",
                path.display(),
                image.len(),
                MAX_IMAGE
            ),
            libc::EINVAL,
        ));
    }
    let padded = (image.len() + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;
    image.resize(padded, 0xff);
    Ok(image)
}

/// Writes `image` into flash through an open bootloader handle and reboots
/// into it. The unit drops off the bus once this returns.
pub fn flash(handle: &dyn UsbHandle, image: &[u8]) -> Result<()> {
    if image.is_empty() || image.len() % PAGE_SIZE != 0 {
        return Err(Error::invalid("firmware image must be a non-empty multiple of the page size"));
    }

    info!("erasing flash");
    command(handle, &format!("W{:08X},{:08X}#", EEFC_FCR, FLASH_KEY | CMD_ERASE_ALL))?;
    wait_ready(handle)?;

    for (page, data) in image.chunks(PAGE_SIZE).enumerate() {
        let base = FLASH_BASE + (page * PAGE_SIZE) as u32;
        for (i, word) in data.chunks(4).enumerate() {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            command(handle, &format!("W{:08X},{:08X}#", base + (i * 4) as u32, value))?;
        }
        let commit = FLASH_KEY | ((page as u32) << 8) | CMD_WRITE_PAGE;
        command(handle, &format!("W{:08X},{:08X}#", EEFC_FCR, commit))?;
        wait_ready(handle)?;
    }
    debug!("wrote {} pages", image.len() / PAGE_SIZE);

    let gpnvm = FLASH_KEY | (GPNVM_BOOT_FROM_FLASH << 8) | CMD_SET_GPNVM;
    command(handle, &format!("W{:08X},{:08X}#", EEFC_FCR, gpnvm))?;
    wait_ready(handle)?;
    command(handle, "G00000000#")?;
    info!("flashed {} bytes, rebooting", image.len());
    Ok(())
}

fn command(handle: &dyn UsbHandle, cmd: &str) -> Result<()> {
    handle.bulk_out(SAMBA_EP_OUT, cmd.as_bytes(), SAMBA_TIMEOUT)?;
    Ok(())
}

fn wait_ready(handle: &dyn UsbHandle) -> Result<()> {
    for _ in 0..READY_ATTEMPTS {
        command(handle, &format!("w{:08X},4#", EEFC_FSR))?;
        let mut word = [0u8; 4];
        let n = handle.bulk_in(SAMBA_EP_IN, &mut word, SAMBA_TIMEOUT)?;
        if n == 4 && u32::from_le_bytes(word) & FSR_READY != 0 {
            return Ok(());
        }
        thread::sleep(READY_POLL);
    }
    Err(Error::device("flash controller never became ready", libc::ETIMEDOUT))
}
