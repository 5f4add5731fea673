use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use smu::{Session, SessionConfig, SimulatedBus};
use tempfile::NamedTempFile;

fn config() -> SessionConfig {
    SessionConfig::default()
        .with_hotplug(false)
        .with_samba_settle(Duration::ZERO)
}

fn image(len: usize) -> (NamedTempFile, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();
    (file, data)
}

#[test]
fn flash_added_device() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = Session::new(Arc::new(bus.clone()), config()).unwrap();
    assert_eq!(s.add_all().unwrap(), 1);
    let (file, data) = image(1000);

    assert_eq!(s.flash_firmware(file.path(), &[]).unwrap(), 1);
    assert!(s.devices().is_empty());
    assert!(!bus.is_present("SIM0000"));

    let flashed = bus.flashed_image("SIM0000").unwrap();
    assert_eq!(flashed.len(), 1024);
    assert_eq!(&flashed[..1000], &data[..]);
    assert!(flashed[1000..].iter().all(|&b| b == 0xff));

    bus.set_next_firmware_version("SIM0000", "2.18");
    bus.replug("SIM0000");
    assert_eq!(s.scan().unwrap(), 1);
    assert_eq!(s.available_devices()[0].fw_version(), "2.18");
}

#[test]
fn flash_only_the_given_devices() {
    let bus = SimulatedBus::with_devices(2).with_realtime(false);
    let s = Session::new(Arc::new(bus.clone()), config()).unwrap();
    assert_eq!(s.add_all().unwrap(), 2);
    let target = s.devices().into_iter().find(|d| d.serial() == "SIM0001").unwrap();
    let (file, data) = image(PAGE);

    assert_eq!(s.flash_firmware(file.path(), &[target.clone()]).unwrap(), 1);
    assert_eq!(bus.flashed_image("SIM0001").unwrap(), data);
    assert!(bus.flashed_image("SIM0000").is_none());
    assert!(bus.is_present("SIM0000"));
    assert_eq!(s.devices().len(), 1);
    assert_eq!(s.devices()[0].serial(), "SIM0000");

    // No longer part of the session.
    let err = s.flash_firmware(file.path(), &[target]).unwrap_err();
    assert_eq!(err.errno(), libc::ENXIO);
}

#[test]
fn flash_unit_waiting_in_bootloader() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = Session::new(Arc::new(bus.clone()), config()).unwrap();
    s.scan().unwrap();
    s.available_devices()[0].samba_mode().unwrap();
    assert!(bus.in_bootloader("SIM0000"));

    let (file, data) = image(PAGE);
    assert_eq!(s.flash_firmware(file.path(), &[]).unwrap(), 1);
    assert_eq!(bus.flashed_image("SIM0000").unwrap(), data);
}

const PAGE: usize = 256;

#[test]
fn bad_images_are_rejected_before_touching_units() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = Session::new(Arc::new(bus.clone()), config()).unwrap();
    s.add_all().unwrap();

    let (empty, _) = image(0);
    assert_eq!(s.flash_firmware(empty.path(), &[]).unwrap_err().errno(), libc::EINVAL);
    assert!(s.flash_firmware("/nonexistent/m1000.bin", &[]).is_err());

    assert!(bus.is_present("SIM0000"));
    assert_eq!(s.devices().len(), 1);
    assert!(bus.flashed_image("SIM0000").is_none());
}

#[test]
fn flash_without_any_unit_fails() {
    let bus = SimulatedBus::new().with_realtime(false);
    let s = Session::new(Arc::new(bus), config()).unwrap();
    let (file, _) = image(PAGE);
    assert_eq!(s.flash_firmware(file.path(), &[]).unwrap_err().errno(), libc::ENODEV);
}
