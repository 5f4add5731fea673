use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use smu::{Error, Session, SessionConfig, SimulatedBus};

fn watched(bus: &SimulatedBus) -> (Session, Arc<Mutex<Vec<String>>>) {
    watched_with(bus, SessionConfig::default())
}

fn watched_with(bus: &SimulatedBus, config: SessionConfig) -> (Session, Arc<Mutex<Vec<String>>>) {
    let config = config.with_hotplug(true).with_hotplug_interval(Duration::from_millis(20));
    let session = Session::new(Arc::new(bus.clone()), config).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        session.hotplug_attach(move |d| events.lock().unwrap().push(format!("+{}", d.serial())));
    }
    {
        let events = events.clone();
        session.hotplug_detach(move |d| events.lock().unwrap().push(format!("-{}", d.serial())));
    }
    (session, events)
}

fn wait_for(events: &Mutex<Vec<String>>, count: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let seen = events.lock().unwrap().clone();
        if seen.len() >= count || Instant::now() > deadline {
            return seen;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn events_alternate_per_unit() {
    let bus = SimulatedBus::new().with_realtime(false);
    let (s, events) = watched(&bus);

    bus.attach("NEW1");
    assert_eq!(wait_for(&events, 1), vec!["+NEW1"]);
    assert!(s.available_devices().iter().any(|d| d.serial() == "NEW1"));
    assert!(s.devices().is_empty());

    bus.detach("NEW1");
    assert_eq!(wait_for(&events, 2), vec!["+NEW1", "-NEW1"]);
    assert!(s.available_devices().is_empty());

    bus.attach("NEW1");
    assert_eq!(wait_for(&events, 3), vec!["+NEW1", "-NEW1", "+NEW1"]);
}

#[test]
fn units_present_at_startup_are_not_announced() {
    let bus = SimulatedBus::with_devices(2).with_realtime(false);
    let (_s, events) = watched(&bus);
    thread::sleep(Duration::from_millis(100));
    assert!(events.lock().unwrap().is_empty());
}

#[test]
fn unscanned_unit_leaves_silently() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let (s, events) = watched(&bus);

    bus.detach("SIM0000");
    thread::sleep(Duration::from_millis(100));
    assert!(events.lock().unwrap().is_empty());

    bus.attach("SIM0000");
    assert_eq!(wait_for(&events, 1), vec!["+SIM0000"]);
    assert_eq!(s.available_devices().len(), 1);
}

#[test]
fn unplug_wakes_a_streaming_reader() {
    let bus = SimulatedBus::with_devices(1);
    let (s, events) = watched_with(&bus, SessionConfig::default().with_ignore_dataflow(true));
    s.add_all().unwrap();
    let dev = s.devices()[0].clone();
    s.start(0).unwrap();

    let reader = {
        let dev = dev.clone();
        thread::spawn(move || {
            let started = Instant::now();
            (dev.read(10_000_000, -1), started.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(50));
    bus.detach("SIM0000");

    let (result, waited) = reader.join().unwrap();
    assert!(matches!(result.unwrap_err(), Error::Detached { .. }));
    assert!(waited < Duration::from_secs(5));
    assert_eq!(wait_for(&events, 1), vec!["-SIM0000"]);
    assert!(dev.is_detached());
    s.end().unwrap();
}

#[test]
fn added_device_is_marked_detached() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let (s, events) = watched(&bus);
    s.add_all().unwrap();
    let dev = s.devices()[0].clone();

    bus.detach("SIM0000");
    assert_eq!(wait_for(&events, 1), vec!["-SIM0000"]);
    assert!(dev.is_detached());
    assert!(matches!(dev.read(1, 0).unwrap_err(), Error::Detached { .. }));
    s.remove(&dev, true).unwrap();

    bus.attach("SIM0000");
    assert_eq!(wait_for(&events, 2), vec!["-SIM0000", "+SIM0000"]);
    let fresh = s
        .available_devices()
        .into_iter()
        .find(|d| d.serial() == "SIM0000")
        .unwrap();
    assert!(!fresh.is_detached());
    s.add(&fresh).unwrap();
    s.run(100).unwrap();
}

#[test]
fn dropping_the_session_stops_the_monitor() {
    let bus = SimulatedBus::new().with_realtime(false);
    let (s, events) = watched(&bus);
    drop(s);
    bus.attach("LATE");
    thread::sleep(Duration::from_millis(100));
    assert!(events.lock().unwrap().is_empty());
}
