use std::sync::Arc;
use std::thread;
use std::time::Duration;

use smu::{ChannelId, Error, Mode, RunResetPolicy, Session, SessionConfig, SimulatedBus, State};

fn config() -> SessionConfig {
    SessionConfig::default().with_hotplug(false).with_queue_size(10_000)
}

fn session(bus: &SimulatedBus, config: SessionConfig) -> Session {
    let session = Session::new(Arc::new(bus.clone()), config).unwrap();
    session.add_all().unwrap();
    session
}

#[test]
fn get_samples_returns_one_batch_per_device() {
    let bus = SimulatedBus::with_devices(2).with_realtime(false).with_load(1000.0);
    let s = session(&bus, config());
    let dev = s.devices()[0].clone();
    dev.set_mode(ChannelId::A, Mode::Svmi).unwrap();
    dev.channel(ChannelId::A).constant(3.0).unwrap();

    let batches = s.get_samples(1000).unwrap();
    assert_eq!(batches.len(), 2);
    assert!(batches.iter().all(|b| b.len() == 1000));
    for sample in batches[0].iter() {
        assert!((sample.voltage(ChannelId::A) - 3.0).abs() < 1e-3);
        assert!((sample.current(ChannelId::A) - 0.003).abs() < 1e-4);
    }
    assert!(batches[1].iter().all(|s| s.voltage(ChannelId::A).abs() < 1e-3));
}

#[test]
fn get_samples_larger_than_queue_is_split() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = session(&bus, config().with_queue_size(300));
    let batches = s.get_samples(1000).unwrap();
    assert_eq!(batches[0].len(), 1000);
    assert_eq!(s.devices()[0].available(), 0);
}

#[test]
fn membership_errors() {
    let bus = SimulatedBus::with_devices(2).with_realtime(false);
    let s = Session::new(Arc::new(bus.clone()), config()).unwrap();
    assert_eq!(s.scan().unwrap(), 2);
    let first = s.available_devices()[0].clone();

    let err = s.remove(&first, false).unwrap_err();
    assert!(matches!(err, Error::Session { .. }));
    assert_eq!(err.errno(), libc::ENXIO);

    s.add(&first).unwrap();
    s.add(&first).unwrap();
    assert_eq!(s.devices().len(), 1);
    assert_eq!(s.destroy(&first).unwrap_err().errno(), libc::EBUSY);

    s.remove(&first, false).unwrap();
    assert!(s.devices().is_empty());
    assert_eq!(s.remove(&first, false).unwrap_err().errno(), libc::ENXIO);
    assert!(first.session().is_none());
    s.destroy(&first).unwrap();
    assert_eq!(s.available_devices().len(), 1);
}

#[test]
fn start_without_devices_fails() {
    let bus = SimulatedBus::new();
    let s = Session::new(Arc::new(bus), config()).unwrap();
    assert_eq!(s.start(0).unwrap_err().errno(), libc::ENODEV);
    assert_eq!(s.get_samples(10).unwrap_err().errno(), libc::ENODEV);
    s.end().unwrap();
    s.run(0).unwrap();
}

#[test]
fn sample_rate_is_quantized() {
    let bus = SimulatedBus::with_devices(2).with_realtime(false);
    let s = session(&bus, config());
    assert_eq!(s.sample_rate(), 100_000);
    assert_eq!(s.configure(33_333).unwrap(), 33_333);
    assert_eq!(s.configure(1_000_000).unwrap(), 100_000);
    assert!(s.devices().iter().all(|d| d.sample_rate() == 100_000));
}

#[test]
fn queue_size_is_fixed_while_devices_are_added() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = session(&bus, config());
    assert_eq!(s.set_queue_size(500).unwrap_err().errno(), libc::EBUSY);
    let dev = s.devices()[0].clone();
    s.remove(&dev, false).unwrap();
    s.set_queue_size(500).unwrap();
    assert_eq!(dev.queue_size(), 500);
}

#[test]
fn sourcing_without_data_times_out() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = session(&bus, config());
    s.devices()[0].set_mode(ChannelId::A, Mode::Svmi).unwrap();
    let err = s.run(100).unwrap_err();
    assert!(matches!(err, Error::BufferTimeout(_)));
    assert_eq!(s.state(), State::Idle);

    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = session(&bus, config().with_ignore_dataflow(true));
    s.devices()[0].set_mode(ChannelId::A, Mode::Svmi).unwrap();
    s.run(100).unwrap();
}

#[test]
fn last_output_value_is_held_across_runs() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = session(&bus, config());
    let dev = s.devices()[0].clone();
    dev.set_mode(ChannelId::A, Mode::Svmi).unwrap();
    dev.write(&[1.0, 2.0], ChannelId::A, false).unwrap();

    let batches = s.get_samples(500).unwrap();
    let first = &batches[0];
    assert!((first[0].voltage(ChannelId::A) - 1.0).abs() < 1e-3);
    assert!((first[499].voltage(ChannelId::A) - 2.0).abs() < 1e-3);

    dev.flush(Some(ChannelId::A), true);
    let batches = s.get_samples(500).unwrap();
    let second = &batches[0];
    assert!(second.iter().all(|s| (s.voltage(ChannelId::A) - 2.0).abs() < 1e-3));
}

#[test]
fn flush_before_run_policy_drops_queued_output() {
    let run_with = |policy| {
        let bus = SimulatedBus::with_devices(1).with_realtime(false);
        let s = session(&bus, config().with_ignore_dataflow(true).with_reset_policy(policy));
        let dev = s.devices()[0].clone();
        dev.set_mode(ChannelId::A, Mode::Svmi).unwrap();
        dev.write(&[4.0; 10], ChannelId::A, false).unwrap();
        s.get_samples(10).unwrap()[0][0].voltage(ChannelId::A)
    };
    assert!((run_with(RunResetPolicy::Explicit) - 4.0).abs() < 1e-3);
    assert!(run_with(RunResetPolicy::FlushBeforeRun).abs() < 1e-3);
}

#[test]
fn continuous_blocking_read() {
    let bus = SimulatedBus::with_devices(1);
    let s = session(&bus, config());
    let dev = s.devices()[0].clone();
    dev.set_mode(ChannelId::A, Mode::Svmi).unwrap();
    dev.channel(ChannelId::A).constant(2.0).unwrap();

    s.start(0).unwrap();
    assert_eq!(s.state(), State::Streaming);
    let samples = dev.read(1000, -1).unwrap();
    assert_eq!(samples.len(), 1000);
    assert!(samples.iter().all(|s| (s.voltage(ChannelId::A) - 2.0).abs() < 1e-3));

    // Non-blocking reads never return more than asked for.
    assert!(dev.read(10, 0).unwrap().len() <= 10);
    s.end().unwrap();
    assert_eq!(s.state(), State::Idle);
}

#[test]
fn read_with_timeout_returns_partial() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = session(&bus, config());
    let dev = s.devices()[0].clone();
    s.run(100).unwrap();
    // Nothing is running, so the timeout does not apply.
    let samples = dev.read(500, 1000).unwrap();
    assert_eq!(samples.len(), 100);
}

#[test]
fn bounded_start_feeds_blocked_reader() {
    let bus = SimulatedBus::with_devices(1);
    let s = session(&bus, config());
    let dev = s.devices()[0].clone();
    s.start(5000).unwrap();
    assert_eq!(s.state(), State::Running);
    assert_eq!(dev.read(5000, -1).unwrap().len(), 5000);
    s.end().unwrap();
}

#[test]
fn overflow_is_reported_unless_ignored() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = session(&bus, config().with_queue_size(1000));
    let dev = s.devices()[0].clone();
    s.start(0).unwrap();
    thread::sleep(Duration::from_millis(50));
    let err = dev.read(10, 0).unwrap_err();
    assert!(matches!(err, Error::BufferOverflow));
    s.end().unwrap();

    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = session(&bus, config().with_queue_size(1000).with_ignore_dataflow(true));
    let dev = s.devices()[0].clone();
    s.start(0).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(dev.read(10, 0).unwrap().len(), 10);
    s.end().unwrap();
}

#[test]
fn read_larger_than_queue_streams_through() {
    let bus = SimulatedBus::with_devices(1);
    let s = session(&bus, config().with_queue_size(1000).with_ignore_dataflow(true));
    let dev = s.devices()[0].clone();
    s.start(0).unwrap();
    assert_eq!(dev.read(5000, -1).unwrap().len(), 5000);
    s.end().unwrap();
}

#[test]
fn read_larger_than_queue_reports_overflow() {
    let bus = SimulatedBus::with_devices(1);
    let s = session(&bus, config().with_queue_size(1000));
    let dev = s.devices()[0].clone();
    s.start(0).unwrap();
    let err = dev.read(5000, -1).unwrap_err();
    assert!(matches!(err, Error::BufferOverflow));
    s.end().unwrap();
}

#[test]
fn read_latest_skips_stale_samples() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = session(&bus, config());
    let dev = s.devices()[0].clone();
    dev.set_mode(ChannelId::A, Mode::Svmi).unwrap();
    let ramp: Vec<f32> = (0..1000).map(|i| i as f32 * 0.004).collect();
    dev.write(&ramp, ChannelId::A, false).unwrap();
    s.run(1000).unwrap();

    let latest = dev.read_latest(100, 0).unwrap();
    assert_eq!(latest.len(), 100);
    assert_eq!(dev.available(), 0);
    assert!((latest[0].voltage(ChannelId::A) - 900.0 * 0.004).abs() < 1e-3);
    assert!((latest[99].voltage(ChannelId::A) - 999.0 * 0.004).abs() < 1e-3);

    // Fewer queued than asked for: nothing is skipped.
    dev.set_mode(ChannelId::A, Mode::HiZ).unwrap();
    s.run(50).unwrap();
    assert_eq!(dev.read_latest(100, 0).unwrap().len(), 50);
}

#[test]
fn cancel_wakes_blocked_reader() {
    let bus = SimulatedBus::with_devices(1);
    let s = session(&bus, config().with_ignore_dataflow(true));
    let dev = s.devices()[0].clone();
    s.start(0).unwrap();

    let reader = thread::spawn(move || dev.read(10_000_000, -1));
    thread::sleep(Duration::from_millis(100));
    s.cancel().unwrap();

    let samples = reader.join().unwrap().unwrap();
    assert!(!samples.is_empty());
    assert!(samples.len() < 10_000_000);
    assert!(s.cancelled());
    assert_eq!(s.state(), State::Idle);
}

#[test]
fn multi_device_runs_stay_aligned() {
    let bus = SimulatedBus::with_devices(3);
    let s = session(&bus, config());
    for dev in s.devices() {
        dev.set_mode(ChannelId::B, Mode::Svmi).unwrap();
        dev.channel(ChannelId::B).sawtooth(0.0, 5.0, 50.0, 0.0).unwrap();
    }
    let batches = s.get_samples(2000).unwrap();
    for i in (0..2000).step_by(97) {
        let v = batches[0][i].voltage(ChannelId::B);
        assert!(batches.iter().all(|b| (b[i].voltage(ChannelId::B) - v).abs() < 1e-3));
    }
}

#[test]
fn dropping_a_streaming_session_stops_it() {
    let bus = SimulatedBus::with_devices(1);
    let s = session(&bus, config().with_hotplug(true).with_hotplug_interval(Duration::from_millis(20)));
    let dev = s.devices()[0].clone();
    s.start(0).unwrap();
    drop(s);
    assert!(dev.session().is_none());
    assert_eq!(bus.channel_mode("SIM0000", 0), Some(0));
}
