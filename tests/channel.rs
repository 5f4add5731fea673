use std::sync::Arc;

use smu::{ChannelId, Mode, Session, SessionConfig, SimulatedBus};

fn session(bus: &SimulatedBus) -> Session {
    let config = SessionConfig::default().with_hotplug(false).with_queue_size(10_000);
    let session = Session::new(Arc::new(bus.clone()), config).unwrap();
    session.add_all().unwrap();
    session
}

#[test]
fn square_wave_comes_back() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = session(&bus);
    let ch = s.devices()[0].channel(ChannelId::A);
    ch.set_mode(Mode::Svmi).unwrap();
    ch.square(1.0, 4.0, 100.0, 0.0, 0.5).unwrap();

    let samples = ch.get_samples(200).unwrap();
    assert_eq!(samples.len(), 200);
    for (i, [v, _]) in samples.iter().enumerate() {
        let expected = if i % 100 < 50 { 1.0 } else { 4.0 };
        assert!((v - expected).abs() < 1e-3, "sample {}: {}", i, v);
    }
}

#[test]
fn sine_wave_peaks_at_phase_zero() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = session(&bus);
    let ch = s.devices()[0].channel(ChannelId::B);
    ch.set_mode(Mode::Svmi).unwrap();
    ch.sine(0.0, 5.0, 100.0, 0.0).unwrap();

    let samples = ch.get_samples(100).unwrap();
    assert!(samples[0][0] > 4.99);
    assert!(samples[50][0] < 0.01);
    assert!((samples[25][0] - 2.5).abs() < 0.01);
}

#[test]
fn other_channel_is_unaffected() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = session(&bus);
    let dev = s.devices()[0].clone();
    dev.channel(ChannelId::A).set_mode(Mode::Svmi).unwrap();
    dev.channel(ChannelId::A).constant(3.3).unwrap();

    let b = dev.channel(ChannelId::B).get_samples(100).unwrap();
    assert!(b.iter().all(|[v, i]| v.abs() < 1e-3 && i.abs() < 1e-3));
}

#[test]
fn mode_change_drops_queued_output() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = session(&bus);
    let ch = s.devices()[0].channel(ChannelId::A);
    ch.set_mode(Mode::Svmi).unwrap();
    ch.write(&[3.0; 10], false).unwrap();
    ch.set_mode(Mode::Simv).unwrap();
    ch.set_mode(Mode::Svmi).unwrap();

    let err = ch.get_samples(10).unwrap_err();
    assert!(err.is_dataflow());
}

#[test]
fn mode_tokens_round_trip() {
    let bus = SimulatedBus::with_devices(1).with_realtime(false);
    let s = session(&bus);
    let ch = s.devices()[0].channel(ChannelId::B);
    ch.set_mode_token(Mode::Simv.token()).unwrap();
    assert_eq!(ch.mode(), Mode::Simv);
    assert_eq!(ch.set_mode_token(2).unwrap_err().errno(), libc::EINVAL);
    assert_eq!(ch.mode(), Mode::Simv);
}
