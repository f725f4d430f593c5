//! Firing through commands, physical buttons and the statistics store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use laserroom::adapters::channel_sink::{
    FIRE_COUNT_KEY, FanoutSink, StatsSink, load_totals,
};
use laserroom::adapters::store::JsonFileConfig;
use laserroom::app::commands::AppCommand;
use laserroom::app::events::MachineEvent;
use laserroom::app::ports::{ConfigPort, EventSink};
use laserroom::app::{Machine, Reply};
use laserroom::drivers::fire::{FireMode, Toggle};
use laserroom::link::SimulatedLink;

use crate::mock_hw::{CollectingSink, quick_config, rig};

/// Feed monitor commands into the machine until `done` holds.
fn pump(machine: &Machine, rx: &Receiver<AppCommand>, done: impl Fn(&Machine) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if done(machine) {
            return true;
        }
        if let Ok(cmd) = rx.recv_timeout(Duration::from_millis(10)) {
            let _ = machine.handle_command(cmd);
        }
    }
    done(machine)
}

#[test]
fn counted_firings_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("laserroom.json");
    let cfg = quick_config();

    {
        let store: Arc<dyn ConfigPort> = Arc::new(JsonFileConfig::open(&path).unwrap());
        let sink: Arc<dyn EventSink> =
            Arc::new(FanoutSink::new().with(Arc::new(StatsSink::new(Arc::clone(&store)))));
        let machine = Machine::new(
            Arc::new(SimulatedLink::with_instant_moves()),
            cfg.clone(),
            sink,
        )
        .unwrap();
        machine.handle_command(AppCommand::Fire).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        machine.handle_command(AppCommand::StopFire).unwrap();

        // Below the threshold: recorded but not counted.
        machine.handle_command(AppCommand::Fire).unwrap();
        machine.handle_command(AppCommand::StopFire).unwrap();
        assert_eq!(store.get(FIRE_COUNT_KEY), Some(1.into()));
    }

    let store = JsonFileConfig::open(&path).unwrap();
    let (count, total_ms) = load_totals(&store);
    assert_eq!(count, 1);
    assert!(total_ms >= 80, "{total_ms} ms");

    let machine = Machine::new(
        Arc::new(SimulatedLink::with_instant_moves()),
        cfg,
        Arc::new(CollectingSink::default()),
    )
    .unwrap();
    machine.fire().seed_stats(count, total_ms);
    let stats = machine.fire().stats();
    assert_eq!((stats.fire_count, stats.total_fire_time_ms), (1, total_ms));
}

#[test]
fn stop_fire_reply_carries_the_record() {
    let r = rig();
    r.machine.handle_command(AppCommand::Fire).unwrap();
    std::thread::sleep(Duration::from_millis(60));
    match r.machine.handle_command(AppCommand::StopFire).unwrap() {
        Reply::Record { record: Some(rec) } => {
            assert!(rec.counted);
            assert_eq!(rec.mode, FireMode::Manual);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        r.machine.handle_command(AppCommand::StopFire),
        Ok(Reply::Record { record: None })
    ));
    assert_eq!(
        r.sink.count(|e| matches!(e, MachineEvent::FireRecorded { .. })),
        1
    );
}

#[test]
fn fire_button_press_and_release_drive_the_servo() {
    let r = rig();
    let (tx, rx) = crossbeam_channel::unbounded();
    r.machine.start_monitors(tx).unwrap();
    let fire_pin = r.cfg.inputs.fire_button_pin;
    let servo = r.cfg.fire.servo_pin;

    r.sim.set_level(fire_pin, false);
    assert!(pump(&r.machine, &rx, |m| m.fire().is_firing()));
    assert_eq!(r.sim.servo_angle(servo), Some(r.cfg.fire.position_b));

    r.sim.set_level(fire_pin, true);
    assert!(pump(&r.machine, &rx, |m| !m.fire().is_firing()));
    assert_eq!(r.sim.servo_angle(servo), Some(r.cfg.fire.position_a));
    r.machine.shutdown().unwrap();
}

#[test]
fn fire_button_long_press_starts_the_fiber_pattern() {
    let r = rig();
    let (tx, rx) = crossbeam_channel::unbounded();
    r.machine.start_monitors(tx).unwrap();
    let fire_pin = r.cfg.inputs.fire_button_pin;

    r.sim.set_level(fire_pin, false);
    assert!(pump(&r.machine, &rx, |m| m.fire().sequence_mode()));
    r.sim.set_level(fire_pin, true);

    // Releasing after a long press leaves the pattern running.
    std::thread::sleep(Duration::from_millis(100));
    while let Ok(cmd) = rx.try_recv() {
        let _ = r.machine.handle_command(cmd);
    }
    assert!(r.machine.fire().sequence_mode());

    r.machine
        .handle_command(AppCommand::StopFiberSequence)
        .unwrap();
    assert!(!r.machine.fire().sequence_mode());
    r.machine.shutdown().unwrap();
}

#[test]
fn invert_switch_swaps_rest_and_fire_angles() {
    let r = rig();
    let (tx, rx) = crossbeam_channel::unbounded();
    r.machine.start_monitors(tx).unwrap();

    r.sim.set_level(r.cfg.inputs.invert_switch_pin, false);
    assert!(pump(&r.machine, &rx, |m| m.fire().status().inverted));

    r.machine.handle_command(AppCommand::Fire).unwrap();
    assert_eq!(
        r.sim.servo_angle(r.cfg.fire.servo_pin),
        Some(r.cfg.fire.position_a)
    );
    r.machine.handle_command(AppCommand::StopFire).unwrap();
    assert_eq!(
        r.sim.servo_angle(r.cfg.fire.servo_pin),
        Some(r.cfg.fire.position_b)
    );
    r.machine.shutdown().unwrap();
}

#[test]
fn fiber_toggle_latches_until_second_toggle() {
    let r = rig();
    assert!(matches!(
        r.machine.handle_command(AppCommand::FiberToggle),
        Ok(Reply::Toggle {
            toggle: Toggle::Started
        })
    ));
    assert!(r.machine.fire().sequence_mode());
    std::thread::sleep(Duration::from_millis(80));
    match r.machine.handle_command(AppCommand::FiberToggle).unwrap() {
        Reply::Toggle {
            toggle: Toggle::Stopped(rec),
        } => assert_eq!(rec.mode, FireMode::Fiber),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!r.machine.fire().sequence_mode());
}
