//! Relays under the output monitor: auto fan/lights and table interlocks.

use std::time::Duration;

use laserroom::app::commands::AppCommand;
use laserroom::app::events::MachineEvent;
use laserroom::config::OutputMode;
use laserroom::drivers::outputs::Output;
use laserroom::error::{Error, Interlock};

use crate::mock_hw::{Rig, rig, wait_until};

const SETTLE: Duration = Duration::from_secs(2);

fn monitored() -> Rig {
    let r = rig();
    let (tx, _rx) = crossbeam_channel::unbounded();
    r.machine.start_monitors(tx).unwrap();
    r
}

#[test]
fn fan_and_lights_follow_firing_then_time_out() {
    let r = monitored();
    let outputs = r.machine.outputs();

    r.machine.handle_command(AppCommand::Fire).unwrap();
    assert!(wait_until(SETTLE, || {
        outputs.is_on(Output::Fan) && outputs.is_on(Output::RedLights)
    }));
    assert_eq!(r.sim.level(r.cfg.outputs.fan_pin), Some(true));

    r.machine.handle_command(AppCommand::StopFire).unwrap();
    // Lights have the shorter delay.
    assert!(wait_until(SETTLE, || !outputs.is_on(Output::RedLights)));
    assert!(outputs.is_on(Output::Fan));
    assert!(wait_until(SETTLE, || !outputs.is_on(Output::Fan)));

    assert!(r.sink.contains(&MachineEvent::OutputChanged {
        output: Output::Fan,
        on: false
    }));
    r.machine.shutdown().unwrap();
}

#[test]
fn manual_fan_ignores_the_servo() {
    let r = monitored();
    r.machine
        .handle_command(AppCommand::SetFanMode {
            mode: OutputMode::Manual,
        })
        .unwrap();
    r.machine.handle_command(AppCommand::SetFan { on: true }).unwrap();

    r.machine.handle_command(AppCommand::Fire).unwrap();
    r.machine.handle_command(AppCommand::StopFire).unwrap();
    std::thread::sleep(Duration::from_millis(400));
    assert!(r.machine.outputs().is_on(Output::Fan));
    assert!(!r.machine.outputs().is_on(Output::RedLights));
    r.machine.shutdown().unwrap();
}

#[test]
fn front_switch_stops_the_table_and_blocks_forward() {
    let r = monitored();
    let front = r.cfg.outputs.table_front_switch_pin;

    r.machine.handle_command(AppCommand::TableForward { on: true }).unwrap();
    assert_eq!(r.sim.level(r.cfg.outputs.table_forward_pin), Some(true));

    r.sim.set_level(front, false);
    assert!(wait_until(SETTLE, || {
        !r.machine.outputs().is_on(Output::TableForward)
    }));
    assert_eq!(r.sim.level(r.cfg.outputs.table_forward_pin), Some(false));
    assert!(r.sink.contains(&MachineEvent::LimitTriggered {
        interlock: Interlock::TableFrontLimit
    }));

    assert_eq!(
        r.machine
            .handle_command(AppCommand::TableForward { on: true })
            .err(),
        Some(Error::LimitViolation(Interlock::TableFrontLimit))
    );
    r.machine.handle_command(AppCommand::TableBackward { on: true }).unwrap();
    assert!(r.machine.outputs().is_on(Output::TableBackward));
    r.machine.shutdown().unwrap();
}

#[test]
fn table_directions_never_overlap() {
    let r = rig();
    r.machine.handle_command(AppCommand::TableForward { on: true }).unwrap();
    r.machine.handle_command(AppCommand::TableBackward { on: true }).unwrap();
    let status = r.machine.status().outputs;
    assert!(!status.table_forward);
    assert!(status.table_backward);
    assert_eq!(r.sim.level(r.cfg.outputs.table_forward_pin), Some(false));

    r.machine.handle_command(AppCommand::StopTable).unwrap();
    assert!(!r.machine.status().outputs.table_moving);
}

#[test]
fn timing_update_is_reported_in_status() {
    let r = rig();
    r.machine
        .handle_command(AppCommand::UpdateTiming {
            fan_off_delay_ms: 5_000,
            lights_off_delay_ms: 1_000,
        })
        .unwrap();
    r.machine.handle_command(AppCommand::SetFan { on: true }).unwrap();
    let status = r.machine.status().outputs;
    assert_eq!(status.fan_off_delay_ms, 5_000);
    assert_eq!(status.lights_off_delay_ms, 1_000);
    let remaining = status.fan_time_remaining_ms.unwrap();
    assert!(remaining <= 5_000 && remaining > 4_000, "{remaining}");
}
