//! Axis commands routed through the machine.

use std::time::Duration;

use laserroom::app::Reply;
use laserroom::app::commands::AppCommand;
use laserroom::app::events::MachineEvent;
use laserroom::drivers::stepper::Motion;
use laserroom::error::{Error, Interlock};
use laserroom::link::sim::Switch;
use laserroom::link::{Direction, SimulatedLink};

use crate::mock_hw::{quick_config, rig, rig_with, wait_until};

const SETTLE: Duration = Duration::from_secs(2);

#[test]
fn jog_command_runs_in_background_and_reports_position() {
    let r = rig();
    let reply = r
        .machine
        .handle_command(AppCommand::Jog {
            direction: Direction::Positive,
            steps: Some(30),
        })
        .unwrap();
    assert!(matches!(
        reply,
        Reply::Motion {
            motion: Motion::Started
        }
    ));
    assert!(wait_until(SETTLE, || !r.machine.axis().is_moving()));
    assert_eq!(r.machine.axis().get_position(), 30);
    assert!(r.sink.contains(&MachineEvent::AxisMoved { position: 30 }));
}

#[test]
fn travel_ends_are_reachable_by_command() {
    let r = rig();
    r.machine.handle_command(AppCommand::MoveToMin).unwrap();
    assert!(wait_until(SETTLE, || !r.machine.axis().is_moving()));
    assert_eq!(r.machine.axis().get_position(), r.cfg.axis.min_position);

    r.machine.handle_command(AppCommand::MoveToMax).unwrap();
    assert!(wait_until(SETTLE, || !r.machine.axis().is_moving()));
    assert_eq!(r.machine.axis().get_position(), r.cfg.axis.max_position);
}

#[test]
fn second_move_is_refused_while_first_is_running() {
    let mut cfg = quick_config();
    cfg.axis.speed = 200;
    let r = rig_with(SimulatedLink::new(), cfg);
    r.machine.handle_command(AppCommand::MoveTo { position: 300 }).unwrap();
    assert!(matches!(
        r.machine.handle_command(AppCommand::MoveTo { position: -300 }),
        Err(Error::NotReady(_))
    ));
    r.machine.handle_command(AppCommand::AxisStop).unwrap();
    assert!(wait_until(SETTLE, || !r.machine.axis().is_moving()));
}

#[test]
fn limit_monitor_stops_motion_into_switch() {
    let mut cfg = quick_config();
    cfg.axis.speed = 200;
    let r = rig_with(SimulatedLink::new(), cfg);
    let (tx, _rx) = crossbeam_channel::unbounded();
    r.machine.start_monitors(tx).unwrap();

    r.machine.handle_command(AppCommand::MoveToMax).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    r.sim.override_switch(r.cfg.axis.axis_id, Switch::LimitB, Some(true));

    assert!(wait_until(SETTLE, || !r.machine.axis().is_moving()));
    assert!(r.sink.contains(&MachineEvent::LimitTriggered {
        interlock: Interlock::LimitB
    }));
    let pos = r.machine.axis().get_position();
    assert!(pos > 0 && pos < r.cfg.axis.max_position, "position {pos}");
    r.machine.shutdown().unwrap();
}

#[test]
fn home_command_zeroes_the_axis() {
    let r = rig();
    r.machine.handle_command(AppCommand::MoveTo { position: 120 }).unwrap();
    assert!(wait_until(SETTLE, || !r.machine.axis().is_moving()));

    r.machine.handle_command(AppCommand::Home).unwrap();
    assert!(wait_until(SETTLE, || !r.machine.axis().is_homing()));
    assert_eq!(r.machine.axis().get_position(), 0);
    assert!(r.sink.contains(&MachineEvent::HomingCompleted));
}

#[test]
fn homing_is_refused_while_the_laser_fires() {
    let r = rig();
    r.machine.handle_command(AppCommand::Fire).unwrap();
    assert_eq!(
        r.machine.handle_command(AppCommand::Home).err(),
        Some(Error::LimitViolation(Interlock::FiringInProgress))
    );
    r.machine.handle_command(AppCommand::StopFire).unwrap();
    r.machine.handle_command(AppCommand::Home).unwrap();
    assert!(wait_until(SETTLE, || !r.machine.axis().is_homing()));
}

#[test]
fn disabled_axis_refuses_jog_until_enabled() {
    let r = rig();
    r.machine
        .handle_command(AppCommand::DisableAxis { immediate: true })
        .unwrap();
    assert_eq!(
        r.machine
            .handle_command(AppCommand::Jog {
                direction: Direction::Negative,
                steps: None,
            })
            .err(),
        Some(Error::NotReady("axis disabled"))
    );
    r.machine.handle_command(AppCommand::EnableAxis).unwrap();
    r.machine
        .handle_command(AppCommand::Jog {
            direction: Direction::Negative,
            steps: None,
        })
        .unwrap();
    assert!(wait_until(SETTLE, || !r.machine.axis().is_moving()));
    assert_eq!(r.machine.axis().get_position(), -i64::from(r.cfg.axis.jog_step_size));
}
