//! Scripted runs driven through the machine's command surface.

use std::time::Duration;

use laserroom::app::commands::AppCommand;
use laserroom::app::events::MachineEvent;
use laserroom::config::AccessConfig;
use laserroom::drivers::outputs::Output;
use laserroom::error::Error;
use laserroom::link::SimulatedLink;
use laserroom::sequence::engine::SequenceStatus;
use laserroom::sequence::{Level, RunStatus, Sequence, Step};

use crate::mock_hw::{Rig, quick_config, rig, rig_with, wait_until};

const SETTLE: Duration = Duration::from_secs(3);

fn run(r: &Rig, sequence: Sequence) {
    r.machine
        .handle_command(AppCommand::LoadSequence { sequence })
        .unwrap();
    r.machine.handle_command(AppCommand::StartSequence).unwrap();
}

fn status(r: &Rig) -> SequenceStatus {
    r.machine.engine().status()
}

fn finished(r: &Rig) -> bool {
    !r.machine.engine().run_status().is_active()
}

fn messages(s: &SequenceStatus) -> Vec<String> {
    s.log.iter().map(|e| e.message.clone()).collect()
}

#[test]
fn cleaning_pass_from_json_runs_to_completion() {
    let r = rig();
    let sequence: Sequence = serde_json::from_str(
        r#"{
            "name": "clean-pass",
            "description": "one pass over the part",
            "steps": [
                {"action": "fan_on"},
                {"action": "lights_on"},
                {"action": "move_axis", "direction": "in", "steps": 120},
                {"action": "fire", "duration_ms": 60, "delay_after_ms": 10},
                {"action": "wait", "duration": 20},
                {"action": "table_forward", "duration_ms": 30},
                {"action": "go_to_zero"},
                {"action": "lights_off"},
                {"action": "fan_off"}
            ]
        }"#,
    )
    .unwrap();
    run(&r, sequence);
    assert!(wait_until(SETTLE, || finished(&r)));

    let s = status(&r);
    assert_eq!(s.status, RunStatus::Completed, "{:?}", s.last_error);
    assert_eq!((s.steps_completed, s.total_steps), (9, 9));
    assert_eq!(s.progress_percent, 100);
    assert!(s.simulated);
    assert!(
        messages(&s)
            .iter()
            .any(|m| m.starts_with("Sequence completed successfully in"))
    );

    assert_eq!(r.machine.axis().get_position(), 0);
    assert!(!r.machine.fire().is_firing());
    assert_eq!(r.machine.fire().stats().fire_count, 1);
    assert!(!r.machine.outputs().is_on(Output::Fan));
    assert!(!r.machine.outputs().is_on(Output::TableForward));

    assert_eq!(
        r.sink
            .count(|e| matches!(e, MachineEvent::StepCompleted { .. })),
        9
    );
    assert!(r.sink.contains(&MachineEvent::SequenceStatusChanged {
        status: RunStatus::Completed,
        sequence: Some("clean-pass".into()),
    }));
}

#[test]
fn wait_for_input_blocks_until_button_press() {
    let r = rig();
    run(
        &r,
        Sequence {
            name: "operator-gate".into(),
            description: String::new(),
            steps: vec![
                Step::new("wait_for_input")
                    .with("input_id", "button_in")
                    .with("timeout_ms", 0),
                Step::new("fan_on"),
            ],
        },
    );
    std::thread::sleep(Duration::from_millis(150));
    let s = status(&r);
    assert_eq!(s.status, RunStatus::Running);
    assert_eq!(s.current_step, Some(1));
    assert!(!r.machine.outputs().is_on(Output::Fan));

    r.sim.set_level(r.cfg.inputs.button_in_pin, false);
    assert!(wait_until(SETTLE, || finished(&r)));
    assert_eq!(status(&r).status, RunStatus::Completed);
    assert!(r.machine.outputs().is_on(Output::Fan));
}

#[test]
fn table_run_to_limit_stops_at_the_switch() {
    let r = rig();
    run(
        &r,
        Sequence {
            name: "load-part".into(),
            description: String::new(),
            steps: vec![Step::new("table_run_to_front_limit")],
        },
    );
    assert!(wait_until(SETTLE, || {
        r.machine.outputs().is_on(Output::TableForward)
    }));
    r.sim.set_level(r.cfg.outputs.table_front_switch_pin, false);
    assert!(wait_until(SETTLE, || finished(&r)));
    assert_eq!(status(&r).status, RunStatus::Completed);
    assert!(!r.machine.outputs().is_on(Output::TableForward));
}

#[test]
fn table_run_without_switch_fails_the_run() {
    let r = rig();
    run(
        &r,
        Sequence {
            name: "stuck-table".into(),
            description: String::new(),
            steps: vec![Step::new("table_run_to_back_limit"), Step::new("fan_on")],
        },
    );
    assert!(wait_until(SETTLE, || finished(&r)));
    let s = status(&r);
    assert_eq!(s.status, RunStatus::Error);
    assert_eq!(s.steps_completed, 0);
    assert!(s.last_error.is_some());
    assert!(s.log.iter().any(|e| e.level == Level::Error));
    assert!(!r.machine.outputs().is_on(Output::TableBackward));
    assert!(!r.machine.outputs().is_on(Output::Fan));
}

#[test]
fn pause_releases_the_trigger_and_resume_reengages() {
    let r = rig();
    let servo = r.cfg.fire.servo_pin;
    run(
        &r,
        Sequence {
            name: "long-burn".into(),
            description: String::new(),
            steps: vec![Step::new("fire").with("duration_ms", 300)],
        },
    );
    assert!(wait_until(SETTLE, || r.machine.fire().is_firing()));

    r.machine.handle_command(AppCommand::PauseSequence).unwrap();
    assert!(wait_until(SETTLE, || {
        r.machine.engine().run_status() == RunStatus::Paused
    }));
    assert_eq!(r.sim.servo_angle(servo), Some(r.cfg.fire.position_a));
    assert!(!r.machine.fire().is_firing());
    assert_eq!(
        r.machine.handle_command(AppCommand::PauseSequence).err(),
        Some(Error::NotReady("sequence not running"))
    );

    r.machine.handle_command(AppCommand::ResumeSequence).unwrap();
    assert!(wait_until(SETTLE, || r.machine.fire().is_firing()));
    assert!(wait_until(SETTLE, || finished(&r)));
    assert_eq!(status(&r).status, RunStatus::Completed);
    assert_eq!(r.sim.servo_angle(servo), Some(r.cfg.fire.position_a));
    let log = messages(&status(&r));
    let paused = log.iter().position(|m| m == "Sequence paused");
    let resumed = log.iter().position(|m| m == "Sequence resumed");
    assert!(paused.is_some() && resumed.is_some(), "{log:?}");
    assert!(paused < resumed, "{log:?}");
    assert_eq!(log.iter().filter(|m| *m == "Sequence paused").count(), 1);

    // One scripted firing, one record, however long the pause.
    let stats = r.machine.fire().stats();
    assert_eq!(stats.history().len(), 1);
    assert_eq!(stats.fire_count, 1);
    assert!(stats.last_duration_ms >= 300, "{}", stats.last_duration_ms);
}

#[test]
fn stop_interrupts_axis_travel() {
    let mut cfg = quick_config();
    cfg.axis.jog_speed = 100;
    let r = rig_with(SimulatedLink::new(), cfg);
    run(
        &r,
        Sequence {
            name: "slow-move".into(),
            description: String::new(),
            steps: vec![Step::new("move_axis").with("direction", "out").with("steps", 400)],
        },
    );
    assert!(wait_until(SETTLE, || r.machine.axis().is_moving()));
    std::thread::sleep(Duration::from_millis(100));

    r.machine.handle_command(AppCommand::StopSequence).unwrap();
    assert_eq!(r.machine.engine().run_status(), RunStatus::Idle);
    assert!(wait_until(SETTLE, || !r.machine.axis().is_moving()));
    let pos = r.machine.axis().get_position();
    assert!(pos < 0 && pos > -400, "position {pos}");
    assert!(
        messages(&status(&r))
            .iter()
            .any(|m| m == "Sequence stopped by user")
    );
}

#[test]
fn emergency_stop_makes_everything_safe_mid_run() {
    let r = rig();
    run(
        &r,
        Sequence {
            name: "busy".into(),
            description: String::new(),
            steps: vec![
                Step::new("fan_on"),
                Step::new("fire"),
                Step::new("table_backward").with("duration_ms", 5_000),
            ],
        },
    );
    assert!(wait_until(SETTLE, || {
        r.machine.outputs().is_on(Output::TableBackward)
    }));
    r.machine.handle_command(AppCommand::EmergencyStop).unwrap();

    assert_eq!(r.machine.engine().run_status(), RunStatus::Idle);
    assert!(!r.machine.fire().is_firing());
    let outputs = r.machine.status().outputs;
    assert!(!outputs.fan_on && !outputs.table_backward);
    assert!(r.sink.contains(&MachineEvent::EmergencyStop));
}

#[test]
fn bad_step_fails_only_when_reached() {
    let r = rig();
    run(
        &r,
        Sequence {
            name: "typo".into(),
            description: String::new(),
            steps: vec![Step::new("fan_on"), Step::new("fan_onn")],
        },
    );
    assert!(wait_until(SETTLE, || finished(&r)));
    let s = status(&r);
    assert_eq!(s.status, RunStatus::Error);
    assert_eq!(s.steps_completed, 1);
    assert!(s.last_error.unwrap().contains("fan_onn"));
    assert!(r.machine.outputs().is_on(Output::Fan));
}

#[test]
fn sequence_commands_respect_the_access_gate() {
    let mut cfg = quick_config();
    cfg.access = AccessConfig { required: true };
    let r = rig_with(SimulatedLink::with_instant_moves(), cfg);
    let sequence = Sequence {
        name: "gated".into(),
        description: String::new(),
        steps: vec![Step::new("fan_on")],
    };
    assert_eq!(
        r.machine
            .handle_command(AppCommand::LoadSequence {
                sequence: sequence.clone()
            })
            .err(),
        Some(Error::NotReady("access not granted"))
    );
    r.machine
        .handle_command(AppCommand::AccessChanged {
            granted: true,
            context: "badge 7".into(),
        })
        .unwrap();
    run(&r, sequence);
    assert!(wait_until(SETTLE, || finished(&r)));
    assert_eq!(status(&r).status, RunStatus::Completed);
}

#[test]
fn move_then_fire_counts_one_firing() {
    let r = rig();
    run(
        &r,
        Sequence {
            name: "move-fire".into(),
            description: String::new(),
            steps: vec![
                Step::new("move_axis").with("direction", "in").with("steps", 100),
                Step::new("fire").with("duration_ms", 80),
            ],
        },
    );
    assert!(wait_until(SETTLE, || finished(&r)));

    let s = status(&r);
    assert_eq!(s.status, RunStatus::Completed, "{:?}", s.last_error);
    assert_eq!(r.machine.axis().get_position(), 100);
    let stats = r.machine.fire().stats();
    assert_eq!(stats.fire_count, 1);
    assert!(stats.last_duration_ms >= 80);

    let log = messages(&s);
    assert!(log.iter().any(|m| m == "Starting sequence: move-fire"));
    assert!(log.last().unwrap().starts_with("Sequence completed successfully in"));
    let per_step: Vec<usize> = s.log.iter().filter_map(|e| e.step_index).collect();
    assert!(per_step.contains(&0) && per_step.contains(&1));
}

#[test]
fn short_firing_is_not_counted() {
    let r = rig();
    run(
        &r,
        Sequence {
            name: "tap".into(),
            description: String::new(),
            steps: vec![Step::new("fire").with("duration_ms", 10)],
        },
    );
    assert!(wait_until(SETTLE, || finished(&r)));
    assert_eq!(status(&r).status, RunStatus::Completed);
    assert_eq!(r.machine.fire().stats().fire_count, 0);
}

#[test]
fn pause_and_resume_skip_no_step() {
    let r = rig();
    let steps = (0..4)
        .map(|_| Step::new("wait").with("duration_ms", 80))
        .collect();
    run(
        &r,
        Sequence {
            name: "slow-waits".into(),
            description: String::new(),
            steps,
        },
    );
    assert!(wait_until(SETTLE, || status(&r).steps_completed >= 1));
    r.machine.handle_command(AppCommand::PauseSequence).unwrap();
    assert!(wait_until(SETTLE, || {
        r.machine.engine().run_status() == RunStatus::Paused
    }));
    let held = status(&r).steps_completed;
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(status(&r).steps_completed, held);

    r.machine.handle_command(AppCommand::ResumeSequence).unwrap();
    assert!(wait_until(SETTLE, || finished(&r)));
    assert_eq!(status(&r).status, RunStatus::Completed);

    let order: Vec<usize> = r
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            MachineEvent::StepCompleted { index, .. } => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec![0, 1, 2, 3]);
}
