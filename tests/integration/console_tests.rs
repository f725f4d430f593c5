//! The JSON console surface, link selection and the persisted config.

use std::sync::Arc;
use std::time::Duration;

use laserroom::adapters::store::JsonFileConfig;
use laserroom::app::commands::AppCommand;
use laserroom::app::ports::ConfigError;
use laserroom::config::{BackendKind, LinkConfig, MachineConfig};
use laserroom::error::Error;
use laserroom::link::{self, Backend, DeviceLink, SimulatedLink};
use laserroom::sequence::RunStatus;
use serde_json::{Value, json};

use crate::mock_hw::{rig, wait_until};

fn reply_json(r: &crate::mock_hw::Rig, line: &str) -> Value {
    let cmd: AppCommand = serde_json::from_str(line).unwrap();
    let reply = r.machine.handle_command(cmd).unwrap();
    serde_json::to_value(&reply).unwrap()
}

#[test]
fn console_lines_drive_a_sequence() {
    let r = rig();
    let load = r#"{"cmd":"load_sequence","sequence":{"name":"console","steps":[
        {"action":"lights_on"},
        {"action":"wait","duration_ms":10},
        {"action":"lights_off"}
    ]}}"#
        .replace('\n', "");
    assert_eq!(reply_json(&r, &load), json!({"reply": "ok"}));
    assert_eq!(
        reply_json(&r, r#"{"cmd":"start_sequence"}"#),
        json!({"reply": "ok"})
    );
    assert!(wait_until(Duration::from_secs(2), || {
        r.machine.engine().run_status() == RunStatus::Completed
    }));

    let status = reply_json(&r, r#"{"cmd":"status"}"#);
    assert_eq!(status["reply"], "status");
    assert_eq!(status["status"]["backend"], "simulated");
    assert_eq!(status["status"]["sequence"]["status"], "completed");
    assert_eq!(status["status"]["sequence"]["sequence_name"], "console");
    assert_eq!(status["status"]["outputs"]["red_lights_on"], false);
}

#[test]
fn replies_are_tagged() {
    let r = rig();
    assert_eq!(
        reply_json(&r, r#"{"cmd":"move_to","position":40}"#),
        json!({"reply": "motion", "motion": "started"})
    );
    assert_eq!(
        reply_json(&r, r#"{"cmd":"set_position_b","angle":200}"#),
        json!({"reply": "angle", "angle": 180})
    );
    assert_eq!(
        reply_json(&r, r#"{"cmd":"fire_toggle"}"#),
        json!({"reply": "toggle", "toggle": "started"})
    );
    assert_eq!(
        reply_json(&r, r#"{"cmd":"emergency_stop"}"#),
        json!({"reply": "ok"})
    );
}

#[test]
fn unknown_command_does_not_parse() {
    assert!(serde_json::from_str::<AppCommand>(r#"{"cmd":"self_destruct"}"#).is_err());
    assert!(serde_json::from_str::<AppCommand>(r#"{"cmd":"move_to"}"#).is_err());
}

#[test]
fn auto_backend_falls_back_to_simulation() {
    let cfg = LinkConfig::default();
    let link = link::connect(&cfg, |_| {
        Err(Error::LinkUnavailable("no coprocessor on /dev/ttyUSB0".into()))
    })
    .unwrap();
    assert_eq!(link.backend(), Backend::Simulated);
}

#[test]
fn forced_hardware_failure_is_fatal() {
    let cfg = LinkConfig {
        force_hardware: true,
        ..LinkConfig::default()
    };
    let result = link::connect(&cfg, |_| Err(Error::Timeout("probe".into())));
    assert!(matches!(result, Err(Error::LinkUnavailable(_))));
}

#[test]
fn simulated_backend_never_probes_hardware() {
    let cfg = LinkConfig {
        backend: BackendKind::Simulated,
        ..LinkConfig::default()
    };
    let link = link::connect(&cfg, |_| -> laserroom::error::Result<Arc<dyn DeviceLink>> {
        panic!("hardware opener called")
    })
    .unwrap();
    assert!(link.is_simulated());
}

#[test]
fn hardware_link_is_used_when_it_opens() {
    let cfg = LinkConfig::default();
    let link = link::connect(&cfg, |_| Ok(Arc::new(SimulatedLink::new()) as Arc<dyn DeviceLink>));
    assert!(link.is_ok());
}

#[test]
fn stored_config_is_reloaded_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("station.json");

    let mut cfg = MachineConfig::default();
    cfg.axis.max_position = 800;
    cfg.fire.position_b = 75;
    cfg.outputs.fan_off_delay_ms = 30_000;
    cfg.store(&JsonFileConfig::open(&path).unwrap()).unwrap();

    let loaded = MachineConfig::load(&JsonFileConfig::open(&path).unwrap()).unwrap();
    assert_eq!(loaded, cfg);
}

#[test]
fn invalid_stored_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("station.json");
    std::fs::write(
        &path,
        r#"{"axis.min_position": 100, "axis.max_position": 100}"#,
    )
    .unwrap();
    let store = JsonFileConfig::open(&path).unwrap();
    assert!(matches!(
        MachineConfig::load(&store),
        Err(ConfigError::ValidationFailed(_))
    ));
}
