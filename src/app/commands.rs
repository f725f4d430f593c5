//! Inbound commands to the machine.
//!
//! These represent actions requested by the outside world (operator
//! console, physical buttons, access-control collaborator) that
//! [`Machine::handle_command`](super::machine::Machine::handle_command)
//! interprets and acts upon.  On the console they arrive as one JSON object
//! per line, e.g. `{"cmd":"jog","direction":"forward","steps":20}`.

use serde::{Deserialize, Serialize};

use crate::config::OutputMode;
use crate::link::Direction;
use crate::sequence::Sequence;

/// Commands that external adapters can send into the machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum AppCommand {
    // --- Axis ---
    Jog {
        direction: Direction,
        #[serde(default)]
        steps: Option<u32>,
    },
    MoveTo {
        position: i64,
    },
    MoveToMin,
    MoveToMax,
    MoveIndex {
        direction: Direction,
    },
    Home,
    AxisStop,
    SetSpeed {
        speed: u32,
    },
    SetPosition {
        position: i64,
    },
    EnableAxis,
    DisableAxis {
        #[serde(default)]
        immediate: bool,
    },

    // --- Fire ---
    Fire,
    StopFire,
    FireToggle,
    FiberMomentary,
    FiberToggle,
    StartFiberSequence,
    StopFiberSequence,
    MoveToA,
    MoveToB,
    SetPositionA {
        angle: u16,
    },
    SetPositionB {
        angle: u16,
    },
    SetInverted {
        inverted: bool,
    },

    // --- Outputs ---
    SetFan {
        on: bool,
    },
    SetRedLights {
        on: bool,
    },
    SetFanMode {
        mode: OutputMode,
    },
    SetLightsMode {
        mode: OutputMode,
    },
    TableForward {
        on: bool,
    },
    TableBackward {
        on: bool,
    },
    StopTable,
    UpdateTiming {
        fan_off_delay_ms: u64,
        lights_off_delay_ms: u64,
    },

    // --- Sequence engine ---
    LoadSequence {
        sequence: Sequence,
    },
    StartSequence,
    PauseSequence,
    ResumeSequence,
    StopSequence,

    // --- Machine ---
    /// Access-control collaborator granted or revoked manual operation.
    AccessChanged {
        granted: bool,
        #[serde(default)]
        context: String,
    },
    EmergencyStop,
    Status,
}

impl AppCommand {
    /// Commands that stay available without an access grant.
    pub fn is_ungated(&self) -> bool {
        matches!(
            self,
            Self::AccessChanged { .. } | Self::EmergencyStop | Self::Status
        )
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Jog { .. } => "jog",
            Self::MoveTo { .. } => "move_to",
            Self::MoveToMin => "move_to_min",
            Self::MoveToMax => "move_to_max",
            Self::MoveIndex { .. } => "move_index",
            Self::Home => "home",
            Self::AxisStop => "axis_stop",
            Self::SetSpeed { .. } => "set_speed",
            Self::SetPosition { .. } => "set_position",
            Self::EnableAxis => "enable_axis",
            Self::DisableAxis { .. } => "disable_axis",
            Self::Fire => "fire",
            Self::StopFire => "stop_fire",
            Self::FireToggle => "fire_toggle",
            Self::FiberMomentary => "fiber_momentary",
            Self::FiberToggle => "fiber_toggle",
            Self::StartFiberSequence => "start_fiber_sequence",
            Self::StopFiberSequence => "stop_fiber_sequence",
            Self::MoveToA => "move_to_a",
            Self::MoveToB => "move_to_b",
            Self::SetPositionA { .. } => "set_position_a",
            Self::SetPositionB { .. } => "set_position_b",
            Self::SetInverted { .. } => "set_inverted",
            Self::SetFan { .. } => "set_fan",
            Self::SetRedLights { .. } => "set_red_lights",
            Self::SetFanMode { .. } => "set_fan_mode",
            Self::SetLightsMode { .. } => "set_lights_mode",
            Self::TableForward { .. } => "table_forward",
            Self::TableBackward { .. } => "table_backward",
            Self::StopTable => "stop_table",
            Self::UpdateTiming { .. } => "update_timing",
            Self::LoadSequence { .. } => "load_sequence",
            Self::StartSequence => "start_sequence",
            Self::PauseSequence => "pause_sequence",
            Self::ResumeSequence => "resume_sequence",
            Self::StopSequence => "stop_sequence",
            Self::AccessChanged { .. } => "access_changed",
            Self::EmergencyStop => "emergency_stop",
            Self::Status => "status",
        }
    }
}
