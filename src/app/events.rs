//! Outbound machine events.
//!
//! Actuators and the sequence engine emit these through the
//! [`EventSink`](super::ports::EventSink) port.  Adapters on the other
//! side decide what to do with them: write a log line, forward them on a
//! channel to a UI, or persist firing statistics.

use serde::Serialize;

use crate::drivers::fire::{FireMode, FireRecord};
use crate::drivers::outputs::Output;
use crate::error::Interlock;
use crate::sequence::RunStatus;

/// Structured events emitted by the orchestration core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MachineEvent {
    /// Axis finished (or was stopped during) a move.
    AxisMoved { position: i64 },

    AxisStopped { position: i64 },

    HomingCompleted,

    HomingFailed { reason: String },

    /// A limit or end switch rose while travelling toward it.
    LimitTriggered { interlock: Interlock },

    FiringStarted { mode: FireMode },

    /// One firing ended; carries its duration and whether it counted.
    FireRecorded { record: FireRecord },

    OutputChanged { output: Output, on: bool },

    SequenceStatusChanged {
        status: RunStatus,
        sequence: Option<String>,
    },

    StepCompleted { index: usize, action: String },

    AccessChanged { granted: bool, context: String },

    EmergencyStop,
}
