//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing each [`MachineEvent`] as one
//! structured line through the `log` facade.  Safety-relevant events
//! (failed homing, emergency stop) go out at `warn`/`error`.

use log::{error, info, warn};

use crate::app::events::MachineEvent;
use crate::app::ports::EventSink;

/// Adapter that logs every [`MachineEvent`].
#[derive(Debug, Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&self, event: &MachineEvent) {
        match event {
            MachineEvent::AxisMoved { position } => info!("AXIS  | moved, position={position}"),
            MachineEvent::AxisStopped { position } => info!("AXIS  | stopped, position={position}"),
            MachineEvent::HomingCompleted => info!("AXIS  | homed, position=0"),
            MachineEvent::HomingFailed { reason } => warn!("AXIS  | homing failed: {reason}"),
            MachineEvent::LimitTriggered { interlock } => warn!("LIMIT | {interlock}"),
            MachineEvent::FiringStarted { mode } => info!("FIRE  | started, mode={mode:?}"),
            MachineEvent::FireRecorded { record } => info!(
                "FIRE  | ended, {} ms, mode={:?}{}",
                record.duration_ms,
                record.mode,
                if record.counted { "" } else { " (below threshold)" }
            ),
            MachineEvent::OutputChanged { output, on } => {
                info!("OUT   | {output:?} {}", if *on { "ON" } else { "OFF" });
            }
            MachineEvent::SequenceStatusChanged { status, sequence } => info!(
                "SEQ   | {status:?} ({})",
                sequence.as_deref().unwrap_or("none")
            ),
            MachineEvent::StepCompleted { index, action } => {
                info!("SEQ   | step {} done: {action}", index + 1);
            }
            MachineEvent::AccessChanged { granted, context } => info!(
                "ACCESS| {} ({context})",
                if *granted { "granted" } else { "revoked" }
            ),
            MachineEvent::EmergencyStop => error!("ESTOP | emergency stop"),
        }
    }
}
