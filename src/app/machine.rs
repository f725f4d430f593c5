//! Machine context: the owned root of the orchestration core.
//!
//! [`Machine`] builds every actuator on one shared [`DeviceLink`], wires
//! the sequence engine to them, and is the single place [`AppCommand`]s
//! are interpreted.  There are no globals: whoever owns the `Machine`
//! owns the hardware.
//!
//! ```text
//!  console ──┐                       ┌──▶ StepperAxis ─┐
//!  buttons ──┼─▶ AppCommand ─▶ Machine ─▶ FireControl ─┼─▶ DeviceLink
//!  access  ──┘                       ├──▶ OutputBank  ─┘
//!                                    └──▶ SequenceEngine
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{error, info, warn};
use serde::Serialize;

use crate::config::MachineConfig;
use crate::drivers::fire::{FireControl, FireRecord, FireStatus, Toggle};
use crate::drivers::inputs::InputMonitor;
use crate::drivers::outputs::{OutputBank, OutputStatus, TableDirection};
use crate::drivers::stepper::{AxisStatus, DisableMode, Motion, MoveMode, StepperAxis};
use crate::drivers::worker::Worker;
use crate::error::{Error, Result};
use crate::link::{Backend, DeviceLink};
use crate::safety::SafetySupervisor;
use crate::sequence::{SequenceEngine, SequenceStatus};
use crate::sync::{CancelToken, lock};

use super::commands::AppCommand;
use super::events::MachineEvent;
use super::ports::{EventSink, InputProbe};

const MONITOR_JOIN: Duration = Duration::from_secs(1);

// ───────────────────────────────────────────────────────────────
// Replies and status
// ───────────────────────────────────────────────────────────────

/// Result of a handled command.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Motion { motion: Motion },
    Toggle { toggle: Toggle },
    /// A firing ended (or nothing was firing).
    Record { record: Option<FireRecord> },
    /// Whether a fiber pattern was started.
    Started { started: bool },
    /// Angle stored after clamping.
    Angle { angle: u16 },
    Status { status: Box<MachineStatus> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessStatus {
    pub required: bool,
    pub granted: bool,
    pub context: String,
}

/// Aggregated snapshot of every subsystem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineStatus {
    pub backend: Backend,
    pub axis: AxisStatus,
    pub fire: FireStatus,
    pub outputs: OutputStatus,
    pub sequence: SequenceStatus,
    pub access: AccessStatus,
    /// Safety supervisor activity bits.
    pub safety_mask: u8,
}

// ───────────────────────────────────────────────────────────────
// Input probe for wait_for_input steps
// ───────────────────────────────────────────────────────────────

/// Buttons come from the input monitor, table end switches from the
/// output bank.
pub struct MachineInputs {
    inputs: Arc<InputMonitor>,
    outputs: Arc<OutputBank>,
}

impl MachineInputs {
    fn table_switch(&self, direction: TableDirection) -> bool {
        self.outputs.at_limit(direction).unwrap_or_else(|e| {
            warn!("Reading table {direction:?} switch failed: {e}");
            false
        })
    }
}

impl InputProbe for MachineInputs {
    fn is_active(&self, input_id: &str) -> Option<bool> {
        match input_id {
            "table_front_limit" => Some(self.table_switch(TableDirection::Forward)),
            "table_back_limit" => Some(self.table_switch(TableDirection::Backward)),
            other => self.inputs.is_active(other),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Machine
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Access {
    granted: bool,
    context: String,
}

struct Monitors {
    token: CancelToken,
    workers: Vec<Worker>,
}

pub struct Machine {
    link: Arc<dyn DeviceLink>,
    cfg: MachineConfig,
    sink: Arc<dyn EventSink>,
    safety: Arc<SafetySupervisor>,
    axis: Arc<StepperAxis>,
    fire: Arc<FireControl>,
    outputs: Arc<OutputBank>,
    inputs: Arc<InputMonitor>,
    engine: Arc<SequenceEngine>,
    access: Mutex<Access>,
    monitors: Mutex<Option<Monitors>>,
}

impl Machine {
    /// Build every actuator, initialise the stepper, park the servo at A
    /// and switch every relay off.
    pub fn new(link: Arc<dyn DeviceLink>, cfg: MachineConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        let safety = Arc::new(SafetySupervisor::new());
        let axis = Arc::new(StepperAxis::new(
            Arc::clone(&link),
            cfg.axis.clone(),
            Arc::clone(&safety),
            Arc::clone(&sink),
        ));
        let fire = Arc::new(FireControl::new(
            Arc::clone(&link),
            cfg.fire.clone(),
            Arc::clone(&safety),
            Arc::clone(&sink),
        ));
        let outputs = Arc::new(OutputBank::new(
            Arc::clone(&link),
            cfg.outputs.clone(),
            Arc::clone(&sink),
        ));
        let inputs = Arc::new(InputMonitor::new(Arc::clone(&link), cfg.inputs.clone()));
        let probe: Arc<dyn InputProbe> = Arc::new(MachineInputs {
            inputs: Arc::clone(&inputs),
            outputs: Arc::clone(&outputs),
        });
        let engine = Arc::new(SequenceEngine::new(
            Arc::clone(&axis),
            Arc::clone(&fire),
            Arc::clone(&outputs),
            probe,
            cfg.sequence.clone(),
            Arc::clone(&sink),
        ));

        axis.init()?;
        fire.move_to_a()?;
        outputs.stop_all_outputs()?;
        info!(
            "Machine ready ({:?} backend, access {})",
            link.backend(),
            if cfg.access.required { "required" } else { "open" }
        );

        Ok(Self {
            link,
            cfg,
            sink,
            safety,
            axis,
            fire,
            outputs,
            inputs,
            engine,
            access: Mutex::new(Access::default()),
            monitors: Mutex::new(None),
        })
    }

    // ── Accessors ─────────────────────────────────────────────

    pub fn axis(&self) -> &Arc<StepperAxis> {
        &self.axis
    }

    pub fn fire(&self) -> &Arc<FireControl> {
        &self.fire
    }

    pub fn outputs(&self) -> &Arc<OutputBank> {
        &self.outputs
    }

    pub fn engine(&self) -> &Arc<SequenceEngine> {
        &self.engine
    }

    pub fn config(&self) -> &MachineConfig {
        &self.cfg
    }

    // ── Monitors ──────────────────────────────────────────────

    /// Spawn the axis limit, output and (if enabled) input monitors.
    /// Button gestures arrive on `commands`.
    pub fn start_monitors(&self, commands: Sender<AppCommand>) -> Result<()> {
        let mut slot = lock(&self.monitors);
        if slot.is_some() {
            return Err(Error::NotReady("monitors already running"));
        }
        let token = CancelToken::new();
        let mut workers = Vec::with_capacity(3);
        if let Err(e) = self.spawn_monitors(commands, &token, &mut workers) {
            token.cancel();
            for w in workers {
                w.join_within(MONITOR_JOIN);
            }
            return Err(e);
        }
        info!("{} monitors running", workers.len());
        *slot = Some(Monitors { token, workers });
        Ok(())
    }

    fn spawn_monitors(
        &self,
        commands: Sender<AppCommand>,
        token: &CancelToken,
        workers: &mut Vec<Worker>,
    ) -> Result<()> {
        workers.push(self.axis.spawn_limit_monitor(token.clone())?);
        let fire = Arc::clone(&self.fire);
        workers.push(
            self.outputs
                .spawn_monitor(move || fire.angles(), token.clone())?,
        );
        if self.cfg.inputs.enabled {
            workers.push(self.inputs.spawn(commands, token.clone())?);
        }
        Ok(())
    }

    fn stop_monitors(&self) {
        let Some(monitors) = lock(&self.monitors).take() else {
            return;
        };
        monitors.token.cancel();
        for w in monitors.workers {
            let name = w.name().to_owned();
            if !w.join_within(MONITOR_JOIN) {
                warn!("Monitor '{name}' did not stop in time");
            }
        }
    }

    // ── Commands ──────────────────────────────────────────────

    fn check_access(&self, cmd: &AppCommand) -> Result<()> {
        if !self.cfg.access.required || cmd.is_ungated() || lock(&self.access).granted {
            return Ok(());
        }
        warn!("Refusing '{}': access not granted", cmd.name());
        Err(Error::NotReady("access not granted"))
    }

    /// Interpret one command.
    pub fn handle_command(&self, cmd: AppCommand) -> Result<Reply> {
        self.check_access(&cmd)?;
        let name = cmd.name();
        let result = self.dispatch(cmd);
        match &result {
            Err(e) if e.is_refusal() => info!("Command '{name}' refused: {e}"),
            Err(e) => error!("Command '{name}' failed: {e}"),
            Ok(_) => {}
        }
        result
    }

    fn dispatch(&self, cmd: AppCommand) -> Result<Reply> {
        use AppCommand as C;
        let motion = |m: Result<Motion>| m.map(|motion| Reply::Motion { motion });
        let done = |r: Result<()>| r.map(|()| Reply::Ok);
        let record = |r: Result<Option<FireRecord>>| r.map(|record| Reply::Record { record });
        let toggle = |r: Result<Toggle>| r.map(|toggle| Reply::Toggle { toggle });
        let (min, max) = self.axis.bounds();

        match cmd {
            // Axis
            C::Jog { direction, steps } => motion(self.axis.jog(direction, steps, MoveMode::Background)),
            C::MoveTo { position } => motion(self.axis.move_to(position, MoveMode::Background)),
            C::MoveToMin => motion(self.axis.move_to(min, MoveMode::Background)),
            C::MoveToMax => motion(self.axis.move_to(max, MoveMode::Background)),
            C::MoveIndex { direction } => motion(self.axis.move_index(direction, MoveMode::Background)),
            C::Home => motion(self.axis.home(false)),
            C::AxisStop => done(self.axis.stop()),
            C::SetSpeed { speed } => done(self.axis.set_speed(speed)),
            C::SetPosition { position } => done(self.axis.set_position(position)),
            C::EnableAxis => done(self.axis.enable()),
            C::DisableAxis { immediate } => done(self.axis.disable(if immediate {
                DisableMode::Immediate
            } else {
                DisableMode::Soft
            })),

            // Fire
            C::Fire => done(self.fire.fire()),
            C::StopFire => record(self.fire.stop_firing()),
            C::FireToggle => toggle(self.fire.fire_toggle()),
            C::FiberMomentary => self
                .fire
                .fiber_fire_momentary()
                .map(|started| Reply::Started { started }),
            C::FiberToggle => toggle(self.fire.fiber_fire_toggle()),
            C::StartFiberSequence => self
                .fire
                .start_sequence()
                .map(|started| Reply::Started { started }),
            C::StopFiberSequence => record(self.fire.stop_sequence()),
            C::MoveToA => done(self.fire.move_to_a()),
            C::MoveToB => done(self.fire.move_to_b()),
            C::SetPositionA { angle } => Ok(Reply::Angle {
                angle: self.fire.set_position_a(angle),
            }),
            C::SetPositionB { angle } => Ok(Reply::Angle {
                angle: self.fire.set_position_b(angle),
            }),
            C::SetInverted { inverted } => {
                self.fire.set_inverted(inverted);
                Ok(Reply::Ok)
            }

            // Outputs
            C::SetFan { on } => done(self.outputs.set_fan(on)),
            C::SetRedLights { on } => done(self.outputs.set_red_lights(on)),
            C::SetFanMode { mode } => {
                self.outputs.set_fan_mode(mode);
                Ok(Reply::Ok)
            }
            C::SetLightsMode { mode } => {
                self.outputs.set_lights_mode(mode);
                Ok(Reply::Ok)
            }
            C::TableForward { on } => done(self.outputs.set_table_forward(on)),
            C::TableBackward { on } => done(self.outputs.set_table_backward(on)),
            C::StopTable => done(self.outputs.stop_table()),
            C::UpdateTiming {
                fan_off_delay_ms,
                lights_off_delay_ms,
            } => {
                self.outputs
                    .update_timing(fan_off_delay_ms, lights_off_delay_ms);
                Ok(Reply::Ok)
            }

            // Sequence engine
            C::LoadSequence { sequence } => done(self.engine.load(sequence)),
            C::StartSequence => done(self.engine.start()),
            C::PauseSequence => done(self.engine.pause()),
            C::ResumeSequence => done(self.engine.resume()),
            C::StopSequence => done(self.engine.stop()),

            // Machine
            C::AccessChanged { granted, context } => {
                self.set_access(granted, context);
                Ok(Reply::Ok)
            }
            C::EmergencyStop => done(self.emergency_stop()),
            C::Status => Ok(Reply::Status {
                status: Box::new(self.status()),
            }),
        }
    }

    fn set_access(&self, granted: bool, context: String) {
        {
            let mut access = lock(&self.access);
            access.granted = granted;
            access.context.clone_from(&context);
        }
        info!(
            "Access {} ({context})",
            if granted { "granted" } else { "revoked" }
        );
        self.sink
            .emit(&MachineEvent::AccessChanged { granted, context });
    }

    // ── Safety ────────────────────────────────────────────────

    /// Stop the sequence, all firing, the axis and every output.  Each
    /// stage runs even if an earlier one failed; the first error is
    /// returned.
    pub fn emergency_stop(&self) -> Result<()> {
        error!("EMERGENCY STOP");
        self.sink.emit(&MachineEvent::EmergencyStop);

        let stages: [(&str, Result<()>); 4] = [
            ("sequence", self.engine.stop()),
            ("fire", self.fire.stop_all_firing()),
            ("axis", self.axis.stop()),
            ("outputs", self.outputs.stop_all_outputs()),
        ];
        let mut first = None;
        for (stage, result) in stages {
            if let Err(e) = result {
                error!("Emergency stop: {stage} stage failed: {e}");
                if first.is_none() {
                    first = Some(e);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Stop the monitors, make everything safe and de-energise the axis.
    pub fn shutdown(&self) -> Result<()> {
        info!("Shutting down");
        self.stop_monitors();
        let stopped = self.emergency_stop();
        let disabled = self.axis.disable(DisableMode::Immediate);
        if let Err(e) = &disabled {
            error!("Disabling axis on shutdown failed: {e}");
        }
        stopped.and(disabled)
    }

    // ── Status ────────────────────────────────────────────────

    pub fn status(&self) -> MachineStatus {
        let access = {
            let a = lock(&self.access);
            AccessStatus {
                required: self.cfg.access.required,
                granted: a.granted,
                context: a.context.clone(),
            }
        };
        MachineStatus {
            backend: self.link.backend(),
            axis: self.axis.status(),
            fire: self.fire.status(),
            outputs: self.outputs.get_status(),
            sequence: self.engine.status(),
            access,
            safety_mask: self.safety.active_mask(),
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.stop_monitors();
    }
}
