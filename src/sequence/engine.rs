//! Sequence engine: runs a loaded [`Sequence`] on a worker thread.
//!
//! ## Run states
//!
//! ```text
//!   Idle ──start──▶ Running ──pause──▶ Paused
//!     ▲               │  ▲──resume──────┘ │
//!     └────stop───────┤                   │
//!     └────stop───────┼───────────────────┘
//!                     ├──▶ Completed
//!                     └──▶ Error
//! ```
//!
//! `start` is accepted from Idle, Completed and Error.  Pause and stop are
//! requests: the worker honours them at step boundaries and inside every
//! in-step wait, sleeping in `poll_interval_ms` slices.  A paused wait is
//! frozen, not counted down.  Timed table runs and timed firing release
//! their actuator while paused and re-engage it on resume.
//!
//! A stale worker (one that outlived the bounded join in `stop`) can no
//! longer touch the run: every write checks the run generation.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use super::journal::{Category, Journal, Level, LogEntry};
use super::{RunStatus, Sequence, Step, StepAction};
use crate::app::events::MachineEvent;
use crate::app::ports::{EventSink, InputProbe};
use crate::config::SequenceConfig;
use crate::drivers::fire::FireControl;
use crate::drivers::outputs::{OutputBank, TableDirection};
use crate::drivers::stepper::{Motion, MoveMode, StepperAxis};
use crate::drivers::worker::{self, Worker};
use crate::error::{Error, Result};
use crate::sync::{CancelToken, lock};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceStatus {
    pub status: RunStatus,
    pub sequence_name: Option<String>,
    /// 1-based index of the step in progress.
    pub current_step: Option<usize>,
    pub total_steps: usize,
    pub steps_completed: usize,
    pub progress_percent: u8,
    pub log: Vec<LogEntry>,
    pub last_error: Option<String>,
    pub elapsed_ms: u64,
    pub simulated: bool,
}

/// Whether a step ran to its end or was cut short by `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stopped,
}

#[derive(Debug)]
struct Run {
    sequence: Option<Arc<Sequence>>,
    status: RunStatus,
    current_step: Option<usize>,
    steps_completed: usize,
    journal: Journal,
    last_error: Option<String>,
    started: Option<Instant>,
    finished: Option<Instant>,
    generation: u64,
    stop: CancelToken,
    pause_requested: bool,
    /// The step in flight is driving the axis.
    in_motion: bool,
}

impl Run {
    fn name(&self) -> Option<String> {
        self.sequence.as_ref().map(|s| s.name.clone())
    }
}

pub struct SequenceEngine {
    axis: Arc<StepperAxis>,
    fire: Arc<FireControl>,
    outputs: Arc<OutputBank>,
    probe: Arc<dyn InputProbe>,
    cfg: SequenceConfig,
    sink: Arc<dyn EventSink>,
    run: Mutex<Run>,
    worker: Mutex<Option<Worker>>,
    op: Mutex<()>,
}

impl SequenceEngine {
    pub fn new(
        axis: Arc<StepperAxis>,
        fire: Arc<FireControl>,
        outputs: Arc<OutputBank>,
        probe: Arc<dyn InputProbe>,
        cfg: SequenceConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let run = Run {
            sequence: None,
            status: RunStatus::Idle,
            current_step: None,
            steps_completed: 0,
            journal: Journal::new(),
            last_error: None,
            started: None,
            finished: None,
            generation: 0,
            stop: CancelToken::new(),
            pause_requested: false,
            in_motion: false,
        };
        Self {
            axis,
            fire,
            outputs,
            probe,
            cfg,
            sink,
            run: Mutex::new(run),
            worker: Mutex::new(None),
            op: Mutex::new(()),
        }
    }

    fn slice(&self) -> Duration {
        Duration::from_millis(self.cfg.poll_interval_ms.max(1))
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Replace the loaded sequence and reset counters and the log.
    pub fn load(&self, sequence: Sequence) -> Result<()> {
        let _op = lock(&self.op);
        if sequence.steps.is_empty() {
            error!("Invalid sequence '{}': no steps", sequence.name);
            return Err(Error::InvalidStep(format!(
                "sequence '{}' has no steps",
                sequence.name
            )));
        }
        let name = sequence.name.clone();
        {
            let mut run = lock(&self.run);
            if run.status.is_active() {
                warn!("Cannot load '{name}': a sequence is running");
                return Err(Error::NotReady("sequence running"));
            }
            let total = sequence.steps.len();
            run.generation += 1;
            run.sequence = Some(Arc::new(sequence));
            run.status = RunStatus::Idle;
            run.current_step = None;
            run.steps_completed = 0;
            run.journal = Journal::new();
            run.last_error = None;
            run.started = None;
            run.finished = None;
            run.pause_requested = false;
            run.journal.push(
                Level::Info,
                Category::Sequence,
                None,
                format!("Loaded sequence '{name}' with {total} steps"),
            );
        }
        self.sink.emit(&MachineEvent::SequenceStatusChanged {
            status: RunStatus::Idle,
            sequence: Some(name),
        });
        Ok(())
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let _op = lock(&self.op);
        if let Some(old) = lock(&self.worker).take() {
            if !old.join_within(self.slice()) {
                warn!("Previous sequence worker still running");
            }
        }

        let (sequence, token, generation) = {
            let mut run = lock(&self.run);
            if run.status.is_active() {
                return Err(Error::NotReady("sequence already running"));
            }
            let Some(sequence) = run.sequence.clone() else {
                run.journal.push(
                    Level::Error,
                    Category::Sequence,
                    None,
                    "Cannot start: no sequence loaded".into(),
                );
                return Err(Error::NotReady("no sequence loaded"));
            };
            run.generation += 1;
            run.stop = CancelToken::new();
            run.status = RunStatus::Running;
            run.current_step = None;
            run.steps_completed = 0;
            run.last_error = None;
            run.started = Some(Instant::now());
            run.finished = None;
            run.pause_requested = false;
            run.in_motion = false;
            run.journal.push(
                Level::Info,
                Category::Sequence,
                None,
                format!("Starting sequence: {}", sequence.name),
            );
            (sequence, run.stop.clone(), run.generation)
        };
        self.sink.emit(&MachineEvent::SequenceStatusChanged {
            status: RunStatus::Running,
            sequence: Some(sequence.name.clone()),
        });

        let engine = Arc::clone(self);
        match worker::spawn("sequence", move || engine.execute(&sequence, &token, generation)) {
            Ok(w) => {
                *lock(&self.worker) = Some(w);
                Ok(())
            }
            Err(e) => {
                self.finish(generation, RunStatus::Error, Level::Error, format!("Worker failed: {e}"));
                lock(&self.run).last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn pause(&self) -> Result<()> {
        let mut run = lock(&self.run);
        if run.status != RunStatus::Running {
            return Err(Error::NotReady("sequence not running"));
        }
        run.pause_requested = true;
        debug!("Pause requested");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut run = lock(&self.run);
        if run.status != RunStatus::Paused {
            return Err(Error::NotReady("sequence not paused"));
        }
        run.pause_requested = false;
        debug!("Resume requested");
        Ok(())
    }

    /// Signal the worker, wait for it (bounded), then make the actuators
    /// safe.  A no-op unless a run is active.
    pub fn stop(&self) -> Result<()> {
        let _op = lock(&self.op);
        let (token, in_motion, generation) = {
            let run = lock(&self.run);
            if !run.status.is_active() {
                return Ok(());
            }
            (run.stop.clone(), run.in_motion, run.generation)
        };
        token.cancel();
        if in_motion {
            if let Err(e) = self.axis.stop() {
                warn!("Stopping axis for sequence stop failed: {e}");
            }
        }

        let timeout = Duration::from_millis(self.cfg.stop_join_timeout_ms);
        if let Some(w) = lock(&self.worker).take() {
            if !w.join_within(timeout) {
                warn!(
                    "Sequence worker did not stop within {} ms",
                    timeout.as_millis()
                );
            }
        }
        // The worker normally records this itself.
        let still_active = lock(&self.run).status.is_active();
        if still_active {
            self.finish(
                generation,
                RunStatus::Idle,
                Level::Warning,
                "Sequence stopped by user".into(),
            );
            lock(&self.run).generation += 1;
        }
        self.cleanup()
    }

    fn cleanup(&self) -> Result<()> {
        let fire = self.fire.stop_all_firing();
        if let Err(e) = &fire {
            error!("Cleanup: stopping fire failed: {e}");
        }
        let table = self.outputs.stop_table();
        if let Err(e) = &table {
            error!("Cleanup: stopping table failed: {e}");
        }
        fire.and(table)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn status(&self) -> SequenceStatus {
        let run = lock(&self.run);
        let total_steps = run.sequence.as_ref().map_or(0, |s| s.steps.len());
        let progress_percent = if total_steps == 0 {
            0
        } else {
            (run.steps_completed * 100 / total_steps) as u8
        };
        let elapsed_ms = run.started.map_or(0, |t| {
            run.finished.unwrap_or_else(Instant::now).duration_since(t).as_millis() as u64
        });
        SequenceStatus {
            status: run.status,
            sequence_name: run.name(),
            current_step: run.current_step.map(|i| i + 1),
            total_steps,
            steps_completed: run.steps_completed,
            progress_percent,
            log: run.journal.entries().to_vec(),
            last_error: run.last_error.clone(),
            elapsed_ms,
            simulated: self.axis.status().simulated,
        }
    }

    pub fn run_status(&self) -> RunStatus {
        lock(&self.run).status
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    /// Apply `f` to the run if it still belongs to `generation`.
    fn with_run<R>(&self, generation: u64, f: impl FnOnce(&mut Run) -> R) -> Option<R> {
        let mut run = lock(&self.run);
        (run.generation == generation).then(|| f(&mut run))
    }

    fn journal(&self, generation: u64, level: Level, category: Category, step: Option<usize>, message: String) {
        self.with_run(generation, |run| run.journal.push(level, category, step, message));
    }

    fn finish(&self, generation: u64, status: RunStatus, level: Level, message: String) {
        let name = self.with_run(generation, |run| {
            run.status = status;
            run.finished = Some(Instant::now());
            run.pause_requested = false;
            run.in_motion = false;
            run.journal.push(level, Category::Sequence, None, message);
            run.name()
        });
        if let Some(sequence) = name {
            self.sink
                .emit(&MachineEvent::SequenceStatusChanged { status, sequence });
        }
    }

    fn set_status(&self, generation: u64, status: RunStatus, message: &str) {
        let name = self.with_run(generation, |run| {
            run.status = status;
            run.journal
                .push(Level::Info, Category::Sequence, run.current_step, message.into());
            run.name()
        });
        if let Some(sequence) = name {
            self.sink
                .emit(&MachineEvent::SequenceStatusChanged { status, sequence });
        }
    }

    fn execute(&self, sequence: &Sequence, token: &CancelToken, generation: u64) {
        let started = Instant::now();
        let total = sequence.steps.len();

        for (index, step) in sequence.steps.iter().enumerate() {
            if self.checkpoint(token, generation) == Flow::Stopped {
                return self.stopped(generation);
            }
            if self
                .with_run(generation, |run| run.current_step = Some(index))
                .is_none()
            {
                return;
            }

            match self.run_step(step, index, total, token, generation) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stopped) => return self.stopped(generation),
                Err(e) => {
                    self.journal(
                        generation,
                        Level::Error,
                        Category::Step,
                        Some(index),
                        format!("Step failed: {e}"),
                    );
                    self.with_run(generation, |run| run.last_error = Some(e.to_string()));
                    self.finish(
                        generation,
                        RunStatus::Error,
                        Level::Error,
                        format!("Sequence failed at step {}: {e}", index + 1),
                    );
                    return;
                }
            }

            self.with_run(generation, |run| {
                run.steps_completed = index + 1;
                run.journal.push(
                    Level::Success,
                    Category::Step,
                    Some(index),
                    format!("Step {}/{total} completed: {}", index + 1, step.action),
                );
            });
            self.sink.emit(&MachineEvent::StepCompleted {
                index,
                action: step.action.clone(),
            });

            let delay = match step.delay_after_ms() {
                Ok(ms) => ms,
                Err(e) => {
                    self.with_run(generation, |run| run.last_error = Some(e.to_string()));
                    self.finish(generation, RunStatus::Error, Level::Error, e.to_string());
                    return;
                }
            };
            if delay > 0 && self.hold(delay, token, generation, |_| Ok(())) == Ok(Flow::Stopped) {
                return self.stopped(generation);
            }
        }

        let secs = started.elapsed().as_secs_f64();
        self.finish(
            generation,
            RunStatus::Completed,
            Level::Success,
            format!("Sequence completed successfully in {secs:.1}s"),
        );
    }

    fn stopped(&self, generation: u64) {
        self.finish(
            generation,
            RunStatus::Idle,
            Level::Warning,
            "Sequence stopped by user".into(),
        );
    }

    /// Honour a pending stop or pause.  Blocks while paused.
    fn checkpoint(&self, token: &CancelToken, generation: u64) -> Flow {
        if token.is_cancelled() {
            return Flow::Stopped;
        }
        let paused = self
            .with_run(generation, |run| run.pause_requested)
            .unwrap_or(false);
        if !paused {
            return Flow::Continue;
        }

        self.set_status(generation, RunStatus::Paused, "Sequence paused");
        let slice = self.slice();
        loop {
            if token.is_cancelled() {
                return Flow::Stopped;
            }
            let still = self
                .with_run(generation, |run| run.pause_requested)
                .unwrap_or(false);
            if !still {
                break;
            }
            std::thread::sleep(slice);
        }
        self.set_status(generation, RunStatus::Running, "Sequence resumed");
        Flow::Continue
    }

    fn is_pause_requested(&self, generation: u64) -> bool {
        self.with_run(generation, |run| run.pause_requested)
            .unwrap_or(false)
    }

    /// Sleep `ms` in slices.  Paused time is not counted; `on_pause(true)`
    /// runs before the pause and `on_pause(false)` after it.
    fn hold(
        &self,
        ms: u64,
        token: &CancelToken,
        generation: u64,
        mut on_pause: impl FnMut(bool) -> Result<()>,
    ) -> Result<Flow> {
        let slice = self.slice();
        let mut remaining = Duration::from_millis(ms);
        loop {
            if token.is_cancelled() {
                return Ok(Flow::Stopped);
            }
            if self.is_pause_requested(generation) {
                on_pause(true)?;
                if self.checkpoint(token, generation) == Flow::Stopped {
                    return Ok(Flow::Stopped);
                }
                on_pause(false)?;
                continue;
            }
            if remaining.is_zero() {
                return Ok(Flow::Continue);
            }
            let nap = slice.min(remaining);
            std::thread::sleep(nap);
            remaining -= nap;
        }
    }

    fn run_step(
        &self,
        step: &Step,
        index: usize,
        total: usize,
        token: &CancelToken,
        generation: u64,
    ) -> Result<Flow> {
        let action = step.parse()?;
        self.journal(
            generation,
            Level::Info,
            Category::Step,
            Some(index),
            format!("Executing step {}/{total}: {}", index + 1, step.action),
        );
        let note = |message: String| {
            self.journal(generation, Level::Info, Category::Hardware, Some(index), message);
        };

        match action {
            StepAction::MoveAxis { direction, steps } => {
                self.axis.enable()?;
                let motion = self.in_motion(generation, || {
                    self.axis.jog(direction, Some(steps), MoveMode::Blocking)
                })?;
                note(format!(
                    "Moved stepper {direction:?} {steps} steps, position {}",
                    self.axis.get_position()
                ));
                Self::motion_flow(motion, token)
            }
            StepAction::Fire { duration_ms: None } => {
                self.fire.fire()?;
                note("Started firing".into());
                Ok(Flow::Continue)
            }
            StepAction::Fire {
                duration_ms: Some(ms),
            } => {
                self.fire.fire()?;
                note(format!("Firing for {ms} ms"));
                let held = self.hold(ms, token, generation, |paused| {
                    if paused {
                        self.fire.suspend_firing()
                    } else {
                        self.fire.resume_firing()
                    }
                });
                if held.as_ref().is_ok_and(|f| *f == Flow::Stopped) {
                    return held;
                }
                let stopped = self.fire.stop_firing();
                let flow = held?;
                stopped?;
                note("Stopped firing".into());
                Ok(flow)
            }
            StepAction::FireFiber => {
                if self.fire.start_sequence()? {
                    note("Started fiber sequence (A-B-A-B)".into());
                } else {
                    note("Fiber sequence already running".into());
                }
                Ok(Flow::Continue)
            }
            StepAction::StopFire => {
                self.fire.stop_firing()?;
                note("Stopped firing".into());
                Ok(Flow::Continue)
            }
            StepAction::Wait { duration_ms } => {
                note(format!("Waiting {duration_ms} ms"));
                self.hold(duration_ms, token, generation, |_| Ok(()))
            }
            StepAction::WaitForInput {
                input_id,
                timeout_ms,
            } => self.wait_for_input(&input_id, timeout_ms, index, token, generation),
            StepAction::FanOn => self.outputs.set_fan(true).map(|()| Flow::Continue),
            StepAction::FanOff => self.outputs.set_fan(false).map(|()| Flow::Continue),
            StepAction::LightsOn => self.outputs.set_red_lights(true).map(|()| Flow::Continue),
            StepAction::LightsOff => self.outputs.set_red_lights(false).map(|()| Flow::Continue),
            StepAction::TableForward { duration_ms } => {
                self.timed_table(TableDirection::Forward, duration_ms, token, generation)
            }
            StepAction::TableBackward { duration_ms } => {
                self.timed_table(TableDirection::Backward, duration_ms, token, generation)
            }
            StepAction::TableRunToFrontLimit => self.table_to_limit(TableDirection::Forward, token),
            StepAction::TableRunToBackLimit => self.table_to_limit(TableDirection::Backward, token),
            StepAction::GoToZero => {
                self.axis.enable()?;
                let motion =
                    self.in_motion(generation, || self.axis.move_to(0, MoveMode::Blocking))?;
                note("Cleaning head moved to position 0".into());
                Self::motion_flow(motion, token)
            }
            StepAction::HomeAxis => {
                let motion = self.in_motion(generation, || self.axis.home(true))?;
                Self::motion_flow(motion, token)
            }
        }
    }

    fn in_motion(&self, generation: u64, f: impl FnOnce() -> Result<Motion>) -> Result<Motion> {
        self.with_run(generation, |run| run.in_motion = true);
        let result = f();
        self.with_run(generation, |run| run.in_motion = false);
        result
    }

    fn motion_flow(motion: Motion, token: &CancelToken) -> Result<Flow> {
        match motion {
            Motion::Interrupted if token.is_cancelled() => Ok(Flow::Stopped),
            Motion::Interrupted => Err(Error::Cancelled),
            Motion::Completed | Motion::AlreadyThere | Motion::Started => Ok(Flow::Continue),
        }
    }

    fn set_table(&self, direction: TableDirection, on: bool) -> Result<()> {
        match direction {
            TableDirection::Forward => self.outputs.set_table_forward(on),
            TableDirection::Backward => self.outputs.set_table_backward(on),
        }
    }

    fn timed_table(
        &self,
        direction: TableDirection,
        ms: u64,
        token: &CancelToken,
        generation: u64,
    ) -> Result<Flow> {
        self.set_table(direction, true)?;
        let held = self.hold(ms, token, generation, |paused| self.set_table(direction, !paused));
        let off = self.set_table(direction, false);
        let flow = held?;
        off?;
        info!("Table {direction:?} for {ms} ms");
        Ok(flow)
    }

    fn table_to_limit(&self, direction: TableDirection, token: &CancelToken) -> Result<Flow> {
        match self
            .outputs
            .run_table_to_limit(direction, self.outputs.table_run_timeout(), token)
        {
            Ok(()) => Ok(Flow::Continue),
            Err(Error::Cancelled) => Ok(Flow::Stopped),
            Err(e) => Err(e),
        }
    }

    fn wait_for_input(
        &self,
        input_id: &str,
        timeout_ms: Option<u64>,
        index: usize,
        token: &CancelToken,
        generation: u64,
    ) -> Result<Flow> {
        let timeout_text = timeout_ms.map_or_else(|| "no timeout".to_owned(), |t| format!("timeout: {t}ms"));
        self.journal(
            generation,
            Level::Info,
            Category::Step,
            Some(index),
            format!("Waiting for input: {input_id} ({timeout_text})"),
        );

        let slice = self.slice();
        let mut remaining = timeout_ms.map(Duration::from_millis);
        loop {
            if token.is_cancelled() {
                return Ok(Flow::Stopped);
            }
            if self.is_pause_requested(generation) {
                if self.checkpoint(token, generation) == Flow::Stopped {
                    return Ok(Flow::Stopped);
                }
                continue;
            }
            match self.probe.is_active(input_id) {
                Some(true) => {
                    self.journal(
                        generation,
                        Level::Info,
                        Category::Step,
                        Some(index),
                        format!("Input {input_id} detected, continuing"),
                    );
                    return Ok(Flow::Continue);
                }
                Some(false) => {}
                None => return Err(Error::InvalidStep(format!("unknown input '{input_id}'"))),
            }
            let nap = match remaining {
                Some(left) if left.is_zero() => {
                    self.journal(
                        generation,
                        Level::Warning,
                        Category::Step,
                        Some(index),
                        format!(
                            "Wait for input timed out after {}ms",
                            timeout_ms.unwrap_or_default()
                        ),
                    );
                    return Ok(Flow::Continue);
                }
                Some(left) => {
                    let nap = slice.min(left);
                    remaining = Some(left - nap);
                    nap
                }
                None => slice,
            };
            std::thread::sleep(nap);
        }
    }
}
