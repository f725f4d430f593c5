//! Cleaning-head stepper axis.
//!
//! The axis tracks its own position in steps and owns the policy around
//! every move: clamp the target to the configured travel, refresh the
//! limit switches, refuse to drive into a triggered switch, then command a
//! relative move on the link and wait for it.
//!
//! ## Move lifecycle
//!
//! 1. Command phase, under the op lock: validate, clamp, check limits,
//!    send `move_stepper`, mark the axis moving.
//! 2. Wait phase, outside every lock: poll `moving` every slice until the
//!    axis is idle, the move's [`CancelToken`] fires (`stop()`), or the
//!    deadline passes (forced stop, `Timeout`).
//! 3. Settle: derive the new position from the feedback counter delta,
//!    clamp, publish.
//!
//! A background move runs phase 2 and 3 on a worker thread.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::app::events::MachineEvent;
use crate::app::ports::EventSink;
use crate::config::AxisConfig;
use crate::drivers::worker::{self, Worker};
use crate::error::{Error, Interlock, Result};
use crate::link::{DeviceLink, Direction, Feedback, SoftLimits, StepperPins};
use crate::safety::{Activity, SafetySupervisor};
use crate::sync::{CancelToken, lock};

const MOTION_SLICE: Duration = Duration::from_millis(20);

/// How `disable` treats the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableMode {
    /// Refuse motion now, de-energise after `hold_ms`.
    Soft,
    /// Stop and de-energise now.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMode {
    Blocking,
    Background,
}

/// Outcome of an accepted motion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Motion {
    /// Reached the target (blocking).
    Completed,
    /// Running on a worker (background).
    Started,
    /// Target equals the current position; nothing was sent.
    AlreadyThere,
    /// `stop()` ended the motion early.
    Interrupted,
}

/// Axis switch states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimitState {
    pub limit_a: bool,
    pub limit_b: bool,
    pub home: bool,
}

impl From<&Feedback> for LimitState {
    fn from(fb: &Feedback) -> Self {
        Self {
            limit_a: fb.limit_a,
            limit_b: fb.limit_b,
            home: fb.home,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisStatus {
    pub position: i64,
    pub target: i64,
    pub enabled: bool,
    pub moving: bool,
    pub homing: bool,
    pub limits: LimitState,
    pub min_position: i64,
    pub max_position: i64,
    pub speed: u32,
    pub jog_speed: u32,
    pub simulated: bool,
}

#[derive(Debug)]
struct AxisState {
    position: i64,
    target: i64,
    enabled: bool,
    moving: bool,
    homing: bool,
    direction: Option<Direction>,
    limits: LimitState,
    speed: u32,
    jog_speed: u32,
    /// Token of the move or homing run in flight.
    motion: Option<CancelToken>,
    /// Pending soft-disable release.
    hold: Option<CancelToken>,
}

/// One accepted move, handed from the command phase to the wait phase.
#[derive(Debug)]
struct Travel {
    start: i64,
    /// Link position counter when the move was sent.
    origin: i64,
    target: i64,
    token: CancelToken,
    deadline: Instant,
}

pub struct StepperAxis {
    link: Arc<dyn DeviceLink>,
    cfg: AxisConfig,
    safety: Arc<SafetySupervisor>,
    sink: Arc<dyn EventSink>,
    state: Mutex<AxisState>,
    op: Mutex<()>,
}

impl StepperAxis {
    pub fn new(
        link: Arc<dyn DeviceLink>,
        cfg: AxisConfig,
        safety: Arc<SafetySupervisor>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let state = AxisState {
            position: 0,
            target: 0,
            enabled: false,
            moving: false,
            homing: false,
            direction: None,
            limits: LimitState::default(),
            speed: cfg.speed,
            jog_speed: cfg.jog_speed,
            motion: None,
            hold: None,
        };
        Self {
            link,
            cfg,
            safety,
            sink,
            state: Mutex::new(state),
            op: Mutex::new(()),
        }
    }

    /// Configure the stepper channel on the link and energise the driver.
    pub fn init(&self) -> Result<()> {
        let cfg = &self.cfg;
        let pins = StepperPins {
            step: cfg.step_pin,
            dir: cfg.dir_pin,
            enable: Some(cfg.enable_pin),
            limit_a: cfg.limit_a_pin,
            limit_b: cfg.limit_b_pin,
            home: cfg.home_pin,
        };
        let limits = SoftLimits {
            min: cfg.min_position,
            max: cfg.max_position,
        };
        self.link.init_stepper(cfg.axis_id, &pins, limits)?;
        self.refresh()?;
        self.enable()?;
        info!(
            "Stepper {} initialised, travel {}..{}",
            cfg.axis_id, cfg.min_position, cfg.max_position
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Driver power
    // -----------------------------------------------------------------------

    pub fn enable(&self) -> Result<()> {
        let hold = lock(&self.state).hold.take();
        if let Some(hold) = hold {
            hold.cancel();
        }
        self.energise(true)?;
        lock(&self.state).enabled = true;
        info!("Stepper enabled");
        Ok(())
    }

    pub fn disable(&self, mode: DisableMode) -> Result<()> {
        lock(&self.state).enabled = false;
        let stopped = self.halt_motion();
        match mode {
            DisableMode::Immediate => {
                let released = self.energise(false);
                info!("Stepper disabled");
                stopped.and(released)
            }
            DisableMode::Soft => {
                let token = CancelToken::new();
                if let Some(previous) = lock(&self.state).hold.replace(token.clone()) {
                    previous.cancel();
                }
                let link = Arc::clone(&self.link);
                let pin = self.cfg.enable_pin;
                let level = self.cfg.enable_active_low;
                let hold = Duration::from_millis(self.cfg.hold_ms);
                worker::spawn("axis-hold", move || {
                    if token.sleep(hold, MOTION_SLICE) {
                        match link.set_pin(pin, level) {
                            Ok(()) => info!("Stepper driver released after hold"),
                            Err(e) => warn!("Stepper driver release failed: {e}"),
                        }
                    }
                })?;
                info!("Stepper disabled, holding {} ms", self.cfg.hold_ms);
                stopped
            }
        }
    }

    fn energise(&self, on: bool) -> Result<()> {
        self.link
            .set_pin(self.cfg.enable_pin, on != self.cfg.enable_active_low)
    }

    // -----------------------------------------------------------------------
    // Parameters
    // -----------------------------------------------------------------------

    pub fn set_speed(&self, speed: u32) -> Result<()> {
        if speed == 0 {
            return Err(Error::InvalidArgument("speed must be > 0".into()));
        }
        lock(&self.state).speed = speed;
        info!("Stepper speed set to {speed}");
        Ok(())
    }

    pub fn set_jog_speed(&self, speed: u32) -> Result<()> {
        if speed == 0 {
            return Err(Error::InvalidArgument("jog speed must be > 0".into()));
        }
        lock(&self.state).jog_speed = speed;
        Ok(())
    }

    /// Override the tracked position (clamped to travel).
    pub fn set_position(&self, position: i64) -> Result<()> {
        let position = self.clamp(position);
        let mut st = lock(&self.state);
        if st.moving || st.homing {
            return Err(Error::NotReady("axis is moving"));
        }
        st.position = position;
        st.target = position;
        info!("Position set to {position}");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Motion
    // -----------------------------------------------------------------------

    /// Relative move of `steps` (default `jog_step_size`) at jog speed.
    pub fn jog(self: &Arc<Self>, direction: Direction, steps: Option<u32>, mode: MoveMode) -> Result<Motion> {
        let steps = i64::from(steps.unwrap_or(self.cfg.jog_step_size));
        let (position, speed) = {
            let st = lock(&self.state);
            (st.position, st.jog_speed)
        };
        self.travel(position.saturating_add(direction.sign() * steps), speed, mode)
    }

    /// Absolute move at the indexed speed.
    pub fn move_to(self: &Arc<Self>, position: i64, mode: MoveMode) -> Result<Motion> {
        let speed = lock(&self.state).speed;
        self.travel(position, speed, mode)
    }

    /// Move one `index_distance` in `direction`.
    pub fn move_index(self: &Arc<Self>, direction: Direction, mode: MoveMode) -> Result<Motion> {
        let (position, speed) = {
            let st = lock(&self.state);
            (st.position, st.speed)
        };
        let target = position.saturating_add(direction.sign() * i64::from(self.cfg.index_distance));
        self.travel(target, speed, mode)
    }

    fn travel(self: &Arc<Self>, target: i64, speed: u32, mode: MoveMode) -> Result<Motion> {
        let op = lock(&self.op);
        let target = self.clamp(target);
        let start = {
            let st = lock(&self.state);
            Self::ready(&st)?;
            st.position
        };

        let Some(direction) = Direction::of_delta(target - start) else {
            debug!("Already at {target}");
            return Ok(Motion::AlreadyThere);
        };

        let fb = self.refresh()?;
        Self::check_limits(direction, LimitState::from(&fb))?;

        let steps = u32::try_from((target - start).unsigned_abs())
            .map_err(|_| Error::InvalidArgument(format!("move of {} steps", target - start)))?;
        self.link
            .move_stepper(self.cfg.axis_id, steps, direction, speed, false)?;

        let token = CancelToken::new();
        {
            let mut st = lock(&self.state);
            st.moving = true;
            st.target = target;
            st.direction = Some(direction);
            st.motion = Some(token.clone());
        }
        info!("Moving {steps} steps {direction:?} to {target}");

        let run = Travel {
            start,
            origin: fb.position,
            target,
            token,
            deadline: Instant::now()
                + Duration::from_secs_f64(f64::from(steps) / f64::from(speed.max(1)))
                + Duration::from_millis(self.cfg.move_timeout_ms),
        };
        drop(op);

        match mode {
            MoveMode::Blocking => self.await_travel(&run),
            MoveMode::Background => {
                let axis = Arc::clone(self);
                let spawned = worker::spawn("axis-move", move || {
                    if let Err(e) = axis.await_travel(&run) {
                        warn!("Background move failed: {e}");
                    }
                });
                if let Err(e) = spawned {
                    if let Err(stop) = self.link.stop_stepper(self.cfg.axis_id) {
                        warn!("Stop after failed move spawn: {stop}");
                    }
                    let mut st = lock(&self.state);
                    st.moving = false;
                    st.motion = None;
                    st.direction = None;
                    return Err(e);
                }
                Ok(Motion::Started)
            }
        }
    }

    fn await_travel(&self, run: &Travel) -> Result<Motion> {
        let axis = self.cfg.axis_id;
        let slice = MOTION_SLICE.min(Duration::from_millis(self.cfg.poll_interval_ms));
        let mut last = None;

        let outcome = loop {
            if run.token.is_cancelled() {
                break Ok(Motion::Interrupted);
            }
            match self.link.feedback(axis) {
                Ok(fb) => {
                    lock(&self.state).limits = LimitState::from(&fb);
                    let idle = !fb.moving;
                    last = Some(fb);
                    if idle {
                        break Ok(Motion::Completed);
                    }
                }
                Err(e) => debug!("Feedback during move failed: {e}"),
            }
            if Instant::now() >= run.deadline {
                warn!("Move to {} timed out, forcing stop", run.target);
                if let Err(e) = self.link.stop_stepper(axis) {
                    error!("Forced stop failed: {e}");
                }
                break Err(Error::Timeout(format!("axis move to {}", run.target)));
            }
            std::thread::sleep(slice);
        };

        if !matches!(outcome, Ok(Motion::Completed)) {
            last = self.link.feedback(axis).ok().or(last);
        }
        self.settle(run, last.as_ref());
        outcome
    }

    fn settle(&self, run: &Travel, fb: Option<&Feedback>) {
        let position = match fb {
            Some(fb) => self.clamp(run.start + (fb.position - run.origin)),
            None => run.start,
        };
        {
            let mut st = lock(&self.state);
            st.position = position;
            st.target = position;
            st.moving = false;
            st.direction = None;
            st.motion = None;
        }
        info!("Position: {position}");
        self.sink.emit(&MachineEvent::AxisMoved { position });
    }

    /// Search backward for the home switch, then zero.
    ///
    /// With `wait == false` the search runs on a worker and this returns
    /// [`Motion::Started`].
    pub fn home(self: &Arc<Self>, wait: bool) -> Result<Motion> {
        let op = lock(&self.op);
        Self::ready(&lock(&self.state))?;
        if !(self.cfg.min_position..=self.cfg.max_position).contains(&0) {
            warn!(
                "Homing refused: travel {}..={} excludes position 0",
                self.cfg.min_position, self.cfg.max_position
            );
            return Err(Error::InvalidArgument(format!(
                "home position 0 outside travel {}..={}",
                self.cfg.min_position, self.cfg.max_position
            )));
        }
        self.safety.engage(Activity::Homing)?;

        let token = CancelToken::new();
        {
            let mut st = lock(&self.state);
            st.homing = true;
            st.motion = Some(token.clone());
        }
        info!("Homing started");
        drop(op);

        if wait {
            return self.run_homing(&token);
        }
        let axis = Arc::clone(self);
        let worker_token = token.clone();
        if let Err(e) = worker::spawn("axis-home", move || {
            let _ = axis.run_homing(&worker_token);
        }) {
            self.end_homing();
            return Err(e);
        }
        Ok(Motion::Started)
    }

    fn run_homing(&self, token: &CancelToken) -> Result<Motion> {
        let result = self.search_home(token);
        self.end_homing();
        match &result {
            Ok(Motion::Completed) => {
                info!("Homing completed, position: 0");
                self.sink.emit(&MachineEvent::HomingCompleted);
            }
            Ok(_) => info!("Homing interrupted"),
            Err(e) => {
                error!("Homing failed: {e}");
                self.sink.emit(&MachineEvent::HomingFailed {
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    fn end_homing(&self) {
        {
            let mut st = lock(&self.state);
            st.homing = false;
            st.moving = false;
            st.direction = None;
            st.motion = None;
        }
        self.safety.release(Activity::Homing);
    }

    fn search_home(&self, token: &CancelToken) -> Result<Motion> {
        let axis = self.cfg.axis_id;
        let speed = self.cfg.effective_home_speed();
        let budget = self.cfg.home_max_steps;
        let mut travelled = 0u32;

        loop {
            if token.is_cancelled() {
                return Ok(Motion::Interrupted);
            }
            let fb = self.refresh()?;
            if fb.home {
                break;
            }
            if fb.limit_a {
                return Err(Interlock::LimitA.into());
            }
            if travelled >= budget {
                return Err(Error::Timeout(format!(
                    "home switch not found within {budget} steps"
                )));
            }
            let step = self.cfg.home_increment.min(budget - travelled);
            {
                let mut st = lock(&self.state);
                st.moving = true;
                st.direction = Some(Direction::Negative);
            }
            let moved = self
                .link
                .move_stepper(axis, step, Direction::Negative, speed, true);
            lock(&self.state).moving = false;
            moved?;
            travelled += step;
        }

        if !self.link.zero_position(axis)? {
            debug!("Backend has no position counter reset");
        }
        let mut st = lock(&self.state);
        st.position = 0;
        st.target = 0;
        Ok(Motion::Completed)
    }

    /// Stop any move or homing run.  A blocked caller returns within one
    /// poll slice with [`Motion::Interrupted`].
    pub fn stop(&self) -> Result<()> {
        self.halt_motion()?;
        let position = lock(&self.state).position;
        info!("Stepper stopped at {position}");
        self.sink.emit(&MachineEvent::AxisStopped { position });
        Ok(())
    }

    fn halt_motion(&self) -> Result<()> {
        let token = lock(&self.state).motion.clone();
        if let Some(token) = token {
            token.cancel();
        }
        self.link.stop_stepper(self.cfg.axis_id)
    }

    /// Stop and de-energise.  Used on shutdown.
    pub fn shutdown(&self) -> Result<()> {
        let stopped = self.halt_motion();
        stopped.and(self.disable(DisableMode::Immediate))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_position(&self) -> i64 {
        lock(&self.state).position
    }

    pub fn is_moving(&self) -> bool {
        let st = lock(&self.state);
        st.moving || st.homing
    }

    pub fn is_homing(&self) -> bool {
        lock(&self.state).homing
    }

    /// Fresh switch states from the link.
    pub fn get_limit_states(&self) -> Result<LimitState> {
        self.refresh().map(|fb| LimitState::from(&fb))
    }

    /// Last switch states seen by any poll.
    pub fn cached_limits(&self) -> LimitState {
        lock(&self.state).limits
    }

    pub fn bounds(&self) -> (i64, i64) {
        (self.cfg.min_position, self.cfg.max_position)
    }

    pub fn status(&self) -> AxisStatus {
        let st = lock(&self.state);
        AxisStatus {
            position: st.position,
            target: st.target,
            enabled: st.enabled,
            moving: st.moving,
            homing: st.homing,
            limits: st.limits,
            min_position: self.cfg.min_position,
            max_position: self.cfg.max_position,
            speed: st.speed,
            jog_speed: st.jog_speed,
            simulated: self.link.is_simulated(),
        }
    }

    // -----------------------------------------------------------------------
    // Limit monitor
    // -----------------------------------------------------------------------

    /// Poll the switches every `poll_interval_ms` until `token` fires.
    ///
    /// A switch rising in the direction of travel stops the motor.
    pub fn spawn_limit_monitor(self: &Arc<Self>, token: CancelToken) -> Result<Worker> {
        let axis = Arc::clone(self);
        worker::spawn("axis-limits", move || axis.watch_limits(&token))
    }

    fn watch_limits(&self, token: &CancelToken) {
        let period = Duration::from_millis(self.cfg.poll_interval_ms);
        let mut prev = self.cached_limits();
        let mut failing = false;
        info!("Limit monitor running every {} ms", period.as_millis());

        while token.sleep(period, MOTION_SLICE.min(period)) {
            match self.link.feedback(self.cfg.axis_id) {
                Ok(fb) => {
                    if failing {
                        info!("Limit poll recovered");
                        failing = false;
                    }
                    let now = LimitState::from(&fb);
                    self.on_limits(prev, now);
                    prev = now;
                }
                Err(e) => {
                    if !failing {
                        warn!("Limit poll failed: {e}");
                        failing = true;
                    }
                }
            }
        }
        debug!("Limit monitor stopped");
    }

    fn on_limits(&self, prev: LimitState, now: LimitState) {
        let direction = {
            let mut st = lock(&self.state);
            st.limits = now;
            if st.moving { st.direction } else { None }
        };
        let hit = match direction {
            Some(Direction::Negative) if now.limit_a && !prev.limit_a => Some(Interlock::LimitA),
            Some(Direction::Positive) if now.limit_b && !prev.limit_b => Some(Interlock::LimitB),
            _ => None,
        };
        if let Some(interlock) = hit {
            warn!("{interlock}, stopping motor");
            if let Err(e) = self.link.stop_stepper(self.cfg.axis_id) {
                error!("Stop on limit failed: {e}");
            }
            self.sink.emit(&MachineEvent::LimitTriggered { interlock });
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn ready(st: &AxisState) -> Result<()> {
        if !st.enabled {
            return Err(Error::NotReady("axis disabled"));
        }
        if st.homing {
            return Err(Error::NotReady("homing in progress"));
        }
        if st.moving {
            return Err(Error::NotReady("axis is moving"));
        }
        Ok(())
    }

    fn check_limits(direction: Direction, limits: LimitState) -> Result<()> {
        let refused = match direction {
            Direction::Negative if limits.limit_a => Some(Interlock::LimitA),
            Direction::Positive if limits.limit_b => Some(Interlock::LimitB),
            _ => None,
        };
        match refused {
            Some(interlock) => {
                warn!("Move refused: {interlock}");
                Err(interlock.into())
            }
            None => Ok(()),
        }
    }

    fn clamp(&self, target: i64) -> i64 {
        let clamped = target.clamp(self.cfg.min_position, self.cfg.max_position);
        if clamped != target {
            info!("Target {target} clamped to {clamped}");
        }
        clamped
    }

    fn refresh(&self) -> Result<Feedback> {
        let fb = self.link.feedback(self.cfg.axis_id)?;
        lock(&self.state).limits = LimitState::from(&fb);
        Ok(fb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::log_sink::LogEventSink;
    use crate::link::SimulatedLink;
    use crate::link::sim::Switch;

    fn axis_on(sim: &Arc<SimulatedLink>, cfg: AxisConfig) -> Arc<StepperAxis> {
        let axis = Arc::new(StepperAxis::new(
            sim.clone(),
            cfg,
            Arc::new(SafetySupervisor::new()),
            Arc::new(LogEventSink),
        ));
        axis.init().unwrap();
        axis
    }

    fn instant() -> (Arc<SimulatedLink>, Arc<StepperAxis>) {
        let sim = Arc::new(SimulatedLink::with_instant_moves());
        let axis = axis_on(&sim, AxisConfig::default());
        (sim, axis)
    }

    #[test]
    fn jog_is_clamped_to_travel() {
        let (_sim, axis) = instant();
        axis.move_to(495, MoveMode::Blocking).unwrap();
        assert_eq!(
            axis.jog(Direction::Positive, Some(20), MoveMode::Blocking),
            Ok(Motion::Completed)
        );
        assert_eq!(axis.get_position(), 500);
    }

    #[test]
    fn jog_into_triggered_limit_is_refused() {
        let (sim, axis) = instant();
        axis.move_to(50, MoveMode::Blocking).unwrap();
        sim.override_switch(0, Switch::LimitB, Some(true));
        assert_eq!(
            axis.jog(Direction::Positive, None, MoveMode::Blocking),
            Err(Error::LimitViolation(Interlock::LimitB))
        );
        assert_eq!(axis.get_position(), 50);
        // Moving away from the switch is still allowed.
        axis.jog(Direction::Negative, None, MoveMode::Blocking).unwrap();
        assert_eq!(axis.get_position(), 40);
    }

    #[test]
    fn zero_distance_move_is_a_no_op() {
        let (_sim, axis) = instant();
        assert_eq!(axis.move_to(0, MoveMode::Blocking), Ok(Motion::AlreadyThere));
    }

    #[test]
    fn index_moves_one_index_distance() {
        let (_sim, axis) = instant();
        axis.move_index(Direction::Negative, MoveMode::Blocking).unwrap();
        assert_eq!(axis.get_position(), -50);
    }

    #[test]
    fn disabled_axis_refuses_motion() {
        let (_sim, axis) = instant();
        axis.disable(DisableMode::Immediate).unwrap();
        assert_eq!(
            axis.jog(Direction::Positive, None, MoveMode::Blocking),
            Err(Error::NotReady("axis disabled"))
        );
        axis.enable().unwrap();
        assert!(axis.jog(Direction::Positive, None, MoveMode::Blocking).is_ok());
    }

    #[test]
    fn soft_disable_keeps_driver_energised_for_hold() {
        let sim = Arc::new(SimulatedLink::with_instant_moves());
        let cfg = AxisConfig {
            hold_ms: 100,
            ..AxisConfig::default()
        };
        let axis = axis_on(&sim, cfg);
        // Active-low enable: low = energised.
        assert_eq!(sim.level(27), Some(false));
        axis.disable(DisableMode::Soft).unwrap();
        assert!(axis.move_to(10, MoveMode::Blocking).is_err());
        assert_eq!(sim.level(27), Some(false));
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(sim.level(27), Some(true));
    }

    #[test]
    fn link_failure_leaves_position_unchanged() {
        let (sim, axis) = instant();
        axis.move_to(30, MoveMode::Blocking).unwrap();
        sim.set_offline(true);
        assert!(matches!(
            axis.move_to(100, MoveMode::Blocking),
            Err(Error::LinkUnavailable(_))
        ));
        assert_eq!(axis.get_position(), 30);
        assert!(!axis.is_moving());
    }

    #[test]
    fn home_finds_switch_and_zeroes() {
        let (_sim, axis) = instant();
        axis.move_to(100, MoveMode::Blocking).unwrap();
        assert_eq!(axis.home(true), Ok(Motion::Completed));
        assert_eq!(axis.get_position(), 0);
        assert!(!axis.is_homing());
    }

    #[test]
    fn home_refused_when_travel_excludes_zero() {
        let sim = Arc::new(SimulatedLink::with_instant_moves());
        let cfg = AxisConfig {
            min_position: 100,
            max_position: 500,
            ..AxisConfig::default()
        };
        let axis = axis_on(&sim, cfg);
        axis.move_to(200, MoveMode::Blocking).unwrap();
        sim.override_switch(0, Switch::Home, Some(true));
        assert!(matches!(axis.home(true), Err(Error::InvalidArgument(_))));
        assert_eq!(axis.get_position(), 200);
        assert!(!axis.is_homing());
    }

    #[test]
    fn home_gives_up_after_budget() {
        let sim = Arc::new(SimulatedLink::with_instant_moves());
        let cfg = AxisConfig {
            min_position: -5000,
            home_max_steps: 200,
            ..AxisConfig::default()
        };
        let axis = axis_on(&sim, cfg);
        axis.move_to(100, MoveMode::Blocking).unwrap();
        sim.override_switch(0, Switch::Home, Some(false));
        assert!(matches!(axis.home(true), Err(Error::Timeout(_))));
        assert_eq!(axis.get_position(), 100);
    }

    #[test]
    fn homing_refused_while_firing() {
        let sim = Arc::new(SimulatedLink::with_instant_moves());
        let safety = Arc::new(SafetySupervisor::new());
        let axis = Arc::new(StepperAxis::new(
            sim,
            AxisConfig::default(),
            Arc::clone(&safety),
            Arc::new(LogEventSink),
        ));
        axis.init().unwrap();
        safety.engage(Activity::Firing).unwrap();
        assert_eq!(
            axis.home(true),
            Err(Error::LimitViolation(Interlock::FiringInProgress))
        );
        assert!(!axis.is_homing());
    }

    #[test]
    fn stop_interrupts_blocking_move() {
        let sim = Arc::new(SimulatedLink::new());
        let cfg = AxisConfig {
            jog_speed: 100,
            ..AxisConfig::default()
        };
        let axis = axis_on(&sim, cfg);
        let mover = Arc::clone(&axis);
        let started = Instant::now();
        let handle = std::thread::spawn(move || {
            mover.jog(Direction::Positive, Some(400), MoveMode::Blocking)
        });
        std::thread::sleep(Duration::from_millis(150));
        axis.stop().unwrap();
        assert_eq!(handle.join().unwrap(), Ok(Motion::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(2));
        let pos = axis.get_position();
        assert!(pos > 0 && pos < 400, "position {pos}");
    }

    #[test]
    fn background_move_completes_on_worker() {
        let (_sim, axis) = instant();
        assert_eq!(axis.move_to(-120, MoveMode::Background), Ok(Motion::Started));
        let deadline = Instant::now() + Duration::from_secs(2);
        while axis.is_moving() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(axis.get_position(), -120);
    }

    #[test]
    fn set_position_clamps() {
        let (_sim, axis) = instant();
        axis.set_position(9999).unwrap();
        assert_eq!(axis.get_position(), 500);
        assert!(axis.set_speed(0).is_err());
    }
}
