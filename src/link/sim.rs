//! Simulated backend used when no coprocessor is attached, and by tests.
//!
//! A move lasts `steps / speed` seconds of wall time (or none at all with
//! [`SimulatedLink::with_instant_moves`]).  Position is interpolated while
//! the move runs and clamped to the soft limits given at `init_stepper`.
//! Switch feedback follows the position: `limit_a` at or below `min`,
//! `limit_b` at or above `max`, `home` at or below zero.  Any switch can be
//! pinned to a fixed value for testing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::debug;

use super::{Backend, DeviceLink, Direction, Feedback, SoftLimits, StepperPins};
use crate::error::{Error, Result};
use crate::sync::lock;

const BLOCKING_SLICE: Duration = Duration::from_millis(5);

/// Axis switch that can be pinned by a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    LimitA,
    LimitB,
    Home,
}

#[derive(Debug, Default, Clone, Copy)]
struct Overrides {
    limit_a: Option<bool>,
    limit_b: Option<bool>,
    home: Option<bool>,
}

#[derive(Debug)]
struct SimAxis {
    limits: SoftLimits,
    origin: i64,
    target: i64,
    started: Instant,
    travel: Duration,
    halted: bool,
    overrides: Overrides,
}

impl SimAxis {
    fn new(limits: SoftLimits) -> Self {
        Self {
            limits,
            origin: 0,
            target: 0,
            started: Instant::now(),
            travel: Duration::ZERO,
            halted: true,
            overrides: Overrides::default(),
        }
    }

    fn position(&self, now: Instant) -> i64 {
        if self.halted || self.travel.is_zero() {
            return self.target;
        }
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.travel {
            return self.target;
        }
        let frac = elapsed.as_secs_f64() / self.travel.as_secs_f64();
        let covered = ((self.target - self.origin) as f64 * frac) as i64;
        self.origin + covered
    }

    fn moving(&self, now: Instant) -> bool {
        !self.halted && now.saturating_duration_since(self.started) < self.travel
    }

    fn halt(&mut self, now: Instant) {
        let here = self.position(now);
        self.origin = here;
        self.target = here;
        self.halted = true;
    }

    fn feedback(&self, now: Instant) -> Feedback {
        let position = self.position(now);
        Feedback {
            limit_a: self
                .overrides
                .limit_a
                .unwrap_or(position <= self.limits.min),
            limit_b: self
                .overrides
                .limit_b
                .unwrap_or(position >= self.limits.max),
            home: self.overrides.home.unwrap_or(position <= 0),
            moving: self.moving(now),
            position,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    axes: HashMap<u8, SimAxis>,
    levels: HashMap<u32, bool>,
    servos: HashMap<u32, u16>,
}

/// In-memory stand-in for the coprocessor and local GPIO.
#[derive(Debug)]
pub struct SimulatedLink {
    state: Mutex<SimState>,
    instant: bool,
    offline: AtomicBool,
}

impl Default for SimulatedLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedLink {
    /// Realtime simulation: moves take `steps / speed` seconds.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            instant: false,
            offline: AtomicBool::new(false),
        }
    }

    /// Moves complete the moment they are commanded.
    pub fn with_instant_moves() -> Self {
        Self {
            instant: true,
            ..Self::new()
        }
    }

    // --- test hooks ---

    /// Make every operation fail with `LinkUnavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Pin a switch to `value`, or `None` to follow the position again.
    pub fn override_switch(&self, axis: u8, switch: Switch, value: Option<bool>) {
        let mut st = lock(&self.state);
        let ax = st
            .axes
            .entry(axis)
            .or_insert_with(|| SimAxis::new(SoftLimits { min: i64::MIN, max: i64::MAX }));
        match switch {
            Switch::LimitA => ax.overrides.limit_a = value,
            Switch::LimitB => ax.overrides.limit_b = value,
            Switch::Home => ax.overrides.home = value,
        }
    }

    /// Drive an input pin to a raw electrical level.
    pub fn set_level(&self, pin: u32, high: bool) {
        lock(&self.state).levels.insert(pin, high);
    }

    /// Last level written to or forced on `pin`.
    pub fn level(&self, pin: u32) -> Option<bool> {
        lock(&self.state).levels.get(&pin).copied()
    }

    /// Last angle commanded on a servo pin.
    pub fn servo_angle(&self, pin: u32) -> Option<u16> {
        lock(&self.state).servos.get(&pin).copied()
    }

    /// Teleport an axis, cancelling any move in flight.
    pub fn place_axis(&self, axis: u8, position: i64) {
        let mut st = lock(&self.state);
        if let Some(ax) = st.axes.get_mut(&axis) {
            ax.origin = position;
            ax.target = position;
            ax.halted = true;
        }
    }

    fn online(&self) -> Result<()> {
        if self.offline.load(Ordering::Acquire) {
            return Err(Error::LinkUnavailable("simulated link offline".into()));
        }
        Ok(())
    }

    fn with_axis<T>(&self, axis: u8, f: impl FnOnce(&mut SimAxis, Instant) -> T) -> Result<T> {
        self.online()?;
        let mut st = lock(&self.state);
        let ax = st
            .axes
            .get_mut(&axis)
            .ok_or_else(|| Error::HardwareRejected(format!("stepper {axis} not initialised")))?;
        Ok(f(ax, Instant::now()))
    }
}

impl DeviceLink for SimulatedLink {
    fn backend(&self) -> Backend {
        Backend::Simulated
    }

    fn init_stepper(&self, axis: u8, pins: &StepperPins, limits: SoftLimits) -> Result<()> {
        self.online()?;
        if limits.min >= limits.max {
            return Err(Error::InvalidArgument(format!(
                "soft limits {}..{} are empty",
                limits.min, limits.max
            )));
        }
        debug!("SIM: init stepper {axis} on step {} dir {}", pins.step, pins.dir);
        let mut st = lock(&self.state);
        let ax = st.axes.entry(axis).or_insert_with(|| SimAxis::new(limits));
        ax.limits = limits;
        let now = Instant::now();
        let here = ax.position(now).clamp(limits.min, limits.max);
        ax.origin = here;
        ax.target = here;
        ax.halted = true;
        Ok(())
    }

    fn move_stepper(
        &self,
        axis: u8,
        steps: u32,
        direction: Direction,
        speed: u32,
        blocking: bool,
    ) -> Result<()> {
        let instant = self.instant;
        self.with_axis(axis, |ax, now| {
            let from = ax.position(now);
            let to = (from + direction.sign() * i64::from(steps))
                .clamp(ax.limits.min, ax.limits.max);
            let travel = if instant {
                Duration::ZERO
            } else {
                Duration::from_secs_f64((to - from).unsigned_abs() as f64 / f64::from(speed.max(1)))
            };
            ax.origin = from;
            ax.target = to;
            ax.started = now;
            ax.travel = travel;
            ax.halted = false;
            debug!("SIM: stepper {axis} {from} -> {to} over {} ms", travel.as_millis());
        })?;

        if blocking {
            while self.with_axis(axis, |ax, now| ax.moving(now))? {
                std::thread::sleep(BLOCKING_SLICE);
            }
        }
        Ok(())
    }

    fn stop_stepper(&self, axis: u8) -> Result<()> {
        self.with_axis(axis, |ax, now| ax.halt(now))
    }

    fn zero_position(&self, axis: u8) -> Result<bool> {
        self.with_axis(axis, |ax, _| {
            ax.origin = 0;
            ax.target = 0;
            ax.halted = true;
            true
        })
    }

    fn set_pin(&self, pin: u32, high: bool) -> Result<()> {
        self.online()?;
        lock(&self.state).levels.insert(pin, high);
        Ok(())
    }

    fn read_pin(&self, pin: u32) -> Result<bool> {
        self.online()?;
        // Unset inputs float high through their pull-ups.
        Ok(lock(&self.state).levels.get(&pin).copied().unwrap_or(true))
    }

    fn set_servo(&self, pin: u32, angle: u16) -> Result<()> {
        self.online()?;
        if angle > 180 {
            return Err(Error::HardwareRejected(format!("servo angle {angle} out of range")));
        }
        lock(&self.state).servos.insert(pin, angle);
        Ok(())
    }

    fn feedback(&self, axis: u8) -> Result<Feedback> {
        self.with_axis(axis, |ax, now| ax.feedback(now))
    }
}
