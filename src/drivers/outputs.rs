//! Relay outputs: extraction fan, red warning lights, motorised table.
//!
//! ## Table interlocks
//!
//! - Forward is refused while the front end switch is triggered, backward
//!   while the back one is.
//! - Energising one direction de-energises the other first; the two relays
//!   are never on together.
//! - The monitor forces a direction off once its switch triggers.
//!
//! ## Auto-off
//!
//! In `auto` mode the fan and lights follow the trigger servo: while the
//! servo sits away from its normal angle they are held on and their
//! last-activated time refreshed; once back at normal they switch off after
//! `fan_off_delay_ms` / `lights_off_delay_ms`.  `manual` outputs are only
//! driven by explicit calls.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::events::MachineEvent;
use crate::app::ports::EventSink;
use crate::config::{OutputConfig, OutputMode};
use crate::drivers::pin::LinkPin;
use crate::drivers::worker::{self, Worker};
use crate::error::{Error, Interlock, Result};
use crate::link::DeviceLink;
use crate::sync::{CancelToken, lock};

const TABLE_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Output {
    Fan,
    RedLights,
    TableForward,
    TableBackward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableDirection {
    Forward,
    Backward,
}

impl TableDirection {
    fn output(self) -> Output {
        match self {
            Self::Forward => Output::TableForward,
            Self::Backward => Output::TableBackward,
        }
    }

    fn interlock(self) -> Interlock {
        match self {
            Self::Forward => Interlock::TableFrontLimit,
            Self::Backward => Interlock::TableBackLimit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputStatus {
    pub fan_on: bool,
    pub red_lights_on: bool,
    pub table_forward: bool,
    pub table_backward: bool,
    pub table_moving: bool,
    pub table_at_front_limit: bool,
    pub table_at_back_limit: bool,
    pub fan_mode: OutputMode,
    pub lights_mode: OutputMode,
    pub fan_off_delay_ms: u64,
    pub lights_off_delay_ms: u64,
    /// Until auto-off, while on in auto mode.
    pub fan_time_remaining_ms: Option<u64>,
    pub lights_time_remaining_ms: Option<u64>,
    pub simulated: bool,
}

#[derive(Debug)]
struct OutputState {
    fan_on: bool,
    lights_on: bool,
    table_forward: bool,
    table_backward: bool,
    at_front_limit: bool,
    at_back_limit: bool,
    fan_mode: OutputMode,
    lights_mode: OutputMode,
    fan_last_on: Option<Instant>,
    lights_last_on: Option<Instant>,
    fan_off_delay_ms: u64,
    lights_off_delay_ms: u64,
}

#[derive(Debug)]
struct Pins {
    fan: LinkPin,
    lights: LinkPin,
    forward: LinkPin,
    backward: LinkPin,
    front_switch: LinkPin,
    back_switch: LinkPin,
}

impl Pins {
    fn relay(&mut self, output: Output) -> &mut LinkPin {
        match output {
            Output::Fan => &mut self.fan,
            Output::RedLights => &mut self.lights,
            Output::TableForward => &mut self.forward,
            Output::TableBackward => &mut self.backward,
        }
    }

    fn switch(&mut self, direction: TableDirection) -> &mut LinkPin {
        match direction {
            TableDirection::Forward => &mut self.front_switch,
            TableDirection::Backward => &mut self.back_switch,
        }
    }
}

pub struct OutputBank {
    link: Arc<dyn DeviceLink>,
    cfg: OutputConfig,
    sink: Arc<dyn EventSink>,
    /// Doubles as the command lock.
    pins: Mutex<Pins>,
    state: Mutex<OutputState>,
}

impl OutputBank {
    pub fn new(link: Arc<dyn DeviceLink>, cfg: OutputConfig, sink: Arc<dyn EventSink>) -> Self {
        let out = |pin| LinkPin::new(Arc::clone(&link), pin, false);
        let switch = |pin| LinkPin::new(Arc::clone(&link), pin, cfg.switches_active_low);
        let pins = Pins {
            fan: out(cfg.fan_pin),
            lights: out(cfg.red_lights_pin),
            forward: out(cfg.table_forward_pin),
            backward: out(cfg.table_backward_pin),
            front_switch: switch(cfg.table_front_switch_pin),
            back_switch: switch(cfg.table_back_switch_pin),
        };
        let state = OutputState {
            fan_on: false,
            lights_on: false,
            table_forward: false,
            table_backward: false,
            at_front_limit: false,
            at_back_limit: false,
            fan_mode: cfg.fan_mode,
            lights_mode: cfg.lights_mode,
            fan_last_on: None,
            lights_last_on: None,
            fan_off_delay_ms: cfg.fan_off_delay_ms,
            lights_off_delay_ms: cfg.lights_off_delay_ms,
        };
        Self {
            link,
            cfg,
            sink,
            pins: Mutex::new(pins),
            state: Mutex::new(state),
        }
    }

    // -----------------------------------------------------------------------
    // Fan and lights
    // -----------------------------------------------------------------------

    pub fn set_fan(&self, on: bool) -> Result<()> {
        let mut pins = lock(&self.pins);
        self.drive(&mut pins, Output::Fan, on)
    }

    pub fn set_red_lights(&self, on: bool) -> Result<()> {
        let mut pins = lock(&self.pins);
        self.drive(&mut pins, Output::RedLights, on)
    }

    pub fn set_fan_mode(&self, mode: OutputMode) {
        lock(&self.state).fan_mode = mode;
        info!("Fan mode: {mode:?}");
    }

    pub fn set_lights_mode(&self, mode: OutputMode) {
        lock(&self.state).lights_mode = mode;
        info!("Lights mode: {mode:?}");
    }

    pub fn update_timing(&self, fan_off_delay_ms: u64, lights_off_delay_ms: u64) {
        let mut st = lock(&self.state);
        info!(
            "Timing updated: fan delay {}ms -> {fan_off_delay_ms}ms, lights delay {}ms -> {lights_off_delay_ms}ms",
            st.fan_off_delay_ms, st.lights_off_delay_ms
        );
        st.fan_off_delay_ms = fan_off_delay_ms;
        st.lights_off_delay_ms = lights_off_delay_ms;
    }

    /// Auto-mode fan and lights from the servo angle.
    pub fn update(&self, servo_angle: u16, normal_angle: u16) -> Result<()> {
        let mut pins = lock(&self.pins);
        let now = Instant::now();
        let firing = servo_angle != normal_angle;

        let (fan, lights) = {
            let mut guard = lock(&self.state);
            let st = &mut *guard;
            let fan = auto_target(
                st.fan_mode,
                st.fan_on,
                firing,
                &mut st.fan_last_on,
                st.fan_off_delay_ms,
                now,
            );
            let lights = auto_target(
                st.lights_mode,
                st.lights_on,
                firing,
                &mut st.lights_last_on,
                st.lights_off_delay_ms,
                now,
            );
            (fan, lights)
        };

        let mut result = Ok(());
        if let Some(on) = fan {
            if !on {
                info!("Fan auto-off");
            }
            result = self.drive(&mut pins, Output::Fan, on);
        }
        if let Some(on) = lights {
            if !on {
                info!("Red lights auto-off");
            }
            result = result.and(self.drive(&mut pins, Output::RedLights, on));
        }
        result
    }

    // -----------------------------------------------------------------------
    // Table
    // -----------------------------------------------------------------------

    pub fn set_table_forward(&self, on: bool) -> Result<()> {
        self.set_table(TableDirection::Forward, on)
    }

    pub fn set_table_backward(&self, on: bool) -> Result<()> {
        self.set_table(TableDirection::Backward, on)
    }

    fn set_table(&self, direction: TableDirection, on: bool) -> Result<()> {
        let mut pins = lock(&self.pins);
        if !on {
            return self.drive(&mut pins, direction.output(), false);
        }

        if self.read_switch(&mut pins, direction)? {
            warn!("Cannot move table {direction:?}: {}", direction.interlock());
            return Err(direction.interlock().into());
        }

        let opposite = match direction {
            TableDirection::Forward => Output::TableBackward,
            TableDirection::Backward => Output::TableForward,
        };
        if self.is_on(opposite) {
            info!("Stopping {opposite:?} before {direction:?}");
        }
        // Always drop the opposite relay first, even if we believe it off.
        self.drive(&mut pins, opposite, false)?;
        self.drive(&mut pins, direction.output(), true)
    }

    pub fn stop_table(&self) -> Result<()> {
        let mut pins = lock(&self.pins);
        let fwd = self.drive(&mut pins, Output::TableForward, false);
        let bwd = self.drive(&mut pins, Output::TableBackward, false);
        info!("Table movement stopped");
        fwd.and(bwd)
    }

    /// Drive the table toward `direction` until its end switch triggers.
    pub fn run_table_to_limit(
        &self,
        direction: TableDirection,
        timeout: Duration,
        token: &CancelToken,
    ) -> Result<()> {
        if self.at_limit(direction)? {
            info!("Table already at {direction:?} limit");
            return Ok(());
        }
        self.set_table(direction, true)?;
        let deadline = Instant::now() + timeout;
        let slice = TABLE_SLICE.min(Duration::from_millis(self.cfg.poll_interval_ms));

        loop {
            if token.is_cancelled() {
                self.stop_table()?;
                return Err(Error::Cancelled);
            }
            match self.at_limit(direction) {
                Ok(true) => {
                    info!("Table reached {direction:?} limit");
                    return self.set_table(direction, false);
                }
                Ok(false) => {}
                Err(e) => debug!("Table switch read failed: {e}"),
            }
            if Instant::now() >= deadline {
                warn!("Table never reached {direction:?} limit, stopping");
                self.stop_table()?;
                return Err(Error::Timeout(format!(
                    "table {direction:?} limit within {} ms",
                    timeout.as_millis()
                )));
            }
            std::thread::sleep(slice);
        }
    }

    /// Configured upper bound for [`run_table_to_limit`](Self::run_table_to_limit).
    pub fn table_run_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.table_run_timeout_ms)
    }

    /// Fresh reading of the end switch toward `direction`.
    pub fn at_limit(&self, direction: TableDirection) -> Result<bool> {
        let mut pins = lock(&self.pins);
        self.read_switch(&mut pins, direction)
    }

    /// Read both end switches; a triggered switch forces the relay driving
    /// toward it off.
    pub fn poll_limits(&self) -> Result<()> {
        let mut pins = lock(&self.pins);
        for direction in [TableDirection::Forward, TableDirection::Backward] {
            let triggered = self.read_switch(&mut pins, direction)?;
            if triggered && self.is_on(direction.output()) {
                info!("Table reached {direction:?} limit switch");
                self.drive(&mut pins, direction.output(), false)?;
                self.sink.emit(&MachineEvent::LimitTriggered {
                    interlock: direction.interlock(),
                });
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Everything off.  Every relay is attempted.
    pub fn stop_all_outputs(&self) -> Result<()> {
        let mut pins = lock(&self.pins);
        let mut result = Ok(());
        for output in [
            Output::TableForward,
            Output::TableBackward,
            Output::Fan,
            Output::RedLights,
        ] {
            if let Err(e) = self.drive(&mut pins, output, false) {
                error!("Failed to switch off {output:?}: {e}");
                result = result.and(Err(e));
            }
        }
        info!("All outputs stopped");
        result
    }

    // -----------------------------------------------------------------------
    // Monitor
    // -----------------------------------------------------------------------

    /// Poll table switches and auto-off every `poll_interval_ms`.
    ///
    /// `angles` yields the servo's `(current, normal)` angle.
    pub fn spawn_monitor<F>(self: &Arc<Self>, angles: F, token: CancelToken) -> Result<Worker>
    where
        F: Fn() -> (u16, u16) + Send + 'static,
    {
        let bank = Arc::clone(self);
        worker::spawn("output-monitor", move || {
            let period = Duration::from_millis(bank.cfg.poll_interval_ms);
            let mut failing = false;
            while token.sleep(period, TABLE_SLICE.min(period)) {
                let (current, normal) = angles();
                let result = bank.poll_limits().and(bank.update(current, normal));
                match result {
                    Ok(()) if failing => {
                        info!("Output monitor recovered");
                        failing = false;
                    }
                    Ok(()) => {}
                    Err(e) if !failing => {
                        error!("Error monitoring outputs: {e}");
                        failing = true;
                    }
                    Err(_) => {}
                }
            }
            debug!("Output monitor stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn is_on(&self, output: Output) -> bool {
        let st = lock(&self.state);
        match output {
            Output::Fan => st.fan_on,
            Output::RedLights => st.lights_on,
            Output::TableForward => st.table_forward,
            Output::TableBackward => st.table_backward,
        }
    }

    pub fn get_status(&self) -> OutputStatus {
        let st = lock(&self.state);
        let now = Instant::now();
        let remaining = |on: bool, mode: OutputMode, last: Option<Instant>, delay: u64| {
            if !on || mode == OutputMode::Manual {
                return None;
            }
            let elapsed = last.map_or(0, |t| now.saturating_duration_since(t).as_millis() as u64);
            Some(delay.saturating_sub(elapsed))
        };
        OutputStatus {
            fan_on: st.fan_on,
            red_lights_on: st.lights_on,
            table_forward: st.table_forward,
            table_backward: st.table_backward,
            table_moving: st.table_forward || st.table_backward,
            table_at_front_limit: st.at_front_limit,
            table_at_back_limit: st.at_back_limit,
            fan_mode: st.fan_mode,
            lights_mode: st.lights_mode,
            fan_off_delay_ms: st.fan_off_delay_ms,
            lights_off_delay_ms: st.lights_off_delay_ms,
            fan_time_remaining_ms: remaining(st.fan_on, st.fan_mode, st.fan_last_on, st.fan_off_delay_ms),
            lights_time_remaining_ms: remaining(
                st.lights_on,
                st.lights_mode,
                st.lights_last_on,
                st.lights_off_delay_ms,
            ),
            simulated: self.link.is_simulated(),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers (callers hold the pin lock)
    // -----------------------------------------------------------------------

    fn drive(&self, pins: &mut Pins, output: Output, on: bool) -> Result<()> {
        pins.relay(output).set_active(on)?;
        let changed = {
            let mut st = lock(&self.state);
            let slot = match output {
                Output::Fan => &mut st.fan_on,
                Output::RedLights => &mut st.lights_on,
                Output::TableForward => &mut st.table_forward,
                Output::TableBackward => &mut st.table_backward,
            };
            let changed = *slot != on;
            *slot = on;
            if on {
                match output {
                    Output::Fan => st.fan_last_on = Some(Instant::now()),
                    Output::RedLights => st.lights_last_on = Some(Instant::now()),
                    _ => {}
                }
            }
            changed
        };
        if changed {
            debug!("{output:?} {}", if on { "on" } else { "off" });
            self.sink.emit(&MachineEvent::OutputChanged { output, on });
        }
        Ok(())
    }

    fn read_switch(&self, pins: &mut Pins, direction: TableDirection) -> Result<bool> {
        let active = pins.switch(direction).is_active()?;
        let mut st = lock(&self.state);
        match direction {
            TableDirection::Forward => st.at_front_limit = active,
            TableDirection::Backward => st.at_back_limit = active,
        }
        Ok(active)
    }
}

/// Auto-mode decision for one output: `Some(level)` to drive, `None` to
/// leave alone.  Refreshes `last_on` while the servo is away from normal.
fn auto_target(
    mode: OutputMode,
    on: bool,
    firing: bool,
    last_on: &mut Option<Instant>,
    delay_ms: u64,
    now: Instant,
) -> Option<bool> {
    if mode == OutputMode::Manual {
        return None;
    }
    if firing {
        *last_on = Some(now);
        return (!on).then_some(true);
    }
    let expired = last_on.is_none_or(|t| now.saturating_duration_since(t) > Duration::from_millis(delay_ms));
    (on && expired).then_some(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::log_sink::LogEventSink;
    use crate::link::SimulatedLink;

    const FRONT: u32 = 21;
    const BACK: u32 = 20;

    fn bank(cfg: OutputConfig) -> (Arc<SimulatedLink>, Arc<OutputBank>) {
        let sim = Arc::new(SimulatedLink::new());
        let bank = Arc::new(OutputBank::new(sim.clone(), cfg, Arc::new(LogEventSink)));
        (sim, bank)
    }

    #[test]
    fn forward_refused_at_front_limit() {
        let (sim, bank) = bank(OutputConfig::default());
        sim.set_level(FRONT, false);
        assert_eq!(
            bank.set_table_forward(true),
            Err(Error::LimitViolation(Interlock::TableFrontLimit))
        );
        assert!(!bank.is_on(Output::TableForward));
        assert!(bank.set_table_backward(true).is_ok());
    }

    #[test]
    fn backward_refused_at_back_limit() {
        let (sim, bank) = bank(OutputConfig::default());
        sim.set_level(BACK, false);
        assert_eq!(
            bank.set_table_backward(true),
            Err(Error::LimitViolation(Interlock::TableBackLimit))
        );
    }

    #[test]
    fn directions_are_mutually_exclusive() {
        let (sim, bank) = bank(OutputConfig::default());
        bank.set_table_forward(true).unwrap();
        bank.set_table_backward(true).unwrap();
        assert!(!bank.is_on(Output::TableForward));
        assert!(bank.is_on(Output::TableBackward));
        assert_eq!(sim.level(13), Some(false));
        assert_eq!(sim.level(6), Some(true));
    }

    #[test]
    fn triggered_limit_forces_direction_off() {
        let (sim, bank) = bank(OutputConfig::default());
        bank.set_table_forward(true).unwrap();
        bank.poll_limits().unwrap();
        assert!(bank.is_on(Output::TableForward));
        sim.set_level(FRONT, false);
        bank.poll_limits().unwrap();
        assert!(!bank.is_on(Output::TableForward));
        assert!(bank.get_status().table_at_front_limit);
    }

    #[test]
    fn auto_outputs_follow_servo_then_time_out() {
        let (_sim, bank) = bank(OutputConfig {
            fan_off_delay_ms: 60,
            lights_off_delay_ms: 20,
            ..OutputConfig::default()
        });
        bank.update(90, 0).unwrap();
        assert!(bank.is_on(Output::Fan) && bank.is_on(Output::RedLights));
        bank.update(0, 0).unwrap();
        assert!(bank.is_on(Output::Fan));
        std::thread::sleep(Duration::from_millis(40));
        bank.update(0, 0).unwrap();
        assert!(bank.is_on(Output::Fan));
        assert!(!bank.is_on(Output::RedLights));
        std::thread::sleep(Duration::from_millis(40));
        bank.update(0, 0).unwrap();
        assert!(!bank.is_on(Output::Fan));
    }

    #[test]
    fn manual_outputs_are_left_alone() {
        let (_sim, bank) = bank(OutputConfig {
            fan_mode: OutputMode::Manual,
            ..OutputConfig::default()
        });
        bank.update(90, 0).unwrap();
        assert!(!bank.is_on(Output::Fan));
        assert!(bank.is_on(Output::RedLights));
        assert_eq!(bank.get_status().fan_time_remaining_ms, None);
    }

    #[test]
    fn status_reports_time_remaining() {
        let (_sim, bank) = bank(OutputConfig::default());
        bank.update(90, 0).unwrap();
        let st = bank.get_status();
        let fan_left = st.fan_time_remaining_ms.unwrap();
        assert!(fan_left > 590_000 && fan_left <= 600_000);
    }

    #[test]
    fn run_to_limit_stops_at_switch() {
        let (sim, bank) = bank(OutputConfig::default());
        let remote = Arc::clone(&sim);
        let trip = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            remote.set_level(BACK, false);
        });
        bank.run_table_to_limit(TableDirection::Backward, Duration::from_secs(2), &CancelToken::new())
            .unwrap();
        trip.join().unwrap();
        assert!(!bank.is_on(Output::TableBackward));
    }

    #[test]
    fn run_to_limit_times_out() {
        let (_sim, bank) = bank(OutputConfig::default());
        let err = bank
            .run_table_to_limit(TableDirection::Forward, Duration::from_millis(50), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(!bank.get_status().table_moving);
    }

    #[test]
    fn stop_all_switches_everything_off() {
        let (_sim, bank) = bank(OutputConfig::default());
        bank.set_fan(true).unwrap();
        bank.set_red_lights(true).unwrap();
        bank.set_table_forward(true).unwrap();
        bank.stop_all_outputs().unwrap();
        let st = bank.get_status();
        assert!(!st.fan_on && !st.red_lights_on && !st.table_moving);
    }
}
