//! Physical operator inputs: in/out jog buttons, fire button, invert switch.
//!
//! Buttons are polled, debounced by [`ButtonDriver`], and their gestures
//! turned into [`AppCommand`]s sent on a channel.  The monitor never calls
//! an actuator itself; the machine dispatches whatever arrives.
//!
//! | Input       | Pressed      | Released   | LongPress         | DoublePress    |
//! |-------------|--------------|------------|-------------------|----------------|
//! | button_in   | jog backward | axis stop  | move to min       | index backward |
//! | button_out  | jog forward  | axis stop  | move to max       | index forward  |
//! | fire_button | fire         | stop fire  | fiber sequence    | -              |
//!
//! A fire-button release that follows a long press leaves the fiber
//! sequence running; the next press ends it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, info, warn};

use crate::app::commands::AppCommand;
use crate::config::InputConfig;
use crate::drivers::button::{ButtonDriver, ButtonEvent, ButtonTiming};
use crate::drivers::pin::LinkPin;
use crate::drivers::worker::{self, Worker};
use crate::error::Result;
use crate::link::{DeviceLink, Direction};
use crate::sync::{CancelToken, lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonId {
    In,
    Out,
    Fire,
}

impl ButtonId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::In => "button_in",
            Self::Out => "button_out",
            Self::Fire => "fire_button",
        }
    }

    pub fn parse(id: &str) -> Option<Self> {
        match id {
            "button_in" => Some(Self::In),
            "button_out" => Some(Self::Out),
            "fire_button" => Some(Self::Fire),
            _ => None,
        }
    }
}

struct Channel {
    id: ButtonId,
    pin: LinkPin,
    driver: ButtonDriver,
}

struct MonitorState {
    channels: Vec<Channel>,
    invert: LinkPin,
    invert_level: Option<bool>,
    /// Fire button was held into a long press.
    fire_long: bool,
}

pub struct InputMonitor {
    cfg: InputConfig,
    state: Mutex<MonitorState>,
    epoch: Instant,
}

impl InputMonitor {
    pub fn new(link: Arc<dyn DeviceLink>, cfg: InputConfig) -> Self {
        let timing = ButtonTiming::from(&cfg);
        let pin = |p| LinkPin::new(Arc::clone(&link), p, cfg.active_low);
        let channels = [
            (ButtonId::In, cfg.button_in_pin),
            (ButtonId::Out, cfg.button_out_pin),
            (ButtonId::Fire, cfg.fire_button_pin),
        ]
        .into_iter()
        .map(|(id, p)| Channel {
            id,
            pin: pin(p),
            driver: ButtonDriver::new(timing),
        })
        .collect();
        let state = MonitorState {
            channels,
            invert: pin(cfg.invert_switch_pin),
            invert_level: None,
            fire_long: false,
        };
        Self {
            cfg,
            state: Mutex::new(state),
            epoch: Instant::now(),
        }
    }

    /// Fresh logical state of a button.  `None` for ids this monitor does
    /// not own.
    pub fn is_active(&self, input_id: &str) -> Option<bool> {
        let id = ButtonId::parse(input_id)?;
        let mut st = lock(&self.state);
        let ch = st.channels.iter_mut().find(|c| c.id == id)?;
        match ch.pin.is_active() {
            Ok(active) => Some(active),
            Err(e) => {
                warn!("Reading {input_id} failed: {}", e.0);
                Some(false)
            }
        }
    }

    /// Sample every input once at `now_ms` and translate gestures.
    pub fn poll(&self, now_ms: u64) -> Result<Vec<AppCommand>> {
        let mut st = lock(&self.state);
        let mut commands = Vec::new();

        for i in 0..st.channels.len() {
            let ch = &mut st.channels[i];
            let pressed = ch.pin.is_active()?;
            let id = ch.id;
            let events = ch.driver.sample(pressed, now_ms);
            for event in events {
                debug!("{} {event:?}", id.as_str());
                if let Some(cmd) = Self::translate(id, event, &mut st.fire_long) {
                    commands.push(cmd);
                }
            }
        }

        let level = st.invert.is_active()?;
        if st.invert_level != Some(level) {
            st.invert_level = Some(level);
            info!("Servo invert switch {}", if level { "enabled" } else { "disabled" });
            commands.push(AppCommand::SetInverted { inverted: level });
        }
        Ok(commands)
    }

    fn translate(id: ButtonId, event: ButtonEvent, fire_long: &mut bool) -> Option<AppCommand> {
        use ButtonEvent as E;
        let toward = |dir: Direction| match id {
            ButtonId::In => Direction::Negative,
            ButtonId::Out | ButtonId::Fire => dir,
        };
        match (id, event) {
            (ButtonId::In | ButtonId::Out, E::Pressed) => Some(AppCommand::Jog {
                direction: toward(Direction::Positive),
                steps: None,
            }),
            (ButtonId::In | ButtonId::Out, E::Released { .. }) => Some(AppCommand::AxisStop),
            (ButtonId::In, E::LongPress) => Some(AppCommand::MoveToMin),
            (ButtonId::Out, E::LongPress) => Some(AppCommand::MoveToMax),
            (ButtonId::In | ButtonId::Out, E::DoublePress) => Some(AppCommand::MoveIndex {
                direction: toward(Direction::Positive),
            }),
            (ButtonId::Fire, E::Pressed) => {
                *fire_long = false;
                Some(AppCommand::Fire)
            }
            (ButtonId::Fire, E::LongPress) => {
                *fire_long = true;
                Some(AppCommand::StartFiberSequence)
            }
            (ButtonId::Fire, E::Released { .. }) => {
                if std::mem::take(fire_long) {
                    None
                } else {
                    Some(AppCommand::StopFire)
                }
            }
            (ButtonId::Fire, E::DoublePress) => None,
        }
    }

    /// Poll every `poll_interval_ms` and send commands until `token` fires
    /// or the receiver goes away.
    pub fn spawn(self: &Arc<Self>, commands: Sender<AppCommand>, token: CancelToken) -> Result<Worker> {
        let monitor = Arc::clone(self);
        worker::spawn("input-monitor", move || {
            let period = Duration::from_millis(monitor.cfg.poll_interval_ms);
            let mut failing = false;
            info!("Input monitor running every {} ms", period.as_millis());
            while token.sleep(period, period) {
                let now_ms = monitor.epoch.elapsed().as_millis() as u64;
                match monitor.poll(now_ms) {
                    Ok(cmds) => {
                        failing = false;
                        for cmd in cmds {
                            if commands.send(cmd).is_err() {
                                debug!("Command receiver gone, input monitor exiting");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        if !failing {
                            warn!("Input poll failed: {e}");
                            failing = true;
                        }
                    }
                }
            }
            debug!("Input monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::SimulatedLink;

    const IN: u32 = 5;
    const FIRE: u32 = 22;
    const INVERT: u32 = 12;

    fn monitor() -> (Arc<SimulatedLink>, InputMonitor) {
        let sim = Arc::new(SimulatedLink::new());
        // Invert switch open (inactive) before the first poll.
        let m = InputMonitor::new(sim.clone(), InputConfig::default());
        (sim, m)
    }

    fn hold(sim: &SimulatedLink, m: &InputMonitor, pin: u32, from: u64, to: u64) -> Vec<AppCommand> {
        sim.set_level(pin, false);
        let mut out = Vec::new();
        let mut t = from;
        while t <= to {
            out.extend(m.poll(t).unwrap());
            t += 20;
        }
        out
    }

    fn let_go(sim: &SimulatedLink, m: &InputMonitor, pin: u32, at: u64) -> Vec<AppCommand> {
        sim.set_level(pin, true);
        let mut out = m.poll(at).unwrap();
        out.extend(m.poll(at + 60).unwrap());
        out
    }

    #[test]
    fn first_poll_reports_invert_switch() {
        let (sim, m) = monitor();
        assert_eq!(
            m.poll(0).unwrap(),
            vec![AppCommand::SetInverted { inverted: false }]
        );
        sim.set_level(INVERT, false);
        assert_eq!(
            m.poll(20).unwrap(),
            vec![AppCommand::SetInverted { inverted: true }]
        );
    }

    #[test]
    fn in_button_jogs_backward_and_stops_on_release() {
        let (sim, m) = monitor();
        m.poll(0).unwrap();
        let pressed = hold(&sim, &m, IN, 20, 100);
        assert_eq!(
            pressed,
            vec![AppCommand::Jog {
                direction: Direction::Negative,
                steps: None
            }]
        );
        assert_eq!(let_go(&sim, &m, IN, 200), vec![AppCommand::AxisStop]);
    }

    #[test]
    fn long_fire_press_starts_fiber_and_survives_release() {
        let (sim, m) = monitor();
        m.poll(0).unwrap();
        let cmds = hold(&sim, &m, FIRE, 20, 1200);
        assert_eq!(cmds, vec![AppCommand::Fire, AppCommand::StartFiberSequence]);
        assert!(let_go(&sim, &m, FIRE, 1300).is_empty());
    }

    #[test]
    fn short_fire_press_fires_and_stops() {
        let (sim, m) = monitor();
        m.poll(0).unwrap();
        assert_eq!(hold(&sim, &m, FIRE, 20, 200), vec![AppCommand::Fire]);
        assert_eq!(let_go(&sim, &m, FIRE, 300), vec![AppCommand::StopFire]);
    }

    #[test]
    fn probe_reads_buttons_only() {
        let (sim, m) = monitor();
        assert_eq!(m.is_active("button_in"), Some(false));
        sim.set_level(IN, false);
        assert_eq!(m.is_active("button_in"), Some(true));
        assert_eq!(m.is_active("table_front_limit"), None);
    }
}
