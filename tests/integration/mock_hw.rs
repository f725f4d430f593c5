//! Shared rig for integration tests.
//!
//! Every test drives a real [`Machine`] over the [`SimulatedLink`] and
//! records emitted events so it can assert on what the outside world
//! would have seen.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use laserroom::app::Machine;
use laserroom::app::events::MachineEvent;
use laserroom::app::ports::EventSink;
use laserroom::config::MachineConfig;
use laserroom::link::SimulatedLink;

// ── CollectingSink ────────────────────────────────────────────

#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<MachineEvent>>,
}

#[allow(dead_code)]
impl CollectingSink {
    pub fn events(&self) -> Vec<MachineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&MachineEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub fn contains(&self, event: &MachineEvent) -> bool {
        self.events.lock().unwrap().contains(event)
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &MachineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ── Rig ───────────────────────────────────────────────────────

pub struct Rig {
    pub sim: Arc<SimulatedLink>,
    pub sink: Arc<CollectingSink>,
    pub machine: Machine,
    pub cfg: MachineConfig,
}

/// Defaults with the slow timers shortened for tests.
pub fn quick_config() -> MachineConfig {
    let mut cfg = MachineConfig::default();
    cfg.fire.sequence_delay_ms = 30;
    cfg.fire.fire_threshold_ms = 50;
    cfg.fire.fire_toggle_debounce_ms = 20;
    cfg.fire.fiber_toggle_debounce_ms = 40;
    cfg.fire.min_hold_ms = 30;
    cfg.outputs.poll_interval_ms = 10;
    cfg.outputs.lights_off_delay_ms = 100;
    cfg.outputs.fan_off_delay_ms = 200;
    cfg.outputs.table_run_timeout_ms = 500;
    cfg.inputs.poll_interval_ms = 5;
    cfg.inputs.debounce_ms = 10;
    cfg.inputs.long_press_ms = 150;
    cfg.inputs.double_press_ms = 60;
    cfg.sequence.poll_interval_ms = 10;
    cfg.axis.poll_interval_ms = 10;
    cfg.axis.hold_ms = 20;
    cfg
}

#[allow(dead_code)]
pub fn rig_with(sim: SimulatedLink, cfg: MachineConfig) -> Rig {
    let sim = Arc::new(sim);
    let sink = Arc::new(CollectingSink::default());
    let machine = Machine::new(sim.clone(), cfg.clone(), sink.clone()).unwrap();
    Rig {
        sim,
        sink,
        machine,
        cfg,
    }
}

/// Instant-move simulator with [`quick_config`].
#[allow(dead_code)]
pub fn rig() -> Rig {
    rig_with(SimulatedLink::with_instant_moves(), quick_config())
}

/// Poll `cond` until it holds or `timeout` passes.
#[allow(dead_code)]
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
