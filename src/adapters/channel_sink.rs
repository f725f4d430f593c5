//! Event sinks that forward, fan out, or persist events.
//!
//! | Sink          | Effect                                              |
//! |---------------|-----------------------------------------------------|
//! | `ChannelSink` | Clones each event onto a crossbeam channel          |
//! | `FanoutSink`  | Emits to every inner sink in order                  |
//! | `StatsSink`   | Adds counted firings to the persisted statistics    |

use std::sync::{Arc, Mutex};

use crossbeam_channel::{Sender, TrySendError};
use log::{debug, error, warn};
use serde_json::Value;

use crate::app::events::MachineEvent;
use crate::app::ports::{ConfigPort, EventSink};
use crate::sync::lock;

pub const FIRE_COUNT_KEY: &str = "statistics.laser_fire_count";
pub const FIRE_TIME_KEY: &str = "statistics.total_laser_fire_time";

// ───────────────────────────────────────────────────────────────
// ChannelSink
// ───────────────────────────────────────────────────────────────

/// Forwards events to a UI or test harness.  Never blocks the emitter: a
/// full bounded channel drops the event.
pub struct ChannelSink {
    tx: Sender<MachineEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<MachineEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &MachineEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Event channel full, dropping {event:?}"),
            Err(TrySendError::Disconnected(_)) => debug!("Event receiver gone"),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// FanoutSink
// ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &MachineEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

// ───────────────────────────────────────────────────────────────
// StatsSink
// ───────────────────────────────────────────────────────────────

/// Persists firing totals: each counted [`FireRecord`] adds one to
/// `statistics.laser_fire_count` and its duration (seconds) to
/// `statistics.total_laser_fire_time`.
///
/// [`FireRecord`]: crate::drivers::fire::FireRecord
pub struct StatsSink {
    store: Arc<dyn ConfigPort>,
    /// Serialises read-modify-write of the two keys.
    guard: Mutex<()>,
}

/// Persisted totals as `(count, total_ms)`.
pub fn load_totals(store: &dyn ConfigPort) -> (u64, u64) {
    let count = store.get(FIRE_COUNT_KEY).and_then(|v| v.as_u64()).unwrap_or(0);
    let secs = store.get(FIRE_TIME_KEY).and_then(|v| v.as_f64()).unwrap_or(0.0);
    (count, (secs.max(0.0) * 1000.0).round() as u64)
}

impl StatsSink {
    pub fn new(store: Arc<dyn ConfigPort>) -> Self {
        Self {
            store,
            guard: Mutex::new(()),
        }
    }
}

impl EventSink for StatsSink {
    fn emit(&self, event: &MachineEvent) {
        let MachineEvent::FireRecorded { record } = event else {
            return;
        };
        if !record.counted {
            return;
        }
        let _guard = lock(&self.guard);
        let (count, total_ms) = load_totals(self.store.as_ref());
        let count = count + 1;
        let total_secs = (total_ms + record.duration_ms) as f64 / 1000.0;

        let saved = self
            .store
            .set(FIRE_COUNT_KEY, Value::from(count))
            .and_then(|()| self.store.set(FIRE_TIME_KEY, Value::from(total_secs)));
        match saved {
            Ok(()) => debug!("Fire statistics: {count} firings, {total_secs:.1} s"),
            Err(e) => error!("Saving fire statistics failed: {e}"),
        }
    }
}
