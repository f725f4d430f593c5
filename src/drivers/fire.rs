//! Trigger servo and laser firing.
//!
//! The servo has two calibrated angles.  Callers only ever speak of A
//! (rest) and B (fire); `inverted` swaps which configured angle plays which
//! role, and every actuation resolves the effective angle first.
//!
//! ## Firing modes
//!
//! | Operation              | Mode       | Ends with                      |
//! |------------------------|------------|--------------------------------|
//! | `fire()`               | `manual`   | `stop_firing()`                |
//! | `fire_toggle()`        | `toggle`   | second `fire_toggle()`         |
//! | `start_sequence()`     | `sequence` | `stop_sequence()`              |
//! | `fiber_fire_*()`       | `fiber`    | release / second toggle        |
//!
//! Plain firing and the A-B-A-B pattern never run together: starting one
//! ends the other first.  Every finished firing produces a [`FireRecord`];
//! only durations at or above `fire_threshold_ms` count toward the fire
//! count and total fire time.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use heapless::HistoryBuffer;
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::app::events::MachineEvent;
use crate::app::ports::EventSink;
use crate::config::FireConfig;
use crate::drivers::worker::{self, Worker};
use crate::error::{Error, Result};
use crate::link::DeviceLink;
use crate::safety::{Activity, SafetySupervisor};
use crate::sync::{CancelToken, lock};

const PATTERN_SLICE: Duration = Duration::from_millis(20);
const HISTORY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FireMode {
    Manual,
    Toggle,
    Sequence,
    Fiber,
}

/// One completed firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FireRecord {
    pub duration_ms: u64,
    /// Reached the threshold and was added to the statistics.
    pub counted: bool,
    pub mode: FireMode,
}

/// Result of a toggle request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Toggle {
    Started,
    Stopped(FireRecord),
    /// Debounced, or released before the minimum hold.
    Ignored,
}

/// Firing statistics with a short history.
#[derive(Debug, Clone, Default)]
pub struct FireStats {
    pub fire_count: u64,
    pub total_fire_time_ms: u64,
    pub last_duration_ms: u64,
    history: HistoryBuffer<FireRecord, HISTORY>,
}

impl FireStats {
    /// Account one firing.  Below `threshold_ms` only `last_duration_ms`
    /// and the history change.
    pub fn record(&mut self, duration_ms: u64, threshold_ms: u64, mode: FireMode) -> FireRecord {
        let counted = duration_ms >= threshold_ms;
        self.last_duration_ms = duration_ms;
        if counted {
            self.fire_count += 1;
            self.total_fire_time_ms += duration_ms;
        }
        let record = FireRecord {
            duration_ms,
            counted,
            mode,
        };
        self.history.write(record);
        record
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<FireRecord> {
        self.history.oldest_ordered().copied().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FireStatsView {
    pub fire_count: u64,
    pub total_fire_time_ms: u64,
    pub last_duration_ms: u64,
    pub recent: Vec<FireRecord>,
}

impl From<&FireStats> for FireStatsView {
    fn from(s: &FireStats) -> Self {
        Self {
            fire_count: s.fire_count,
            total_fire_time_ms: s.total_fire_time_ms,
            last_duration_ms: s.last_duration_ms,
            recent: s.history(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FireStatus {
    pub position_a: u16,
    pub position_b: u16,
    pub inverted: bool,
    pub current_angle: Option<u16>,
    pub is_firing: bool,
    pub sequence_mode: bool,
    pub fire_toggle_active: bool,
    pub fiber_toggle_active: bool,
    pub mode: Option<FireMode>,
    pub fire_duration_ms: u64,
    pub stats: FireStatsView,
    pub simulated: bool,
}

#[derive(Debug)]
struct FireState {
    position_a: u16,
    position_b: u16,
    inverted: bool,
    current_angle: Option<u16>,
    is_firing: bool,
    fire_started: Option<Instant>,
    mode: Option<FireMode>,
    fire_toggle_active: bool,
    fiber_toggle_active: bool,
    sequence_mode: bool,
    last_fire_toggle: Option<Instant>,
    last_fiber_toggle: Option<Instant>,
    pattern: Option<CancelToken>,
    /// Hold time carried over from a suspended firing.
    suspended_ms: Option<u64>,
    stats: FireStats,
}

impl FireState {
    fn normal_angle(&self) -> u16 {
        if self.inverted { self.position_b } else { self.position_a }
    }

    fn fire_angle(&self) -> u16 {
        if self.inverted { self.position_a } else { self.position_b }
    }

    fn held_ms(&self, now: Instant) -> u64 {
        self.fire_started
            .map_or(0, |t| now.saturating_duration_since(t).as_millis() as u64)
    }
}

pub struct FireControl {
    link: Arc<dyn DeviceLink>,
    cfg: FireConfig,
    safety: Arc<SafetySupervisor>,
    sink: Arc<dyn EventSink>,
    state: Mutex<FireState>,
    op: Mutex<()>,
    worker: Mutex<Option<Worker>>,
}

impl FireControl {
    pub fn new(
        link: Arc<dyn DeviceLink>,
        cfg: FireConfig,
        safety: Arc<SafetySupervisor>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let state = FireState {
            position_a: cfg.position_a,
            position_b: cfg.position_b,
            inverted: cfg.inverted,
            current_angle: None,
            is_firing: false,
            fire_started: None,
            mode: None,
            fire_toggle_active: false,
            fiber_toggle_active: false,
            sequence_mode: false,
            last_fire_toggle: None,
            last_fiber_toggle: None,
            pattern: None,
            suspended_ms: None,
            stats: FireStats::default(),
        };
        Self {
            link,
            cfg,
            safety,
            sink,
            state: Mutex::new(state),
            op: Mutex::new(()),
            worker: Mutex::new(None),
        }
    }

    /// Continue counting from persisted totals.
    pub fn seed_stats(&self, fire_count: u64, total_fire_time_ms: u64) {
        let mut st = lock(&self.state);
        st.stats.fire_count = fire_count;
        st.stats.total_fire_time_ms = total_fire_time_ms;
    }

    // -----------------------------------------------------------------------
    // Calibration
    // -----------------------------------------------------------------------

    /// Returns the angle actually stored after clamping.
    pub fn set_position_a(&self, angle: u16) -> u16 {
        let angle = self.clamp_angle(angle);
        lock(&self.state).position_a = angle;
        info!("Position A set to {angle} degrees");
        angle
    }

    pub fn set_position_b(&self, angle: u16) -> u16 {
        let angle = self.clamp_angle(angle);
        lock(&self.state).position_b = angle;
        info!("Position B set to {angle} degrees");
        angle
    }

    pub fn set_inverted(&self, inverted: bool) {
        lock(&self.state).inverted = inverted;
        info!("Servo inverted: {inverted}");
    }

    pub fn move_to_a(&self) -> Result<()> {
        let _op = lock(&self.op);
        let angle = self.idle_angle(FireState::normal_angle)?;
        self.actuate(angle)?;
        info!("Moved to position A ({angle} degrees)");
        Ok(())
    }

    pub fn move_to_b(&self) -> Result<()> {
        let _op = lock(&self.op);
        let angle = self.idle_angle(FireState::fire_angle)?;
        self.actuate(angle)?;
        info!("Moved to position B ({angle} degrees)");
        Ok(())
    }

    fn idle_angle(&self, pick: impl FnOnce(&FireState) -> u16) -> Result<u16> {
        let st = lock(&self.state);
        if st.is_firing {
            return Err(Error::NotReady("firing in progress"));
        }
        Ok(pick(&st))
    }

    // -----------------------------------------------------------------------
    // Plain firing
    // -----------------------------------------------------------------------

    /// Move to B and hold.  Ends a running fiber pattern first.
    pub fn fire(&self) -> Result<()> {
        let _op = lock(&self.op);
        self.settle_suspended();
        self.begin_manual(FireMode::Manual)
    }

    /// Park the servo at A without closing the firing record.
    ///
    /// The held time is carried into the record written when the firing
    /// finally stops, so a paused firing counts as one.  Fiber patterns are
    /// not suspendable.
    pub fn suspend_firing(&self) -> Result<()> {
        let _op = lock(&self.op);
        {
            let st = lock(&self.state);
            if !st.is_firing || st.sequence_mode {
                return Ok(());
            }
        }
        let angle = lock(&self.state).normal_angle();
        self.actuate(angle)?;
        let carried = {
            let mut st = lock(&self.state);
            let carried = st.suspended_ms.unwrap_or(0) + st.held_ms(Instant::now());
            st.suspended_ms = Some(carried);
            st.is_firing = false;
            st.fire_started = None;
            carried
        };
        self.safety.release(Activity::Firing);
        info!("Firing suspended after {carried} ms");
        Ok(())
    }

    /// Continue a suspended firing, or start a plain one.
    pub fn resume_firing(&self) -> Result<()> {
        let _op = lock(&self.op);
        let mode = {
            let st = lock(&self.state);
            if st.suspended_ms.is_some() { st.mode.unwrap_or(FireMode::Manual) } else { FireMode::Manual }
        };
        self.begin_manual(mode)
    }

    /// Close the record of a firing left suspended.
    fn settle_suspended(&self) {
        if lock(&self.state).suspended_ms.is_some() {
            self.finish_firing();
        }
    }

    fn begin_manual(&self, mode: FireMode) -> Result<()> {
        if lock(&self.state).sequence_mode {
            info!("Stopping fiber sequence before direct fire");
            self.end_sequence()?;
        }
        if lock(&self.state).is_firing {
            debug!("Already firing");
            return Ok(());
        }

        self.safety.engage(Activity::Firing)?;
        let angle = lock(&self.state).fire_angle();
        if let Err(e) = self.actuate(angle) {
            self.safety.release(Activity::Firing);
            return Err(e);
        }
        {
            let mut st = lock(&self.state);
            st.is_firing = true;
            st.fire_started = Some(Instant::now());
            st.mode = Some(mode);
        }
        info!("Laser fired");
        self.sink.emit(&MachineEvent::FiringStarted { mode });
        Ok(())
    }

    /// Return to A and account the firing.  Also ends a fiber pattern.
    pub fn stop_firing(&self) -> Result<Option<FireRecord>> {
        let _op = lock(&self.op);
        if lock(&self.state).sequence_mode {
            return self.end_sequence();
        }
        self.end_manual()
    }

    fn end_manual(&self) -> Result<Option<FireRecord>> {
        if !lock(&self.state).is_firing {
            if lock(&self.state).suspended_ms.is_some() {
                return Ok(Some(self.finish_firing()));
            }
            return Ok(None);
        }
        let angle = lock(&self.state).normal_angle();
        let moved = self.actuate(angle);
        let record = self.finish_firing();
        moved?;
        Ok(Some(record))
    }

    /// Latch: first call fires, second call stops.
    pub fn fire_toggle(&self) -> Result<Toggle> {
        let _op = lock(&self.op);
        let now = Instant::now();
        {
            let mut st = lock(&self.state);
            if debounced(st.last_fire_toggle, now, self.cfg.fire_toggle_debounce_ms) {
                debug!("Fire toggle debounced");
                return Ok(Toggle::Ignored);
            }
            if st.fire_toggle_active && st.held_ms(now) < self.cfg.min_hold_ms {
                debug!("Fire toggle-off ignored, held {} ms", st.held_ms(now));
                return Ok(Toggle::Ignored);
            }
            st.last_fire_toggle = Some(now);
        }

        if lock(&self.state).fire_toggle_active {
            let record = self.end_manual()?;
            lock(&self.state).fire_toggle_active = false;
            info!("Fire toggle OFF");
            return Ok(record.map_or(Toggle::Ignored, Toggle::Stopped));
        }

        self.settle_suspended();
        self.begin_manual(FireMode::Toggle)?;
        lock(&self.state).fire_toggle_active = true;
        info!("Fire toggle ON");
        Ok(Toggle::Started)
    }

    // -----------------------------------------------------------------------
    // Fiber pattern
    // -----------------------------------------------------------------------

    /// Run A, B, A, B then hold B until stopped.  Ends plain firing first.
    ///
    /// Returns `false` if a pattern is already running.
    pub fn start_sequence(self: &Arc<Self>) -> Result<bool> {
        let _op = lock(&self.op);
        self.begin_sequence(FireMode::Sequence)
    }

    fn begin_sequence(self: &Arc<Self>, mode: FireMode) -> Result<bool> {
        if lock(&self.state).sequence_mode {
            warn!("Sequence already running");
            return Ok(false);
        }
        self.settle_suspended();
        if lock(&self.state).is_firing {
            info!("Ending direct fire before fiber sequence");
            self.end_manual()?;
            lock(&self.state).fire_toggle_active = false;
        }

        self.safety.engage(Activity::Firing)?;
        let token = CancelToken::new();
        {
            let mut st = lock(&self.state);
            st.sequence_mode = true;
            st.is_firing = true;
            st.fire_started = Some(Instant::now());
            st.mode = Some(mode);
            st.pattern = Some(token.clone());
        }

        let fc = Arc::clone(self);
        let spawned = worker::spawn("fire-pattern", move || fc.run_pattern(&token));
        match spawned {
            Ok(w) => {
                *lock(&self.worker) = Some(w);
                info!("Laser sequence started");
                self.sink.emit(&MachineEvent::FiringStarted { mode });
                Ok(true)
            }
            Err(e) => {
                {
                    let mut st = lock(&self.state);
                    st.sequence_mode = false;
                    st.is_firing = false;
                    st.fire_started = None;
                    st.mode = None;
                    st.pattern = None;
                }
                self.safety.release(Activity::Firing);
                Err(e)
            }
        }
    }

    fn run_pattern(&self, token: &CancelToken) {
        let delay = Duration::from_millis(self.cfg.sequence_delay_ms);
        let (a, b) = {
            let st = lock(&self.state);
            (st.normal_angle(), st.fire_angle())
        };
        for (i, angle) in [a, b, a, b].into_iter().enumerate() {
            if i > 0 && !token.sleep(delay, PATTERN_SLICE) {
                debug!("Fiber pattern cancelled at step {i}");
                return;
            }
            if token.is_cancelled() {
                return;
            }
            if let Err(e) = self.actuate(angle) {
                error!("Fiber pattern step {i} failed: {e}");
                return;
            }
        }
        debug!("Fiber pattern holding at B");
    }

    /// Cancel the pattern, return to A and account the firing.
    pub fn stop_sequence(&self) -> Result<Option<FireRecord>> {
        let _op = lock(&self.op);
        self.end_sequence()
    }

    fn end_sequence(&self) -> Result<Option<FireRecord>> {
        if !lock(&self.state).sequence_mode {
            return Ok(None);
        }
        self.cancel_pattern();
        let angle = lock(&self.state).normal_angle();
        let moved = self.actuate(angle);
        let record = self.finish_firing();
        info!("Laser sequence stopped");
        moved?;
        Ok(Some(record))
    }

    /// Press-and-hold fiber firing; release with `stop_firing()`.
    pub fn fiber_fire_momentary(self: &Arc<Self>) -> Result<bool> {
        let _op = lock(&self.op);
        self.begin_sequence(FireMode::Fiber)
    }

    /// Latching fiber firing with the longer debounce.
    pub fn fiber_fire_toggle(self: &Arc<Self>) -> Result<Toggle> {
        let _op = lock(&self.op);
        let now = Instant::now();
        {
            let mut st = lock(&self.state);
            if debounced(st.last_fiber_toggle, now, self.cfg.fiber_toggle_debounce_ms) {
                debug!("Fiber toggle debounced");
                return Ok(Toggle::Ignored);
            }
            if st.fiber_toggle_active && st.held_ms(now) < self.cfg.min_hold_ms {
                return Ok(Toggle::Ignored);
            }
            st.last_fiber_toggle = Some(now);
        }

        if lock(&self.state).fiber_toggle_active {
            let record = self.end_sequence()?;
            lock(&self.state).fiber_toggle_active = false;
            info!("Fiber toggle OFF");
            return Ok(record.map_or(Toggle::Ignored, Toggle::Stopped));
        }

        if !self.begin_sequence(FireMode::Fiber)? {
            return Ok(Toggle::Ignored);
        }
        lock(&self.state).fiber_toggle_active = true;
        info!("Fiber toggle ON");
        Ok(Toggle::Started)
    }

    // -----------------------------------------------------------------------
    // Emergency
    // -----------------------------------------------------------------------

    /// Cancel everything, command A, clear every latch.
    pub fn stop_all_firing(&self) -> Result<()> {
        let _op = lock(&self.op);
        self.cancel_pattern();
        let angle = lock(&self.state).normal_angle();
        let moved = self.actuate(angle);
        let open = {
            let st = lock(&self.state);
            st.is_firing || st.suspended_ms.is_some()
        };
        if open {
            self.finish_firing();
        }
        {
            let mut st = lock(&self.state);
            st.fire_toggle_active = false;
            st.fiber_toggle_active = false;
            st.sequence_mode = false;
            st.is_firing = false;
            st.fire_started = None;
            st.mode = None;
        }
        self.safety.release(Activity::Firing);
        match &moved {
            Ok(()) => info!("All firing stopped, servo at A ({angle} degrees)"),
            Err(e) => error!("All firing stopped but servo did not reach A: {e}"),
        }
        moved
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn is_firing(&self) -> bool {
        lock(&self.state).is_firing
    }

    pub fn sequence_mode(&self) -> bool {
        lock(&self.state).sequence_mode
    }

    /// `(current, normal)` angles for the auto-off logic.
    pub fn angles(&self) -> (u16, u16) {
        let st = lock(&self.state);
        let normal = st.normal_angle();
        (st.current_angle.unwrap_or(normal), normal)
    }

    pub fn stats(&self) -> FireStats {
        lock(&self.state).stats.clone()
    }

    pub fn status(&self) -> FireStatus {
        let st = lock(&self.state);
        FireStatus {
            position_a: st.position_a,
            position_b: st.position_b,
            inverted: st.inverted,
            current_angle: st.current_angle,
            is_firing: st.is_firing,
            sequence_mode: st.sequence_mode,
            fire_toggle_active: st.fire_toggle_active,
            fiber_toggle_active: st.fiber_toggle_active,
            mode: st.mode,
            fire_duration_ms: if st.is_firing { st.held_ms(Instant::now()) } else { 0 },
            stats: FireStatsView::from(&st.stats),
            simulated: self.link.is_simulated(),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn actuate(&self, angle: u16) -> Result<()> {
        self.link.set_servo(self.cfg.servo_pin, angle)?;
        lock(&self.state).current_angle = Some(angle);
        Ok(())
    }

    fn cancel_pattern(&self) {
        if let Some(token) = lock(&self.state).pattern.take() {
            token.cancel();
        }
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            worker.join_within(Duration::from_millis(self.cfg.stop_join_timeout_ms));
        }
    }

    /// Clear firing state and latches, record the duration, release the
    /// interlock.
    fn finish_firing(&self) -> FireRecord {
        let record = {
            let mut st = lock(&self.state);
            let duration = st.held_ms(Instant::now()) + st.suspended_ms.take().unwrap_or(0);
            let mode = st.mode.unwrap_or(FireMode::Manual);
            st.is_firing = false;
            st.fire_toggle_active = false;
            st.fiber_toggle_active = false;
            st.sequence_mode = false;
            st.fire_started = None;
            st.mode = None;
            st.pattern = None;
            st.stats.record(duration, self.cfg.fire_threshold_ms, mode)
        };
        self.safety.release(Activity::Firing);
        if record.counted {
            info!("Laser fired for {}ms, counter incremented", record.duration_ms);
        } else {
            info!("Laser fired for {}ms (below threshold)", record.duration_ms);
        }
        self.sink.emit(&MachineEvent::FireRecorded { record });
        record
    }

    fn clamp_angle(&self, angle: u16) -> u16 {
        let clamped = angle.clamp(self.cfg.min_angle, self.cfg.max_angle);
        if clamped != angle {
            info!("Angle {angle} clamped to {clamped}");
        }
        clamped
    }
}

fn debounced(last: Option<Instant>, now: Instant, window_ms: u64) -> bool {
    last.is_some_and(|t| now.saturating_duration_since(t) < Duration::from_millis(window_ms))
}
