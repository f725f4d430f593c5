//! Safety supervisor.
//!
//! Tracks which hazardous activities are in progress as a bitmask and refuses
//! to start an activity that conflicts with one already running.  The only
//! conflict today is the pair the machine must never combine: the axis
//! searching for home while the laser trigger is held in its fire position.
//!
//! ## Activity lifecycle
//!
//! 1. An actuator calls [`SafetySupervisor::engage`] before actuating.
//! 2. If a conflicting bit is set, the call returns an [`Interlock`] refusal
//!    and nothing moves.
//! 3. Otherwise the bit is set atomically and stays set until
//!    [`SafetySupervisor::release`] (or the [`ActivityGuard`] drops).
//!
//! FireControl engages `Firing` across calls (fire, then later stop), so it
//! uses the explicit pair.  Homing lives inside one call and uses the guard.

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use log::{error, info};

use crate::error::{Error, Interlock};

/// Activities tracked by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Activity {
    /// Axis homing search in progress.
    Homing = 0b0000_0001,
    /// Trigger servo held at its fire position (any mode).
    Firing = 0b0000_0010,
}

impl Activity {
    /// Return the bitmask for this activity.
    pub const fn mask(self) -> u8 {
        self as u8
    }

    /// Activities that may not overlap with this one.
    const fn conflicts(self) -> u8 {
        match self {
            Self::Homing => Self::Firing.mask(),
            Self::Firing => Self::Homing.mask(),
        }
    }

    /// Interlock reported when this activity is refused.
    const fn refusal(self) -> Interlock {
        match self {
            Self::Homing => Interlock::FiringInProgress,
            Self::Firing => Interlock::HomingInProgress,
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Homing => write!(f, "homing"),
            Self::Firing => write!(f, "firing"),
        }
    }
}

/// Shared supervisor; one instance per machine.
#[derive(Debug, Default)]
pub struct SafetySupervisor {
    active: AtomicU8,
}

impl SafetySupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `activity` as running, unless a conflicting one already is.
    ///
    /// Engaging an activity that is already engaged succeeds.
    pub fn engage(&self, activity: Activity) -> Result<(), Error> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current & activity.conflicts() != 0 {
                error!("SAFETY INTERLOCK: refused {activity} ({})", activity.refusal());
                return Err(Error::LimitViolation(activity.refusal()));
            }
            match self.active.compare_exchange_weak(
                current,
                current | activity.mask(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(seen) => current = seen,
            }
        }
    }

    /// Clear `activity`.  Clearing an idle activity is a no-op.
    pub fn release(&self, activity: Activity) {
        let prev = self.active.fetch_and(!activity.mask(), Ordering::AcqRel);
        if prev & activity.mask() != 0 {
            info!("Safety: {activity} released");
        }
    }

    /// Engage `activity` for the lifetime of the returned guard.
    pub fn guard(&self, activity: Activity) -> Result<ActivityGuard<'_>, Error> {
        self.engage(activity)?;
        Ok(ActivityGuard {
            supervisor: self,
            activity,
        })
    }

    /// Check if a specific activity is engaged.
    pub fn is_engaged(&self, activity: Activity) -> bool {
        self.active.load(Ordering::Acquire) & activity.mask() != 0
    }

    /// Raw activity bitmask.
    pub fn active_mask(&self) -> u8 {
        self.active.load(Ordering::Acquire)
    }
}

/// Releases its activity on drop.
pub struct ActivityGuard<'a> {
    supervisor: &'a SafetySupervisor,
    activity: Activity,
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.supervisor.release(self.activity);
    }
}
