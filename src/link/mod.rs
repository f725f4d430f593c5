//! DeviceLink: the one seam between the orchestration core and hardware.
//!
//! ```text
//!   StepperAxis ─┐
//!   FireControl ─┼──▶ Arc<dyn DeviceLink> ──▶ CoprocessorLink (serial + local GPIO)
//!   OutputBank  ─┤                        └─▶ SimulatedLink
//!   InputMonitor ┘
//! ```
//!
//! The backend is picked once by [`connect`].  Nothing above this module
//! branches on "simulated or not"; the only visible trace is
//! [`DeviceLink::backend`], which status snapshots surface to operators.

pub mod coprocessor;
pub mod protocol;
pub mod sim;

use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{BackendKind, LinkConfig};
use crate::error::{Error, Result};

pub use coprocessor::{CoprocessorLink, PinBank, Transport};
pub use sim::SimulatedLink;

/// Step direction on the axis.  `Positive` increases the position count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[serde(alias = "forward")]
    Positive,
    #[serde(alias = "backward")]
    Negative,
}

impl Direction {
    /// Direction of travel for a signed step delta (`None` for zero).
    pub fn of_delta(delta: i64) -> Option<Self> {
        match delta.signum() {
            1 => Some(Self::Positive),
            -1 => Some(Self::Negative),
            _ => None,
        }
    }

    /// `+1` or `-1`.
    pub fn sign(self) -> i64 {
        match self {
            Self::Positive => 1,
            Self::Negative => -1,
        }
    }

    /// Wire encoding: 1 = positive, 0 = negative.
    pub fn wire(self) -> u8 {
        match self {
            Self::Positive => 1,
            Self::Negative => 0,
        }
    }
}

/// Coprocessor pins for one stepper channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepperPins {
    pub step: u32,
    pub dir: u32,
    pub enable: Option<u32>,
    pub limit_a: u32,
    pub limit_b: u32,
    pub home: u32,
}

/// Position bounds enforced by the coprocessor as a second line of defence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftLimits {
    pub min: i64,
    pub max: i64,
}

/// Per-axis feedback block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Feedback {
    pub limit_a: bool,
    pub limit_b: bool,
    pub home: bool,
    pub moving: bool,
    pub position: i64,
}

/// Which backend is behind a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Hardware,
    Simulated,
}

/// Operations the core requires of the hardware collaborator.
///
/// All methods take `&self`; implementations serialize access to their
/// transport internally so that one request is in flight at a time.
pub trait DeviceLink: Send + Sync {
    fn backend(&self) -> Backend;

    fn init_stepper(&self, axis: u8, pins: &StepperPins, limits: SoftLimits) -> Result<()>;

    /// Command a relative move of `steps` in `direction`.
    ///
    /// With `blocking`, returns once the backend reports the axis idle, or
    /// fails with [`Error::Timeout`] after stopping it.
    fn move_stepper(
        &self,
        axis: u8,
        steps: u32,
        direction: Direction,
        speed: u32,
        blocking: bool,
    ) -> Result<()>;

    fn stop_stepper(&self, axis: u8) -> Result<()>;

    /// Reset the hardware position counter.  `Ok(false)` when unsupported.
    fn zero_position(&self, axis: u8) -> Result<bool> {
        let _ = axis;
        Ok(false)
    }

    fn set_pin(&self, pin: u32, high: bool) -> Result<()>;

    fn read_pin(&self, pin: u32) -> Result<bool>;

    fn set_servo(&self, pin: u32, angle: u16) -> Result<()>;

    fn feedback(&self, axis: u8) -> Result<Feedback>;

    fn is_simulated(&self) -> bool {
        self.backend() == Backend::Simulated
    }
}

/// Build the link described by `config`.
///
/// `open_hardware` constructs and probes the real backend.  When it fails
/// and hardware is not mandatory, the simulator takes over and the failure
/// is logged; with `force_hardware` the failure is returned to the caller,
/// which treats it as fatal at startup.
pub fn connect<F>(config: &LinkConfig, open_hardware: F) -> Result<Arc<dyn DeviceLink>>
where
    F: FnOnce(&LinkConfig) -> Result<Arc<dyn DeviceLink>>,
{
    let mandatory = config.force_hardware || config.backend == BackendKind::Hardware;

    if config.backend == BackendKind::Simulated && !mandatory {
        info!("DeviceLink: simulated backend selected");
        return Ok(Arc::new(SimulatedLink::new()));
    }

    match open_hardware(config) {
        Ok(link) => {
            info!("DeviceLink: hardware backend on {}", config.serial_port);
            Ok(link)
        }
        Err(e) if mandatory => Err(Error::LinkUnavailable(format!(
            "hardware required but unavailable: {e}"
        ))),
        Err(e) => {
            warn!("DeviceLink: hardware unavailable ({e}), falling back to simulation");
            Ok(Arc::new(SimulatedLink::new()))
        }
    }
}
