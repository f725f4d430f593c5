//! Unified error types for the LaserRoom orchestration core.
//!
//! Every actuator, the device link, and the sequence engine report failures
//! through the single [`Error`] enum so callers (console, button monitor,
//! sequence worker) can match on one taxonomy.  Refusals such as a move toward
//! a triggered limit switch are ordinary values here, not panics.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the core funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The coprocessor or GPIO device could not be reached.
    LinkUnavailable(String),
    /// A command was delivered but the backend reported failure, or the
    /// reply could not be understood.
    HardwareRejected(String),
    /// Motion or actuation refused by a limit switch or interlock.
    LimitViolation(Interlock),
    /// A bounded wait ran out of budget.
    Timeout(String),
    /// Unknown or malformed sequence step.
    InvalidStep(String),
    /// The component is not in a state that accepts this operation.
    NotReady(&'static str),
    /// Caller supplied an out-of-range or otherwise unusable argument.
    InvalidArgument(String),
    /// A wait was interrupted by a stop request.
    Cancelled,
}

impl Error {
    /// Whether this is a normal refusal rather than a fault.
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::LimitViolation(_) | Self::NotReady(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkUnavailable(why) => write!(f, "link unavailable: {why}"),
            Self::HardwareRejected(why) => write!(f, "hardware rejected command: {why}"),
            Self::LimitViolation(lock) => write!(f, "refused by interlock: {lock}"),
            Self::Timeout(what) => write!(f, "timed out: {what}"),
            Self::InvalidStep(why) => write!(f, "invalid step: {why}"),
            Self::NotReady(why) => write!(f, "not ready: {why}"),
            Self::InvalidArgument(why) => write!(f, "invalid argument: {why}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::Timeout(format!("link I/O: {e}"))
            }
            _ => Self::LinkUnavailable(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::HardwareRejected(format!("malformed reply: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Interlocks
// ---------------------------------------------------------------------------

/// Which hardware-state rule refused an actuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Interlock {
    /// Minimum-end axis switch is triggered.
    LimitA,
    /// Maximum-end axis switch is triggered.
    LimitB,
    /// Table is at its front end switch.
    TableFrontLimit,
    /// Table is at its back end switch.
    TableBackLimit,
    /// Axis is homing; firing must wait.
    HomingInProgress,
    /// Laser is firing; homing must wait.
    FiringInProgress,
}

impl fmt::Display for Interlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LimitA => write!(f, "limit A triggered"),
            Self::LimitB => write!(f, "limit B triggered"),
            Self::TableFrontLimit => write!(f, "table at front limit"),
            Self::TableBackLimit => write!(f, "table at back limit"),
            Self::HomingInProgress => write!(f, "homing in progress"),
            Self::FiringInProgress => write!(f, "firing in progress"),
        }
    }
}

impl From<Interlock> for Error {
    fn from(lock: Interlock) -> Self {
        Self::LimitViolation(lock)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
