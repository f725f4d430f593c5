//! Port traits: the hexagonal boundary between the orchestration core and
//! its collaborators.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ Machine / actuators (domain)
//! ```
//!
//! The core never touches the configuration store, the log, or the sequence
//! engine's input sources directly.  Adapters implement these traits and are
//! injected at construction.  All ports are `Send + Sync` because actuators,
//! pollers and the sequence worker share them across threads.

use serde_json::Value;

use super::events::MachineEvent;

// ───────────────────────────────────────────────────────────────
// Event sink port (driven adapter: domain → logging / telemetry)
// ───────────────────────────────────────────────────────────────

/// The domain emits structured [`MachineEvent`]s through this port.
/// Adapters decide where they go (log, channel, statistics store).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &MachineEvent);
}

// ───────────────────────────────────────────────────────────────
// Configuration port (driven adapter: domain ↔ key-value store)
// ───────────────────────────────────────────────────────────────

/// Read/write key-value provider for configuration and statistics.
///
/// Keys are dotted `section.field` names (`axis.max_position`,
/// `statistics.laser_fire_count`).  Missing keys return `None` and the
/// caller substitutes its default.
pub trait ConfigPort: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    /// Persist one value.  Implementations write through immediately.
    fn set(&self, key: &str, value: Value) -> Result<(), ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// Input probe (driven adapter: domain → digital input state)
// ───────────────────────────────────────────────────────────────

/// Answers `wait_for_input` sequence steps.
pub trait InputProbe: Send + Sync {
    /// `Some(active)` for a known input id, `None` for an unknown one.
    fn is_active(&self, input_id: &str) -> Option<bool>;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`ConfigPort`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No config found in storage (first run).
    NotFound,
    /// Stored config failed integrity / deserialization check.
    Corrupted,
    /// A config field failed range validation.
    /// The `&'static str` describes which field and why.
    ValidationFailed(&'static str),
    /// Generic I/O error from the storage backend.
    IoError,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "config not found"),
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl std::error::Error for ConfigError {}
