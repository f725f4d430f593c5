//! Application core: the machine context and its message types.
//!
//! Actuators never call outward directly.  Requests arrive as
//! [`commands::AppCommand`]s, results leave as [`events::MachineEvent`]s
//! through the [`ports::EventSink`] port, and [`machine::Machine`] ties the
//! two together.

pub mod commands;
pub mod events;
pub mod machine;
pub mod ports;

pub use machine::{Machine, MachineStatus, Reply};
