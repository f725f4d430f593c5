//! Actuator and input drivers built on the shared device link.

pub mod button;
pub mod fire;
pub mod inputs;
pub mod outputs;
pub mod pin;
pub mod stepper;
pub mod worker;
