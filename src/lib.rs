//! LaserRoom orchestration core.
//!
//! Drives the laser-cleaning station: a linear stepper axis, the trigger
//! servo that gates the laser, relay outputs (fan, warning lights,
//! motorised table) and a scripting engine that sequences them.  All
//! hardware access goes through one [`link::DeviceLink`], backed either by
//! the serial coprocessor or by a simulator.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod drivers;
pub mod error;
pub mod link;
pub mod safety;
pub mod sequence;
pub mod sync;
