//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises a subsystem through
//! the public [`laserroom::app::Machine`] surface.  Everything runs on the
//! simulated device link; no hardware is required.

mod axis_tests;
mod console_tests;
mod fire_tests;
mod mock_hw;
mod output_tests;
mod sequence_tests;
