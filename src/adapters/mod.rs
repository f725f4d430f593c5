//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter        | Implements         | Connects to                  |
//! |----------------|--------------------|------------------------------|
//! | `log_sink`     | EventSink          | `log` facade                 |
//! | `channel_sink` | EventSink          | crossbeam channel, fan-out,  |
//! |                |                    | fire statistics via ConfigPort |
//! | `store`        | ConfigPort         | memory map / JSON file       |
//! | `serial_port`  | Transport          | coprocessor UART             |
//! | `gpio_cdev`    | PinBank            | Linux GPIO character device  |
//!
//! The last two need the `hardware` feature.

pub mod channel_sink;
#[cfg(feature = "hardware")]
pub mod gpio_cdev;
pub mod log_sink;
#[cfg(feature = "hardware")]
pub mod serial_port;
pub mod store;
