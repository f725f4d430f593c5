//! `embedded-hal` digital pins backed by a [`DeviceLink`].
//!
//! Relays, buttons and table switches are plain digital lines.  Wrapping
//! them as `InputPin` / `OutputPin` keeps the actuator code written against
//! the standard traits, with polarity handled in one place.

use std::sync::Arc;

use embedded_hal::digital::{ErrorKind, ErrorType, InputPin, OutputPin};

use crate::error::Error;
use crate::link::DeviceLink;

/// Link failure surfaced through the `embedded-hal` error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinError(pub Error);

impl embedded_hal::digital::Error for PinError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

impl From<PinError> for Error {
    fn from(e: PinError) -> Self {
        e.0
    }
}

/// One digital line on the link.
#[derive(Clone)]
pub struct LinkPin {
    link: Arc<dyn DeviceLink>,
    pin: u32,
    active_low: bool,
}

impl LinkPin {
    pub fn new(link: Arc<dyn DeviceLink>, pin: u32, active_low: bool) -> Self {
        Self {
            link,
            pin,
            active_low,
        }
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    /// Logical state, polarity applied.
    pub fn is_active(&mut self) -> Result<bool, PinError> {
        let high = self.is_high()?;
        Ok(high != self.active_low)
    }

    /// Drive the logical state, polarity applied.
    pub fn set_active(&mut self, active: bool) -> Result<(), PinError> {
        if active != self.active_low {
            self.set_high()
        } else {
            self.set_low()
        }
    }
}

impl core::fmt::Debug for LinkPin {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LinkPin")
            .field("pin", &self.pin)
            .field("active_low", &self.active_low)
            .finish()
    }
}

impl ErrorType for LinkPin {
    type Error = PinError;
}

impl InputPin for LinkPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        self.link.read_pin(self.pin).map_err(PinError)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.is_high().map(|h| !h)
    }
}

impl OutputPin for LinkPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.link.set_pin(self.pin, false).map_err(PinError)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.link.set_pin(self.pin, true).map_err(PinError)
    }
}
