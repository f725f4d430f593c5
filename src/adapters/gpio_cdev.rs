//! Local digital pins through the Linux GPIO character device.
//!
//! Relays are requested as outputs (initially inactive), buttons and end
//! switches as inputs with pull-up.  Levels are physical: active-low
//! handling lives in [`LinkPin`](crate::drivers::pin::LinkPin).

use std::io;

use gpiocdev::Request;
use gpiocdev::line::{Bias, Value};
use log::info;

use crate::link::PinBank;

pub struct GpioBank {
    request: Request,
    outputs: Vec<u32>,
    inputs: Vec<u32>,
}

fn to_io(e: gpiocdev::Error) -> io::Error {
    io::Error::other(e)
}

impl GpioBank {
    pub fn open(chip: &str, outputs: &[u32], inputs: &[u32]) -> io::Result<Self> {
        let request = Request::builder()
            .on_chip(chip)
            .with_consumer("laserroom")
            .with_lines(outputs)
            .as_output(Value::Inactive)
            .with_lines(inputs)
            .as_input()
            .with_bias(Bias::PullUp)
            .request()
            .map_err(to_io)?;
        info!(
            "GPIO {chip}: {} outputs, {} inputs",
            outputs.len(),
            inputs.len()
        );
        Ok(Self {
            request,
            outputs: outputs.to_vec(),
            inputs: inputs.to_vec(),
        })
    }
}

impl PinBank for GpioBank {
    fn owns(&self, pin: u32) -> bool {
        self.outputs.contains(&pin) || self.inputs.contains(&pin)
    }

    fn read(&mut self, pin: u32) -> io::Result<bool> {
        let value = self.request.value(pin).map_err(to_io)?;
        Ok(value == Value::Active)
    }

    fn write(&mut self, pin: u32, high: bool) -> io::Result<()> {
        if !self.outputs.contains(&pin) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("pin {pin} is not an output"),
            ));
        }
        let value = if high { Value::Active } else { Value::Inactive };
        self.request.set_value(pin, value).map_err(to_io)
    }
}
