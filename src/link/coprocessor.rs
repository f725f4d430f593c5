//! Real backend: serial coprocessor plus an optional local GPIO pin bank.
//!
//! The serial transport is the scarce resource.  Every request takes the
//! transport mutex, writes one line, and reads lines until its reply turns
//! up; unsolicited event lines read along the way are recorded, never lost.
//! A blocking move does not hold the transport while the axis travels: it
//! polls `get_status` so other actuators can interleave their requests.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::protocol::{DeviceEvent, Expect, Reply, Request};
use super::{Backend, DeviceLink, Direction, Feedback, SoftLimits, StepperPins};
use crate::error::{Error, Result};
use crate::sync::lock;

const MOVE_POLL: Duration = Duration::from_millis(50);

/// Line-oriented byte stream to the coprocessor.
pub trait Transport: Send {
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Next complete line, or `None` if nothing arrived within `timeout`.
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>>;
}

/// Host-side digital pins (relays, buttons, end switches).
pub trait PinBank: Send {
    fn owns(&self, pin: u32) -> bool;
    fn read(&mut self, pin: u32) -> io::Result<bool>;
    fn write(&mut self, pin: u32, high: bool) -> io::Result<()>;
}

/// Serial JSON-lines coprocessor link.
pub struct CoprocessorLink {
    port: Mutex<Box<dyn Transport>>,
    pins: Option<Mutex<Box<dyn PinBank>>>,
    /// `stepper_done` positions seen since the last move on each axis.
    done: Mutex<HashMap<u8, Option<i64>>>,
    reply_timeout: Duration,
    move_timeout: Duration,
}

impl CoprocessorLink {
    pub fn new(transport: Box<dyn Transport>, reply_timeout: Duration, move_timeout: Duration) -> Self {
        Self {
            port: Mutex::new(transport),
            pins: None,
            done: Mutex::new(HashMap::new()),
            reply_timeout,
            move_timeout,
        }
    }

    /// Route pins owned by `bank` to local GPIO instead of the coprocessor.
    #[must_use]
    pub fn with_pin_bank(mut self, bank: Box<dyn PinBank>) -> Self {
        self.pins = Some(Mutex::new(bank));
        self
    }

    /// Verify the coprocessor answers at all.
    pub fn probe(&self, axis: u8) -> Result<()> {
        self.feedback(axis).map(|_| ())
    }

    fn transact(&self, request: &Request) -> Result<Option<Reply>> {
        let line = request.encode()?;
        let expect = request.expect();
        let mut port = lock(&self.port);
        port.write_line(&line)
            .map_err(|e| Error::LinkUnavailable(format!("serial write: {e}")))?;
        debug!("coproc <- {}", line.trim_end());

        if expect == Expect::Nothing {
            return Ok(None);
        }

        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!("no reply to {request:?}")));
            }
            let Some(raw) = port.read_line(remaining)? else {
                continue;
            };
            debug!("coproc -> {}", raw.trim_end());
            let reply = match Reply::parse(&raw) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Ignoring unreadable coprocessor line: {e}");
                    continue;
                }
            };
            if let Reply::Event(ev) = &reply {
                self.record_event(ev);
                continue;
            }
            if reply.answers(expect) {
                return match reply {
                    Reply::Error(why) => Err(Error::HardwareRejected(why)),
                    Reply::Ack { ok: false, status } => Err(Error::HardwareRejected(status)),
                    other => Ok(Some(other)),
                };
            }
            debug!("Skipping unrelated reply while waiting for {expect:?}");
        }
    }

    fn record_event(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::StepperDone { id, position } => {
                lock(&self.done).insert(*id, *position);
            }
            DeviceEvent::LimitHit { id, limit } => {
                warn!("Coprocessor reports {limit} hit on stepper {id}");
            }
            DeviceEvent::Other(name) => debug!("Coprocessor event: {name}"),
        }
    }

    fn ack(&self, request: &Request) -> Result<()> {
        self.transact(request).map(|_| ())
    }

    fn wait_idle(&self, axis: u8, budget: Duration) -> Result<()> {
        let deadline = Instant::now() + budget;
        loop {
            if lock(&self.done).remove(&axis).is_some() {
                return Ok(());
            }
            if !self.feedback(axis)?.moving {
                return Ok(());
            }
            if Instant::now() >= deadline {
                if let Err(e) = self.stop_stepper(axis) {
                    warn!("Stop after move timeout failed: {e}");
                }
                return Err(Error::Timeout(format!(
                    "stepper {axis} still moving after {} ms",
                    budget.as_millis()
                )));
            }
            std::thread::sleep(MOVE_POLL);
        }
    }
}

impl DeviceLink for CoprocessorLink {
    fn backend(&self) -> Backend {
        Backend::Hardware
    }

    fn init_stepper(&self, axis: u8, pins: &StepperPins, limits: SoftLimits) -> Result<()> {
        self.ack(&Request::InitStepper {
            id: axis,
            step_pin: pins.step,
            dir_pin: pins.dir,
            limit_a: pins.limit_a,
            limit_b: pins.limit_b,
            home: pins.home,
            min_limit: limits.min,
            max_limit: limits.max,
            enable_pin: pins.enable,
        })
    }

    fn move_stepper(
        &self,
        axis: u8,
        steps: u32,
        direction: Direction,
        speed: u32,
        blocking: bool,
    ) -> Result<()> {
        lock(&self.done).remove(&axis);
        self.transact(&Request::MoveStepper {
            id: axis,
            steps,
            dir: direction.wire(),
            speed,
        })?;
        if blocking {
            self.wait_idle(axis, self.move_timeout)?;
        }
        Ok(())
    }

    fn stop_stepper(&self, axis: u8) -> Result<()> {
        self.ack(&Request::StopStepper { id: axis })
    }

    fn zero_position(&self, axis: u8) -> Result<bool> {
        self.ack(&Request::ZeroStepper { id: axis })?;
        Ok(true)
    }

    fn set_pin(&self, pin: u32, high: bool) -> Result<()> {
        if let Some(bank) = &self.pins {
            let mut bank = lock(bank);
            if bank.owns(pin) {
                return bank
                    .write(pin, high)
                    .map_err(|e| Error::HardwareRejected(format!("gpio {pin} write: {e}")));
            }
        }
        self.ack(&Request::SetPin {
            pin,
            state: u8::from(high),
        })
    }

    fn read_pin(&self, pin: u32) -> Result<bool> {
        if let Some(bank) = &self.pins {
            let mut bank = lock(bank);
            if bank.owns(pin) {
                return bank
                    .read(pin)
                    .map_err(|e| Error::HardwareRejected(format!("gpio {pin} read: {e}")));
            }
        }
        match self.transact(&Request::ReadPin { pin })? {
            Some(Reply::Pin { state, .. }) => Ok(state),
            other => Err(Error::HardwareRejected(format!("unexpected reply {other:?}"))),
        }
    }

    fn set_servo(&self, pin: u32, angle: u16) -> Result<()> {
        self.ack(&Request::SetServo { pin, angle })
    }

    fn feedback(&self, axis: u8) -> Result<Feedback> {
        match self.transact(&Request::GetStatus { id: axis })? {
            Some(Reply::Status { feedback, .. }) => Ok(feedback),
            other => Err(Error::HardwareRejected(format!("unexpected reply {other:?}"))),
        }
    }
}
