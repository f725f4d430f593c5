//! Coprocessor wire codec: one JSON object per line in each direction.
//!
//! ## Requests
//!
//! | `cmd`          | Fields                                               | Reply      |
//! |----------------|------------------------------------------------------|------------|
//! | `init_stepper` | id, step_pin, dir_pin, limit_a, limit_b, home, min_limit, max_limit, enable_pin? | ack |
//! | `move_stepper` | id, steps, dir (1 = positive), speed                 | none       |
//! | `stop_stepper` | id                                                   | ack        |
//! | `zero_stepper` | id                                                   | ack        |
//! | `set_servo`    | pin, angle                                           | ack        |
//! | `set_pin`      | pin, state (0/1)                                     | ack        |
//! | `read_pin`     | pin                                                  | pin state  |
//! | `get_status`   | id                                                   | status     |
//!
//! ## Replies
//!
//! - `{"status":{"stepper_0":{"limit_a":..,"limit_b":..,"home":..,"position":..,"moving":..}},"id":0}`
//! - `{"status":"ok"}` and friends; `"error"` or a `*_failed` status is a rejection
//! - `{"pin":5,"state":1}`
//! - `{"error":"parse_error"}`
//! - unsolicited `{"event":"stepper_done","id":0,"position":120}` and
//!   `{"event":"limit_hit","id":0,"limit":"limit_a","position":-500}`

use serde::Serialize;
use serde_json::Value;

use super::Feedback;
use crate::error::{Error, Result};

/// Host → coprocessor command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    InitStepper {
        id: u8,
        step_pin: u32,
        dir_pin: u32,
        limit_a: u32,
        limit_b: u32,
        home: u32,
        min_limit: i64,
        max_limit: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        enable_pin: Option<u32>,
    },
    MoveStepper {
        id: u8,
        steps: u32,
        dir: u8,
        speed: u32,
    },
    StopStepper {
        id: u8,
    },
    ZeroStepper {
        id: u8,
    },
    SetServo {
        pin: u32,
        angle: u16,
    },
    SetPin {
        pin: u32,
        state: u8,
    },
    ReadPin {
        pin: u32,
    },
    GetStatus {
        id: u8,
    },
}

/// Shape of reply a request waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Nothing,
    Ack,
    Pin(u32),
    Status(u8),
}

impl Request {
    pub fn expect(&self) -> Expect {
        match self {
            Self::MoveStepper { .. } => Expect::Nothing,
            Self::ReadPin { pin } => Expect::Pin(*pin),
            Self::GetStatus { id } => Expect::Status(*id),
            _ => Expect::Ack,
        }
    }

    /// Serialize to one line, newline included.
    pub fn encode(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| Error::InvalidArgument(format!("unencodable request: {e}")))?;
        line.push('\n');
        Ok(line)
    }
}

/// Unsolicited coprocessor notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    StepperDone { id: u8, position: Option<i64> },
    LimitHit { id: u8, limit: String },
    Other(String),
}

/// Coprocessor → host line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status { id: u8, feedback: Feedback },
    Ack { ok: bool, status: String },
    Pin { pin: u32, state: bool },
    Event(DeviceEvent),
    Error(String),
}

impl Reply {
    /// Classify one received line.
    pub fn parse(line: &str) -> Result<Self> {
        let v: Value = serde_json::from_str(line.trim())?;
        let Value::Object(obj) = v else {
            return Err(Error::HardwareRejected(format!("non-object reply: {line}")));
        };

        if let Some(err) = obj.get("error") {
            return Ok(Self::Error(text(err)));
        }

        if let Some(ev) = obj.get("event") {
            let id = obj.get("id").and_then(Value::as_u64).unwrap_or(0) as u8;
            let event = match ev.as_str() {
                Some("stepper_done") => DeviceEvent::StepperDone {
                    id,
                    position: obj.get("position").and_then(Value::as_i64),
                },
                Some("limit_hit") => DeviceEvent::LimitHit {
                    id,
                    limit: obj.get("limit").map(text).unwrap_or_default(),
                },
                _ => DeviceEvent::Other(text(ev)),
            };
            return Ok(Self::Event(event));
        }

        match obj.get("status") {
            Some(Value::Object(block)) => {
                let id = obj.get("id").and_then(Value::as_u64).unwrap_or(0) as u8;
                let key = format!("stepper_{id}");
                let raw = block
                    .get(&key)
                    .ok_or_else(|| Error::HardwareRejected(format!("status without {key}")))?;
                Ok(Self::Status {
                    id,
                    feedback: feedback_from(raw)?,
                })
            }
            Some(status) => {
                let status = text(status);
                let ok = status != "error" && !status.ends_with("_failed");
                Ok(Self::Ack { ok, status })
            }
            None => {
                if let (Some(pin), Some(state)) = (obj.get("pin"), obj.get("state")) {
                    let pin = pin
                        .as_u64()
                        .ok_or_else(|| Error::HardwareRejected("pin is not a number".into()))?;
                    return Ok(Self::Pin {
                        pin: pin as u32,
                        state: truthy(state),
                    });
                }
                Err(Error::HardwareRejected(format!("unrecognised reply: {line}")))
            }
        }
    }

    /// Whether this line answers a request expecting `expect`.
    pub fn answers(&self, expect: Expect) -> bool {
        match (self, expect) {
            (Self::Ack { .. } | Self::Error(_), Expect::Ack) => true,
            (Self::Pin { pin, .. }, Expect::Pin(want)) => *pin == want,
            (Self::Status { id, .. }, Expect::Status(want)) => *id == want,
            (Self::Error(_), _) => true,
            _ => false,
        }
    }
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Firmware sends switch bits as bools or 0/1 depending on build.
fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

fn feedback_from(raw: &Value) -> Result<Feedback> {
    let field = |name: &str| raw.get(name).is_some_and(truthy);
    let position = raw
        .get("position")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::HardwareRejected("status without position".into()))?;
    Ok(Feedback {
        limit_a: field("limit_a"),
        limit_b: field("limit_b"),
        home: field("home"),
        moving: field("moving"),
        position,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_request_encodes_as_one_line() {
        let line = Request::MoveStepper {
            id: 0,
            steps: 100,
            dir: 1,
            speed: 1000,
        }
        .encode()
        .unwrap();
        assert!(line.ends_with('\n'));
        let v: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["cmd"], "move_stepper");
        assert_eq!(v["steps"], 100);
        assert_eq!(v["dir"], 1);
    }

    #[test]
    fn init_omits_missing_enable_pin() {
        let line = Request::InitStepper {
            id: 0,
            step_pin: 25,
            dir_pin: 26,
            limit_a: 18,
            limit_b: 19,
            home: 21,
            min_limit: -500,
            max_limit: 500,
            enable_pin: None,
        }
        .encode()
        .unwrap();
        assert!(!line.contains("enable_pin"));
    }

    #[test]
    fn parses_status_block() {
        let r = Reply::parse(
            r#"{"status":{"stepper_0":{"limit_a":false,"limit_b":1,"home":0,"position":42,"moving":true}},"id":0}"#,
        )
        .unwrap();
        assert_eq!(
            r,
            Reply::Status {
                id: 0,
                feedback: Feedback {
                    limit_a: false,
                    limit_b: true,
                    home: false,
                    moving: true,
                    position: 42,
                },
            }
        );
        assert!(r.answers(Expect::Status(0)));
        assert!(!r.answers(Expect::Status(1)));
    }

    #[test]
    fn failed_status_is_a_negative_ack() {
        let r = Reply::parse(r#"{"status":"servo_attach_failed","servo":{"pin":12}}"#).unwrap();
        assert_eq!(
            r,
            Reply::Ack {
                ok: false,
                status: "servo_attach_failed".into()
            }
        );
    }

    #[test]
    fn events_do_not_answer_requests() {
        let r = Reply::parse(r#"{"event":"stepper_done","id":0,"position":7}"#).unwrap();
        assert_eq!(
            r,
            Reply::Event(DeviceEvent::StepperDone {
                id: 0,
                position: Some(7)
            })
        );
        assert!(!r.answers(Expect::Ack));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            Reply::parse("{not json"),
            Err(Error::HardwareRejected(_))
        ));
        assert!(matches!(Reply::parse("[1,2]"), Err(Error::HardwareRejected(_))));
    }
}
