//! Scripted cleaning runs.
//!
//! A [`Sequence`] is an ordered list of [`Step`]s loaded from JSON:
//!
//! ```json
//! {"name": "clean-pass", "steps": [
//!   {"action": "move_axis", "direction": "in", "steps": 200},
//!   {"action": "fire", "duration_ms": 1500, "delay_after_ms": 250},
//!   {"action": "wait_for_input", "input_id": "button_in", "timeout_ms": 5000}
//! ]}
//! ```
//!
//! Steps are stored as loaded and only interpreted when they run, so a
//! sequence with a typo still loads; the bad step fails the run with
//! [`Error::InvalidStep`] when the engine reaches it.

pub mod engine;
pub mod journal;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::link::Direction;

pub use engine::{SequenceEngine, SequenceStatus};
pub use journal::{Category, Level, LogEntry};

/// Input ids a `wait_for_input` step may name.
pub const INPUT_IDS: [&str; 5] = [
    "button_in",
    "button_out",
    "fire_button",
    "table_front_limit",
    "table_back_limit",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
}

/// One step as written in the sequence file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub action: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Step {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_owned(),
            params: Map::new(),
        }
    }

    /// Builder for tests and programmatic sequences.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_owned(), value.into());
        self
    }

    /// First present key among `keys`.
    fn param<'a>(&'a self, keys: &[&'a str]) -> Option<(&'a str, &'a Value)> {
        keys.iter()
            .find_map(|k| self.params.get(*k).map(|v| (*k, v)))
    }

    fn millis(&self, keys: &[&str]) -> Result<Option<u64>> {
        match self.param(keys) {
            None | Some((_, Value::Null)) => Ok(None),
            Some((key, v)) => as_millis(v)
                .map(Some)
                .ok_or_else(|| self.invalid(&format!("{key} must be a non-negative number"))),
        }
    }

    fn required_millis(&self, keys: &[&str]) -> Result<u64> {
        self.millis(keys)?
            .ok_or_else(|| self.invalid(&format!("missing {}", keys[0])))
    }

    /// Pause after the step, `0` when absent.
    pub fn delay_after_ms(&self) -> Result<u64> {
        Ok(self.millis(&["delay_after_ms", "delay_after"])?.unwrap_or(0))
    }

    fn invalid(&self, why: &str) -> Error {
        Error::InvalidStep(format!("{}: {why}", self.action))
    }

    /// Interpret the step.
    pub fn parse(&self) -> Result<StepAction> {
        let action = match self.action.as_str() {
            "move_axis" | "stepper_move" => {
                let direction = match self.param(&["direction"]) {
                    Some((_, Value::String(s))) => parse_direction(s)
                        .ok_or_else(|| self.invalid(&format!("unknown direction '{s}'")))?,
                    Some(_) => return Err(self.invalid("direction must be a string")),
                    None => return Err(self.invalid("missing direction")),
                };
                let steps = match self.param(&["steps"]) {
                    Some((_, v)) => v
                        .as_u64()
                        .filter(|n| *n > 0)
                        .and_then(|n| u32::try_from(n).ok())
                        .ok_or_else(|| self.invalid("steps must be a positive integer"))?,
                    None => return Err(self.invalid("missing steps")),
                };
                StepAction::MoveAxis { direction, steps }
            }
            "fire" => StepAction::Fire {
                duration_ms: self.millis(&["duration_ms", "duration"])?,
            },
            "fire_fiber" => StepAction::FireFiber,
            "stop_fire" => StepAction::StopFire,
            "wait" => StepAction::Wait {
                duration_ms: self.required_millis(&["duration_ms", "duration"])?,
            },
            "wait_for_input" | "wait_input" => {
                let input_id = match self.param(&["input_id", "input_type"]) {
                    Some((_, Value::String(s))) if INPUT_IDS.contains(&s.as_str()) => s.clone(),
                    Some((_, Value::String(s))) => {
                        return Err(self.invalid(&format!("unknown input '{s}'")));
                    }
                    Some(_) => return Err(self.invalid("input_id must be a string")),
                    None => return Err(self.invalid("missing input_id")),
                };
                // A zero timeout waits indefinitely.
                let timeout_ms = self
                    .millis(&["timeout_ms", "timeout"])?
                    .filter(|t| *t > 0);
                StepAction::WaitForInput {
                    input_id,
                    timeout_ms,
                }
            }
            "fan_on" => StepAction::FanOn,
            "fan_off" => StepAction::FanOff,
            "lights_on" => StepAction::LightsOn,
            "lights_off" => StepAction::LightsOff,
            "table_forward" => StepAction::TableForward {
                duration_ms: self.required_millis(&["duration_ms", "duration"])?,
            },
            "table_backward" => StepAction::TableBackward {
                duration_ms: self.required_millis(&["duration_ms", "duration"])?,
            },
            "table_run_to_front_limit" => StepAction::TableRunToFrontLimit,
            "table_run_to_back_limit" => StepAction::TableRunToBackLimit,
            "go_to_zero" => StepAction::GoToZero,
            "home_axis" => StepAction::HomeAxis,
            "" => return Err(Error::InvalidStep("missing action".into())),
            other => return Err(Error::InvalidStep(format!("unknown action '{other}'"))),
        };
        Ok(action)
    }
}

/// A validated step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    MoveAxis { direction: Direction, steps: u32 },
    /// With a duration: fire, hold, stop.  Without: leave firing on.
    Fire { duration_ms: Option<u64> },
    FireFiber,
    StopFire,
    Wait { duration_ms: u64 },
    WaitForInput {
        input_id: String,
        timeout_ms: Option<u64>,
    },
    FanOn,
    FanOff,
    LightsOn,
    LightsOff,
    TableForward { duration_ms: u64 },
    TableBackward { duration_ms: u64 },
    TableRunToFrontLimit,
    TableRunToBackLimit,
    GoToZero,
    HomeAxis,
}

/// `in`/`forward`/`positive` count up, `out`/`backward`/`negative` count down.
fn parse_direction(s: &str) -> Option<Direction> {
    match s.to_ascii_lowercase().as_str() {
        "in" | "forward" | "positive" => Some(Direction::Positive),
        "out" | "backward" | "negative" => Some(Direction::Negative),
        _ => None,
    }
}

fn as_millis(v: &Value) -> Option<u64> {
    if let Some(n) = v.as_u64() {
        return Some(n);
    }
    v.as_f64()
        .filter(|f| f.is_finite() && *f >= 0.0)
        .map(|f| f.round() as u64)
}

/// Run state of the sequence engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

impl RunStatus {
    /// A worker owns the run.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}
