//! Debounced push button with press, release, long and double press.
//!
//! ## Sampling
//!
//! The input monitor reads each button line every poll interval and feeds
//! the logical level to [`ButtonDriver::sample`].  A level change is only
//! accepted after it has been stable for the debounce window.
//!
//! ## Gesture detection
//!
//! | Gesture      | Condition                                    | Event                |
//! |--------------|----------------------------------------------|----------------------|
//! | Press        | Debounced low → high                         | `Pressed`            |
//! | Release      | Debounced high → low                         | `Released{held_ms}`  |
//! | Long press   | Held >= `long_press_ms` (once per press)     | `LongPress`          |
//! | Double press | Press starts within `double_press_ms` of the previous one | `DoublePress` |

use heapless::Vec;

use crate::config::InputConfig;

/// Button events emitted after gesture classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    Pressed,
    Released { held_ms: u64 },
    LongPress,
    DoublePress,
}

/// Events from one sample.  A press can also complete a double press.
pub type Events = Vec<ButtonEvent, 2>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonTiming {
    pub debounce_ms: u64,
    pub long_press_ms: u64,
    pub double_press_ms: u64,
}

impl From<&InputConfig> for ButtonTiming {
    fn from(c: &InputConfig) -> Self {
        Self {
            debounce_ms: c.debounce_ms,
            long_press_ms: c.long_press_ms,
            double_press_ms: c.double_press_ms,
        }
    }
}

/// Internal state machine for gesture detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GestureState {
    Released,
    Held { since_ms: u64, long_sent: bool },
}

pub struct ButtonDriver {
    timing: ButtonTiming,
    state: GestureState,
    /// Raw level that differs from the debounced one, and since when.
    pending: Option<(bool, u64)>,
    last_press_ms: Option<u64>,
}

impl ButtonDriver {
    pub fn new(timing: ButtonTiming) -> Self {
        Self {
            timing,
            state: GestureState::Released,
            pending: None,
            last_press_ms: None,
        }
    }

    pub fn is_pressed(&self) -> bool {
        matches!(self.state, GestureState::Held { .. })
    }

    /// Feed one logical sample (`true` = pressed) taken at `now_ms`.
    pub fn sample(&mut self, pressed: bool, now_ms: u64) -> Events {
        let mut events = Events::new();

        if pressed == self.is_pressed() {
            self.pending = None;
        } else {
            match self.pending {
                Some((level, since)) if level == pressed => {
                    if now_ms.saturating_sub(since) >= self.timing.debounce_ms {
                        self.pending = None;
                        self.accept(pressed, now_ms, &mut events);
                    }
                }
                _ => self.pending = Some((pressed, now_ms)),
            }
        }

        if let GestureState::Held { since_ms, long_sent } = &mut self.state {
            if !*long_sent && now_ms.saturating_sub(*since_ms) >= self.timing.long_press_ms {
                *long_sent = true;
                let _ = events.push(ButtonEvent::LongPress);
            }
        }

        events
    }

    fn accept(&mut self, pressed: bool, now_ms: u64, events: &mut Events) {
        if pressed {
            self.state = GestureState::Held {
                since_ms: now_ms,
                long_sent: false,
            };
            let _ = events.push(ButtonEvent::Pressed);
            let double = self
                .last_press_ms
                .is_some_and(|t| now_ms.saturating_sub(t) <= self.timing.double_press_ms);
            if double {
                let _ = events.push(ButtonEvent::DoublePress);
                self.last_press_ms = None;
            } else {
                self.last_press_ms = Some(now_ms);
            }
        } else if let GestureState::Held { since_ms, .. } = self.state {
            self.state = GestureState::Released;
            let _ = events.push(ButtonEvent::Released {
                held_ms: now_ms.saturating_sub(since_ms),
            });
        }
    }
}
