//! Button mode state machines
//!
//! Each button mapping owns one [`ButtonStateMachine`]. It receives the
//! combined (OR-ed) press state once per tick and yields the output state.
//!
//! | Mode        | States            | Trigger                   | Effect                    |
//! |-------------|-------------------|---------------------------|---------------------------|
//! | Normal      | -                 | input changes             | output = input            |
//! | Toggle      | Off, On           | rising edge               | flip state                |
//! | Hold        | Released, Holding | held >= threshold         | output = true while held  |
//! | DoublePress | Idle, Waiting     | two rising edges in window| one-tick pulse, then Idle |

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub const DEFAULT_HOLD_THRESHOLD_MS: u64 = 500;
pub const DEFAULT_DOUBLE_PRESS_WINDOW_MS: u64 = 300;

fn default_hold_threshold() -> u64 {
    DEFAULT_HOLD_THRESHOLD_MS
}

fn default_double_press_window() -> u64 {
    DEFAULT_DOUBLE_PRESS_WINDOW_MS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ButtonMode {
    #[default]
    Normal,
    Toggle,
    Hold {
        #[serde(default = "default_hold_threshold")]
        threshold_ms: u64,
    },
    DoublePress {
        #[serde(default = "default_double_press_window")]
        window_ms: u64,
    },
}

impl ButtonMode {
    pub fn hold() -> Self {
        ButtonMode::Hold {
            threshold_ms: DEFAULT_HOLD_THRESHOLD_MS,
        }
    }

    pub fn double_press() -> Self {
        ButtonMode::DoublePress {
            window_ms: DEFAULT_DOUBLE_PRESS_WINDOW_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeState {
    Normal,
    Toggle { on: bool },
    Hold { threshold: Duration, since: Option<Instant> },
    DoublePress { window: Duration, waiting_since: Option<Instant> },
}

#[derive(Debug, Clone)]
pub struct ButtonStateMachine {
    state: ModeState,
    initial: ModeState,
    last_input: bool,
}

impl ButtonStateMachine {
    pub fn new(mode: &ButtonMode) -> Self {
        let state = match *mode {
            ButtonMode::Normal => ModeState::Normal,
            ButtonMode::Toggle => ModeState::Toggle { on: false },
            ButtonMode::Hold { threshold_ms } => ModeState::Hold {
                threshold: Duration::from_millis(threshold_ms),
                since: None,
            },
            ButtonMode::DoublePress { window_ms } => ModeState::DoublePress {
                window: Duration::from_millis(window_ms),
                waiting_since: None,
            },
        };
        Self {
            state,
            initial: state,
            last_input: false,
        }
    }

    /// Feeds one tick of input and returns the output for that tick.
    pub fn update(&mut self, pressed: bool, now: Instant) -> bool {
        let rising = pressed && !self.last_input;
        self.last_input = pressed;

        match &mut self.state {
            ModeState::Normal => pressed,
            ModeState::Toggle { on } => {
                if rising {
                    *on = !*on;
                }
                *on
            }
            ModeState::Hold { threshold, since } => {
                if !pressed {
                    *since = None;
                    return false;
                }
                let started = *since.get_or_insert(now);
                now.saturating_duration_since(started) >= *threshold
            }
            ModeState::DoublePress {
                window,
                waiting_since,
            } => {
                if let Some(first) = *waiting_since {
                    if now.saturating_duration_since(first) > *window {
                        *waiting_since = None;
                    }
                }
                if !rising {
                    return false;
                }
                match waiting_since.take() {
                    Some(_) => true,
                    None => {
                        *waiting_since = Some(now);
                        false
                    }
                }
            }
        }
    }

    /// Returns to the initial state, as if freshly created.
    pub fn reset(&mut self) {
        self.state = self.initial;
        self.last_input = false;
    }
}
