//! Imaging macros: scripted goniometer moves, waits and imaging commands.
//!
//! A macro is text with one step per line:
//!
//! ```text
//! # sweep the horizontal axis
//! (0, 0)
//! image
//! wait 2.5
//! (-10, 0)
//! image
//! ```
//!
//! `(h, v)` or `h, v` moves the goniometer, `wait <seconds>` pauses, and every other line is a
//! custom tag handed back to the caller (the rig understands `image` and `snap`). Blank lines
//! and `#` comments are skipped.

use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::MacroError;

#[derive(Clone, Debug, PartialEq)]
pub enum MacroStep {
    MoveTo(f64, f64),
    Wait(Duration),
    Custom(String),
}

impl FromStr for MacroStep {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if let Some(seconds) = text.strip_prefix("wait ") {
            let seconds: f64 = seconds
                .trim()
                .parse()
                .map_err(|_| format!("`{}` is not a number of seconds", seconds.trim()))?;
            return Duration::try_from_secs_f64(seconds)
                .map(MacroStep::Wait)
                .map_err(|_| format!("wait time {} is not a non-negative duration", seconds));
        }

        let parenthesized = text.starts_with('(');
        let inner = text.trim_start_matches('(').trim_end_matches(')');
        let pair = inner.split_once(',').and_then(|(h, v)| {
            Some((h.trim().parse::<f64>().ok()?, v.trim().parse::<f64>().ok()?))
        });
        match pair {
            Some((h, v)) => Ok(MacroStep::MoveTo(h, v)),
            None if parenthesized => Err("expected a `(horizontal, vertical)` pair".to_string()),
            None => Ok(MacroStep::Custom(text.to_string())),
        }
    }
}

/// Parses a macro, one step per non-blank, non-comment line.
pub fn parse_macro(text: &str) -> Result<Vec<MacroStep>, MacroError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| {
            line.parse().map_err(|reason| MacroError::InvalidStep {
                line: i + 1,
                text: line.trim().to_string(),
                reason,
            })
        })
        .collect()
}

/// What the caller has to do after a [`MacroRunner::step`].
#[derive(Clone, Debug, PartialEq)]
pub enum MacroEvent {
    /// Nothing this time: waiting for a deadline or for the axes to settle.
    Idle,
    /// Move the goniometer axes to `(h, v)`.
    MoveTo(f64, f64),
    Custom(String),
    /// The last step has been consumed.
    Finished,
}

#[derive(Clone, Debug)]
pub struct MacroRunner {
    steps: Vec<MacroStep>,
    index: usize,
    deadline: Option<Instant>,
}

impl MacroRunner {
    pub fn new(steps: Vec<MacroStep>) -> Self {
        Self {
            steps,
            index: 0,
            deadline: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self, MacroError> {
        Ok(Self::new(parse_macro(text)?))
    }

    /// Index of the step waiting to run.
    pub fn position(&self) -> usize {
        self.index
    }

    pub fn is_finished(&self) -> bool {
        self.index >= self.steps.len()
    }

    /// Advances the macro by at most one step.
    ///
    /// No step runs while the axes are still moving (`axes_ready == false`), so waits and custom
    /// steps always start from the position the previous move reached. A wait completes once
    /// `now` passes the deadline set when the wait was first reached.
    pub fn step(&mut self, now: Instant, axes_ready: bool) -> MacroEvent {
        let Some(step) = self.steps.get(self.index) else {
            return MacroEvent::Finished;
        };
        if !axes_ready {
            return MacroEvent::Idle;
        }
        match step {
            MacroStep::MoveTo(h, v) => {
                let event = MacroEvent::MoveTo(*h, *v);
                self.index += 1;
                event
            }
            MacroStep::Wait(duration) => {
                // Past the range of the clock: never completes
                let Some(deadline) = self.deadline.or_else(|| now.checked_add(*duration)) else {
                    return MacroEvent::Idle;
                };
                self.deadline = Some(deadline);
                if now >= deadline {
                    self.deadline = None;
                    self.index += 1;
                }
                MacroEvent::Idle
            }
            MacroStep::Custom(tag) => {
                let event = MacroEvent::Custom(tag.clone());
                self.index += 1;
                event
            }
        }
    }
}
