// SPDX-License-Identifier: MIT
//! Turning class scores into a stable command.
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Left,
    Right,
    /// The neutral command; everything uncertain resolves here.
    Stop,
}

impl Command {
    pub const NEUTRAL: Self = Self::Stop;

    /// Path segment the actuator expects for this command.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            "stop" | "neutral" => Ok(Self::Stop),
            other => Err(format!("unknown command class '{other}'")),
        }
    }
}

/// Maps score index `i` to `classes[i]` and accepts it only when its score is
/// the strict maximum and reaches that class's own threshold. Reaching means
/// `>=`, so a score exactly at the threshold fires rather than falling back
/// to the neutral command.
#[derive(Clone, Debug, PartialEq)]
pub struct DecisionPolicy {
    classes: Vec<Command>,
    thresholds: Vec<f32>,
}

impl Default for DecisionPolicy {
    /// Scores ordered `[left, right, stop]`; right needs more confidence than left.
    fn default() -> Self {
        Self::new(vec![
            (Command::Left, 0.85),
            (Command::Right, 0.95),
            (Command::Stop, 0.0),
        ])
    }
}

impl DecisionPolicy {
    #[must_use]
    pub fn new(classes: Vec<(Command, f32)>) -> Self {
        let (classes, thresholds) = classes.into_iter().unzip();
        Self {
            classes,
            thresholds,
        }
    }

    #[must_use]
    pub fn with_threshold(mut self, command: Command, threshold: f32) -> Self {
        for (class, slot) in self.classes.iter().zip(self.thresholds.iter_mut()) {
            if *class == command {
                *slot = threshold;
            }
        }
        self
    }

    #[must_use]
    pub fn threshold(&self, command: Command) -> Option<f32> {
        self.classes
            .iter()
            .position(|&c| c == command)
            .map(|i| self.thresholds[i])
    }

    /// Scores beyond the configured classes are ignored; NaN scores never win.
    #[must_use]
    pub fn decide(&self, scores: &[f32]) -> Command {
        let mut best: Option<(usize, f32)> = None;
        let mut tied = false;

        for (i, &score) in scores.iter().enumerate().take(self.classes.len()) {
            if score.is_nan() {
                continue;
            }
            match best {
                Some((_, top)) if score < top => {}
                Some((_, top)) if score == top => tied = true,
                _ => {
                    best = Some((i, score));
                    tied = false;
                }
            }
        }

        match best {
            Some((i, score)) if !tied && score >= self.thresholds[i] => self.classes[i],
            _ => Command::NEUTRAL,
        }
    }
}

/// Lets a command through only when it differs from the last one let through.
#[derive(Clone, Copy, Debug)]
pub struct Debouncer {
    last: Command,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self {
            last: Command::NEUTRAL,
        }
    }
}

impl Debouncer {
    pub fn update(&mut self, command: Command) -> Option<Command> {
        if command == self.last {
            return None;
        }
        self.last = command;
        Some(command)
    }

    #[must_use]
    pub fn last(&self) -> Command {
        self.last
    }
}
