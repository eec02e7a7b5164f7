// SPDX-License-Identifier: MIT
//! Runtime settings for the control loop and the recorder.
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use chrono::{DateTime, Utc};
use clap::ValueEnum;

use crate::control::policy::{Command, DecisionPolicy};
use crate::control::window::MAX_WINDOW_VALUES;
use crate::recording::markers::MarkerMode;

pub const DEFAULT_STREAM_TYPE: &str = "EEG";
pub const DEFAULT_MARKER_STREAM: &str = "ArduinoMarkers";
pub const DEFAULT_SAMPLE_RATE_HZ: f64 = 256.0;
pub const DEFAULT_WINDOW_SECS: f64 = 1.0;
/// Leading channels fed to the classifier; the Muse's trailing AUX channel is left out.
pub const DEFAULT_CLASSIFIER_CHANNELS: usize = 4;
pub const DEFAULT_CYCLE_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_ACTUATOR_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on a single-sample pull; a live stream answers well within it.
pub const CONTROL_PULL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CHUNK_PULL_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_MARKER_PULL_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

/// Kind of stream the recorder captures; each has its own pull chunk length.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    #[default]
    Eeg,
    Ppg,
    Acc,
    Gyro,
}

impl SourceKind {
    #[must_use]
    pub fn stream_type(self) -> &'static str {
        match self {
            Self::Eeg => "EEG",
            Self::Ppg => "PPG",
            Self::Acc => "ACC",
            Self::Gyro => "GYRO",
        }
    }

    #[must_use]
    pub fn chunk_len(self) -> usize {
        match self {
            Self::Eeg => 12,
            Self::Ppg => 6,
            Self::Acc | Self::Gyro => 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ControlConfig {
    pub stream_type: String,
    pub sample_rate_hz: f64,
    pub window_secs: f64,
    pub channels: usize,
    pub cycle_interval: Duration,
    pub pull_timeout: Duration,
    pub discovery_timeout: Duration,
    pub actuator_url: String,
    pub actuator_timeout: Duration,
    /// Per-class overrides applied on top of the default thresholds.
    pub thresholds: Vec<(Command, f32)>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            stream_type: DEFAULT_STREAM_TYPE.to_owned(),
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            window_secs: DEFAULT_WINDOW_SECS,
            channels: DEFAULT_CLASSIFIER_CHANNELS,
            cycle_interval: DEFAULT_CYCLE_INTERVAL,
            pull_timeout: CONTROL_PULL_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            actuator_url: String::new(),
            actuator_timeout: DEFAULT_ACTUATOR_TIMEOUT,
            thresholds: Vec::new(),
        }
    }
}

impl ControlConfig {
    /// Number of samples in one classification window, or `None` when the
    /// rate and duration describe a window no ring could hold.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn window_len(&self) -> Option<usize> {
        let len = (self.sample_rate_hz * self.window_secs).round();
        if !len.is_finite() || len > MAX_WINDOW_VALUES as f64 {
            return None;
        }
        Some((len as usize).max(1))
    }

    /// Rejects settings the control loop cannot run with, before any stream
    /// is touched.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.channels > 0, "channel count is zero");
        let Some(len) = self.window_len() else {
            bail!(
                "a {} s window at {} Hz is too large",
                self.window_secs,
                self.sample_rate_hz
            );
        };
        ensure!(
            len.checked_mul(self.channels)
                .is_some_and(|n| n <= MAX_WINDOW_VALUES),
            "window of {len} samples x {} channels exceeds {MAX_WINDOW_VALUES} values",
            self.channels
        );
        Ok(())
    }

    #[must_use]
    pub fn policy(&self) -> DecisionPolicy {
        self.thresholds
            .iter()
            .fold(DecisionPolicy::default(), |policy, &(command, threshold)| {
                policy.with_threshold(command, threshold)
            })
    }
}

#[derive(Clone, Debug)]
pub struct RecorderConfig {
    pub source: SourceKind,
    pub output: PathBuf,
    /// `None` records until stopped.
    pub duration: Option<Duration>,
    pub checkpoint_interval: Duration,
    /// When false, everything is written in one flush at stop.
    pub continuous: bool,
    pub dejitter: bool,
    /// Name of the marker stream to look for, if any.
    pub marker_stream: Option<String>,
    pub marker_mode: MarkerMode,
    pub discovery_timeout: Duration,
    pub chunk_pull_timeout: Duration,
    pub marker_pull_timeout: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        let source = SourceKind::default();
        Self {
            source,
            output: default_recording_path(source, Utc::now()),
            duration: None,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            continuous: true,
            dejitter: false,
            marker_stream: Some(DEFAULT_MARKER_STREAM.to_owned()),
            marker_mode: MarkerMode::CarryForward,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            chunk_pull_timeout: DEFAULT_CHUNK_PULL_TIMEOUT,
            marker_pull_timeout: DEFAULT_MARKER_PULL_TIMEOUT,
        }
    }
}

/// `<KIND>_recording_<YYYY-mm-dd-HH.MM.SS>.csv` in the working directory, UTC.
#[must_use]
pub fn default_recording_path(source: SourceKind, now: DateTime<Utc>) -> PathBuf {
    PathBuf::from(format!(
        "{}_recording_{}.csv",
        source.stream_type(),
        now.format("%Y-%m-%d-%H.%M.%S")
    ))
}

/// Parses `CLASS=VALUE`, e.g. `left=0.85`.
///
/// # Errors
///
/// Returns a message naming the malformed part.
pub fn parse_threshold(arg: &str) -> Result<(Command, f32), String> {
    let (class, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected CLASS=VALUE, got '{arg}'"))?;
    let command: Command = class.trim().parse()?;
    let threshold: f32 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid threshold '{value}': {e}"))?;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(format!("threshold {threshold} is outside 0..=1"));
    }
    Ok((command, threshold))
}
