// SPDX-License-Identifier: MIT
//! The acquisition, decision and actuation cycle.
use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use num_format::{Locale, ToFormattedString};

use super::actuator::{Actuator, HttpActuator};
use super::classifier::Classifier;
use super::policy::{Command, Debouncer, DecisionPolicy};
use super::window::RollingWindow;
use crate::config::ControlConfig;
use crate::source::{Inlet, StreamProperty, StreamResolver, resolve_first};
use crate::stop::StopToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// Collecting the first window; nothing is classified yet.
    Priming,
    Running,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub actuations: u64,
    pub failed_actuations: u64,
    pub classifier_errors: u64,
    pub empty_pulls: u64,
}

pub struct ControlLoop<I, C, A> {
    inlet: I,
    classifier: C,
    actuator: A,
    window: RollingWindow,
    policy: DecisionPolicy,
    debouncer: Debouncer,
    channels: usize,
    interval: Duration,
    pull_timeout: Duration,
    state: LoopState,
    stats: LoopStats,
}

impl<I: Inlet, C: Classifier, A: Actuator> ControlLoop<I, C, A> {
    /// # Errors
    ///
    /// Returns an error if the configured window is empty or too large to hold.
    pub fn new(inlet: I, classifier: C, actuator: A, config: &ControlConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config
            .window_len()
            .and_then(NonZeroUsize::new)
            .context("window length is zero")?;
        let channels = NonZeroUsize::new(config.channels).context("channel count is zero")?;
        Ok(Self {
            inlet,
            classifier,
            actuator,
            window: RollingWindow::new(capacity, channels)?,
            policy: config.policy(),
            debouncer: Debouncer::default(),
            channels: channels.get(),
            interval: config.cycle_interval,
            pull_timeout: config.pull_timeout,
            state: LoopState::Priming,
            stats: LoopStats::default(),
        })
    }

    #[cfg(test)]
    fn state(&self) -> LoopState {
        self.state
    }

    /// Runs until `stop` is set. The token is only looked at between cycles,
    /// so a started pull-push-classify step always completes.
    pub fn run(&mut self, stop: &StopToken) -> LoopStats {
        log::info!(
            "priming: collecting {} samples x {} channels",
            self.window.capacity(),
            self.channels
        );
        while self.state == LoopState::Priming {
            if stop.is_stopped() {
                log::info!("stopped while priming");
                return self.stats;
            }
            if !self.pull_into_window() {
                thread::sleep(self.interval);
            } else if self.window.is_primed() {
                self.state = LoopState::Running;
                log::info!("window primed, control loop running");
            }
        }

        while !stop.is_stopped() {
            self.cycle();
        }

        log::info!(
            "control loop stopped after {} cycles, {} commands issued ({} failed), last '{}'",
            self.stats.cycles.to_formatted_string(&Locale::en),
            self.stats.actuations.to_formatted_string(&Locale::en),
            self.stats.failed_actuations,
            self.debouncer.last(),
        );
        self.stats
    }

    /// One RUNNING cycle. Returns the command handed to the actuator, if any.
    pub fn cycle(&mut self) -> Option<Command> {
        thread::sleep(self.interval);
        self.stats.cycles += 1;

        if !self.pull_into_window() {
            return None;
        }
        let window = match self.window.snapshot() {
            Ok(window) => window,
            Err(e) => {
                log::warn!("{e}");
                return None;
            }
        };
        let scores = match self.classifier.predict(window.view()) {
            Ok(scores) => scores,
            Err(e) => {
                self.stats.classifier_errors += 1;
                log::warn!("classification failed: {e}");
                return None;
            }
        };

        let command = self.policy.decide(&scores);
        let confidence = scores
            .iter()
            .copied()
            .filter(|s| !s.is_nan())
            .fold(f32::NEG_INFINITY, f32::max);
        log::debug!("prediction: {command} (max confidence {confidence:.3}) scores {scores:?}");

        let issued = self.debouncer.update(command)?;
        self.stats.actuations += 1;
        if !self.actuator.send(issued).is_success() {
            self.stats.failed_actuations += 1;
        }
        Some(issued)
    }

    /// Pulls one sample and pushes its leading channels. Returns false when
    /// nothing was pushed.
    fn pull_into_window(&mut self) -> bool {
        let sample = match self.inlet.pull_sample(self.pull_timeout) {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                self.stats.empty_pulls += 1;
                log::debug!("no sample within {:?}", self.pull_timeout);
                return false;
            }
            Err(e) => {
                log::warn!("pull failed: {e}");
                return false;
            }
        };

        let Some(values) = sample.values.get(..self.channels) else {
            log::warn!(
                "sample has {} channels, need at least {}",
                sample.values.len(),
                self.channels
            );
            return false;
        };
        match self.window.push(values) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{e}");
                false
            }
        }
    }
}

/// Resolves the stream, connects the actuator and runs the loop until `stop`.
///
/// # Errors
///
/// Returns an error if no stream is found, the inlet cannot be opened, or the
/// HTTP client cannot be built. Nothing after startup is fatal.
pub fn run_control<R, C>(
    resolver: &R,
    config: &ControlConfig,
    classifier: C,
    stop: &StopToken,
) -> Result<LoopStats>
where
    R: StreamResolver + ?Sized,
    C: Classifier,
{
    config.validate()?;
    let info = resolve_first(
        resolver,
        StreamProperty::Type,
        &config.stream_type,
        config.discovery_timeout,
    )?;
    log::info!(
        "control source: '{}' ({} channels @ {} Hz)",
        info.name,
        info.channel_count,
        info.nominal_srate
    );
    if info.channel_count < config.channels {
        log::warn!(
            "stream has {} channels but {} are fed to the classifier",
            info.channel_count,
            config.channels
        );
    }
    let inlet = resolver
        .open(&info, 1)
        .with_context(|| format!("failed to open inlet for '{}'", info.name))?;
    let actuator = HttpActuator::new(&config.actuator_url, config.actuator_timeout)?;
    log::info!("actuator at {}", config.actuator_url);
    let policy = config.policy();
    for command in [Command::Left, Command::Right] {
        if let Some(threshold) = policy.threshold(command) {
            log::info!("'{command}' fires at confidence >= {threshold}");
        }
    }

    let mut control = ControlLoop::new(inlet, classifier, actuator, config)?;
    Ok(control.run(stop))
}
