// SPDX-License-Identifier: MIT
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod config;
mod control;
mod recording;
mod source;
mod stop;

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use num_format::{Locale, ToFormattedString};

use crate::config::{
    ControlConfig, DEFAULT_ACTUATOR_TIMEOUT, DEFAULT_CHECKPOINT_INTERVAL,
    DEFAULT_CLASSIFIER_CHANNELS, DEFAULT_CYCLE_INTERVAL, DEFAULT_DISCOVERY_TIMEOUT,
    DEFAULT_MARKER_STREAM, DEFAULT_SAMPLE_RATE_HZ, DEFAULT_STREAM_TYPE, DEFAULT_WINDOW_SECS,
    RecorderConfig, SourceKind, default_recording_path, parse_threshold,
};
use crate::control::classifier::Classifier;
use crate::control::policy::Command;
use crate::control::runner::{LoopStats, run_control};
use crate::recording::markers::MarkerMode;
use crate::recording::reader::RecordingReader;
use crate::recording::session::{RecordingSession, SessionReport};
use crate::source::simulated::SimulatedResolver;
use crate::source::{LiveResolver, StreamResolver};
use crate::stop::StopToken;

#[derive(Parser)]
#[command(
    name = "neurolink",
    about = "neurolink: biosignal control loop and stream recorder"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a live stream and drive the actuator
    Control {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        control: ControlArgs,
    },
    /// Record a stream (and markers) to CSV without the control loop
    Record {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        record: RecordArgs,
    },
    /// Record in the background while running the control loop
    Session {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        control: ControlArgs,
        #[command(flatten)]
        record: RecordArgs,
    },
    /// List visible streams
    Streams {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Summarise a recording
    Inspect {
        path: PathBuf,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
        /// Also print the first N rows
        #[arg(long, default_value_t = 0)]
        head: usize,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Use synthetic streams instead of the network
    #[arg(long)]
    simulate: bool,
    #[arg(
        long,
        default_value_t = DEFAULT_DISCOVERY_TIMEOUT.as_secs_f64(),
        value_parser = parse_positive
    )]
    discovery_timeout_secs: f64,
}

#[derive(Args)]
struct ControlArgs {
    /// Base URL of the actuator, e.g. http://192.168.4.1
    #[arg(long)]
    actuator_url: String,
    #[arg(long, default_value = DEFAULT_STREAM_TYPE)]
    stream_type: String,
    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE_HZ, value_parser = parse_positive)]
    sample_rate: f64,
    #[arg(long, default_value_t = DEFAULT_WINDOW_SECS, value_parser = parse_positive)]
    window_secs: f64,
    /// Leading channels fed to the classifier
    #[arg(long, default_value_t = DEFAULT_CLASSIFIER_CHANNELS, value_parser = parse_nonzero)]
    channels: usize,
    #[arg(long, default_value_t = duration_millis(DEFAULT_CYCLE_INTERVAL))]
    interval_ms: u64,
    /// Per-class threshold, e.g. --threshold left=0.85 (repeatable)
    #[arg(long = "threshold", value_name = "CLASS=VALUE", value_parser = parse_threshold)]
    thresholds: Vec<(Command, f32)>,
    #[arg(
        long,
        default_value_t = duration_millis(DEFAULT_ACTUATOR_TIMEOUT),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    actuator_timeout_ms: u64,
    /// ONNX classifier model
    #[arg(long)]
    model: Option<PathBuf>,
}

#[derive(Args)]
struct RecordArgs {
    /// Output CSV [default: <KIND>_recording_<time>.csv]
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = SourceKind::Eeg)]
    source: SourceKind,
    /// Seconds to record; 0 records until interrupted
    #[arg(long, default_value = "0")]
    duration: u64,
    #[arg(
        long,
        default_value_t = DEFAULT_CHECKPOINT_INTERVAL.as_secs_f64(),
        value_parser = parse_positive
    )]
    checkpoint_secs: f64,
    /// Write only once, when recording stops
    #[arg(long)]
    no_continuous: bool,
    /// Name of the marker stream
    #[arg(long, default_value = DEFAULT_MARKER_STREAM)]
    markers: String,
    #[arg(long, conflicts_with = "markers")]
    no_markers: bool,
    #[arg(long, value_enum, default_value_t = MarkerMode::CarryForward)]
    marker_mode: MarkerMode,
    /// Regularise timestamps with a linear fit before writing
    #[arg(long)]
    dejitter: bool,
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn parse_positive(arg: &str) -> Result<f64, String> {
    match arg.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => Ok(v),
        Ok(v) => Err(format!("{v} must be a positive number")),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_nonzero(arg: &str) -> Result<usize, String> {
    match arg.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_owned()),
        Ok(v) => Ok(v),
        Err(e) => Err(e.to_string()),
    }
}

impl ControlArgs {
    fn to_config(&self, source: &SourceArgs) -> ControlConfig {
        ControlConfig {
            stream_type: self.stream_type.clone(),
            sample_rate_hz: self.sample_rate,
            window_secs: self.window_secs,
            channels: self.channels,
            cycle_interval: Duration::from_millis(self.interval_ms),
            discovery_timeout: Duration::from_secs_f64(source.discovery_timeout_secs),
            actuator_url: self.actuator_url.clone(),
            actuator_timeout: Duration::from_millis(self.actuator_timeout_ms),
            thresholds: self.thresholds.clone(),
            ..ControlConfig::default()
        }
    }
}

impl RecordArgs {
    fn to_config(&self, source: &SourceArgs) -> RecorderConfig {
        RecorderConfig {
            source: self.source,
            output: self
                .output
                .clone()
                .unwrap_or_else(|| default_recording_path(self.source, chrono::Utc::now())),
            duration: (self.duration > 0).then(|| Duration::from_secs(self.duration)),
            checkpoint_interval: Duration::from_secs_f64(self.checkpoint_secs),
            continuous: !self.no_continuous,
            dejitter: self.dejitter,
            marker_stream: (!self.no_markers).then(|| self.markers.clone()),
            marker_mode: self.marker_mode,
            discovery_timeout: Duration::from_secs_f64(source.discovery_timeout_secs),
            ..RecorderConfig::default()
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Control { source, control } => cmd_control(&source, &control),
        Commands::Record { source, record } => cmd_record(&source, &record),
        Commands::Session {
            source,
            control,
            record,
        } => cmd_session(&source, &control, &record),
        Commands::Streams { source } => cmd_streams(&source),
        Commands::Inspect { path, json, head } => cmd_inspect(&path, json, head),
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

#[cfg(feature = "onnx")]
fn build_classifier(model: Option<&Path>) -> Result<Box<dyn Classifier>> {
    let path = model.context("--model is required to run the control loop")?;
    Ok(Box::new(control::classifier::OnnxClassifier::load(path)?))
}

#[cfg(not(feature = "onnx"))]
fn build_classifier(_model: Option<&Path>) -> Result<Box<dyn Classifier>> {
    bail!("built without the `onnx` feature; rebuild with --features onnx to load a model")
}

// ---------------------------------------------------------------------------
// Control subcommand
// ---------------------------------------------------------------------------

fn cmd_control(source: &SourceArgs, args: &ControlArgs) -> Result<()> {
    let stop = StopToken::new();
    stop.install_signal_handler()?;
    let config = args.to_config(source);
    config.validate()?;
    let classifier = build_classifier(args.model.as_deref())?;

    if source.simulate {
        control_with(&SimulatedResolver::default(), &config, classifier, &stop)
    } else {
        control_with(&LiveResolver::default(), &config, classifier, &stop)
    }
}

fn control_with<R: StreamResolver>(
    resolver: &R,
    config: &ControlConfig,
    classifier: Box<dyn Classifier>,
    stop: &StopToken,
) -> Result<()> {
    let stats = run_control(resolver, config, classifier, stop)?;
    report_control(&stats);
    Ok(())
}

fn report_control(stats: &LoopStats) {
    eprintln!(
        "Finished: {} cycles, {} commands sent, {} failed, {} classifier errors",
        stats.cycles.to_formatted_string(&Locale::en),
        stats.actuations.to_formatted_string(&Locale::en),
        stats.failed_actuations,
        stats.classifier_errors,
    );
}

// ---------------------------------------------------------------------------
// Record (headless) subcommand
// ---------------------------------------------------------------------------

fn cmd_record(source: &SourceArgs, args: &RecordArgs) -> Result<()> {
    let stop = StopToken::new();
    stop.install_signal_handler()?;
    let config = args.to_config(source);

    if source.simulate {
        record_with(&SimulatedResolver::default(), config, &stop)
    } else {
        record_with(&LiveResolver::default(), config, &stop)
    }
}

fn record_with<R: StreamResolver>(
    resolver: &R,
    config: RecorderConfig,
    stop: &StopToken,
) -> Result<()> {
    let report = RecordingSession::new(resolver, config, stop.clone()).run()?;
    report_recording(&report);
    Ok(())
}

fn report_recording(report: &SessionReport) {
    eprintln!(
        "Finished: {} rows ({} checkpoints, {} markers) written to {}",
        report.rows.to_formatted_string(&Locale::en),
        report.intermediate_flushes,
        report.markers_received,
        report.path.display()
    );
    if report.markers_pulled_in > 0 {
        eprintln!(
            "Note: {} markers were applied on arrival; the marker clock ran ahead",
            report.markers_pulled_in
        );
    }
}

// ---------------------------------------------------------------------------
// Session subcommand
// ---------------------------------------------------------------------------

fn cmd_session(source: &SourceArgs, control: &ControlArgs, record: &RecordArgs) -> Result<()> {
    let stop = StopToken::new();
    stop.install_signal_handler()?;
    let control_config = control.to_config(source);
    let record_config = record.to_config(source);
    let classifier = || build_classifier(control.model.as_deref());

    let outcome = if source.simulate {
        run_session(
            SimulatedResolver::default,
            classifier,
            &control_config,
            record_config,
            &stop,
        )?
    } else {
        run_session(
            LiveResolver::default,
            classifier,
            &control_config,
            record_config,
            &stop,
        )?
    };

    if let Ok(stats) = &outcome.control {
        report_control(stats);
    }
    match &outcome.recording {
        Ok(report) => report_recording(report),
        Err(e) => log::error!("recorder failed: {e:#}"),
    }
    Ok(())
}

/// What each half of a session ended with.
struct SessionOutcome {
    control: Result<LoopStats>,
    recording: Result<SessionReport>,
}

/// Runs the recorder on its own thread and the control loop on this one.
/// Each half opens its own connections through `resolver`; a failure on
/// either side is logged and leaves the other running until `stop` is set.
///
/// # Errors
///
/// Returns an error only if the recorder thread cannot be spawned.
fn run_session<R, F, C>(
    resolver: F,
    classifier: impl FnOnce() -> Result<C>,
    control_config: &ControlConfig,
    record_config: RecorderConfig,
    stop: &StopToken,
) -> Result<SessionOutcome>
where
    R: StreamResolver,
    F: Fn() -> R + Clone + Send + 'static,
    C: Classifier,
{
    let recorder = {
        let stop = stop.clone();
        let resolver = resolver.clone();
        thread::Builder::new()
            .name("recorder".to_owned())
            .spawn(move || RecordingSession::new(&resolver(), record_config, stop).run())
            .context("failed to spawn recorder thread")?
    };

    let control = classifier()
        .and_then(|classifier| run_control(&resolver(), control_config, classifier, stop));
    if let Err(e) = &control {
        log::error!("control loop failed: {e:#}");
        log::info!("recording continues until interrupted");
    }

    let recording = recorder
        .join()
        .unwrap_or_else(|_| Err(anyhow!("recorder thread panicked")));
    Ok(SessionOutcome { control, recording })
}

// ---------------------------------------------------------------------------
// Streams subcommand
// ---------------------------------------------------------------------------

fn cmd_streams(source: &SourceArgs) -> Result<()> {
    let timeout = Duration::from_secs_f64(source.discovery_timeout_secs);
    if source.simulate {
        list_streams(&SimulatedResolver::default(), timeout)
    } else {
        list_streams(&LiveResolver::default(), timeout)
    }
}

fn list_streams<R: StreamResolver>(resolver: &R, timeout: Duration) -> Result<()> {
    let streams = resolver
        .resolve_all(timeout)
        .context("stream discovery failed")?;
    if streams.is_empty() {
        bail!("no streams found within {timeout:?}");
    }
    println!(
        "{:<24} {:<10} {:>8} {:>10}  SOURCE ID",
        "NAME", "TYPE", "CHANNELS", "RATE (Hz)"
    );
    for s in &streams {
        println!(
            "{:<24} {:<10} {:>8} {:>10}  {}",
            s.name, s.stream_type, s.channel_count, s.nominal_srate, s.source_id
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Inspect subcommand
// ---------------------------------------------------------------------------

fn cmd_inspect(path: &Path, json: bool, head: usize) -> Result<()> {
    let reader = RecordingReader::open(path)?;
    let summary = reader.summary();

    if json {
        let text =
            serde_json::to_string_pretty(&summary).context("failed to serialize summary")?;
        println!("{text}");
        return Ok(());
    }

    println!("{}", path.display());
    println!("  rows:      {}", summary.rows.to_formatted_string(&Locale::en));
    println!("  channels:  {}", summary.channels.join(", "));
    println!(
        "  markers:   {} columns, {} transitions",
        summary.marker_width, summary.marker_transitions
    );
    if let (Some(first), Some(last)) = (summary.first_timestamp, summary.last_timestamp) {
        println!("  span:      {first:.3} .. {last:.3} ({:.1} s)", summary.span_secs);
    }
    if head > 0 {
        println!();
        println!("{}", reader.layout().header().join("\t"));
        for row in reader.rows().iter().take(head) {
            let mut fields = vec![format!("{:.6}", row.timestamp)];
            fields.extend(row.values.iter().map(|v| format!("{v:.3}")));
            fields.extend(row.markers.iter().map(i32::to_string));
            println!("{}", fields.join("\t"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn record_args_map_to_config() {
        let cli = Cli::try_parse_from([
            "neurolink",
            "record",
            "--source",
            "ppg",
            "--duration",
            "30",
            "--no-markers",
            "--marker-mode",
            "instant",
            "--no-continuous",
        ])
        .unwrap();
        let Commands::Record { source, record } = cli.command else {
            panic!("expected record");
        };
        let config = record.to_config(&source);
        assert_eq!(config.source, SourceKind::Ppg);
        assert_eq!(config.duration, Some(Duration::from_secs(30)));
        assert_eq!(config.marker_stream, None);
        assert_eq!(config.marker_mode, MarkerMode::Instant);
        assert!(!config.continuous);
        assert!(config.output.to_string_lossy().starts_with("PPG_recording_"));
    }

    #[test]
    fn control_args_map_to_config() {
        let cli = Cli::try_parse_from([
            "neurolink",
            "control",
            "--actuator-url",
            "http://10.0.0.2",
            "--threshold",
            "left=0.7",
            "--threshold",
            "right=0.9",
            "--simulate",
        ])
        .unwrap();
        let Commands::Control { source, control } = cli.command else {
            panic!("expected control");
        };
        assert!(source.simulate);
        let config = control.to_config(&source);
        assert_eq!(config.window_len(), Some(256));
        assert_eq!(config.channels, 4);
        assert_eq!(config.cycle_interval, Duration::from_millis(50));
        let policy = config.policy();
        assert_eq!(policy.threshold(Command::Left), Some(0.7));
        assert_eq!(policy.threshold(Command::Right), Some(0.9));
    }

    #[test]
    fn invalid_numbers_are_rejected_before_anything_runs() {
        for args in [
            &["neurolink", "control", "--actuator-url", "x", "--sample-rate", "0"][..],
            &["neurolink", "control", "--actuator-url", "x", "--channels", "0"][..],
            &["neurolink", "control", "--actuator-url", "x", "--threshold", "left=2"][..],
            &["neurolink", "record", "--checkpoint-secs", "-1"][..],
            &["neurolink", "record", "--source", "emg"][..],
        ] {
            assert!(Cli::try_parse_from(args.iter().copied()).is_err(), "{args:?}");
        }
    }

    mod session {
        use ndarray::ArrayView2;

        use super::*;
        use crate::control::classifier::ClassifierError;
        use crate::recording::reader::RecordingReader;
        use crate::source::fake::{FakeResolver, FakeStream};

        /// Always most confident in the neutral class, so nothing is sent.
        struct Neutral;

        impl Classifier for Neutral {
            fn predict(
                &mut self,
                _window: ArrayView2<'_, f32>,
            ) -> Result<Vec<f32>, ClassifierError> {
                Ok(vec![0.0, 0.0, 1.0])
            }
        }

        fn headset(stop: &StopToken) -> impl Fn() -> FakeResolver + Clone + Send + 'static {
            let mut eeg = FakeStream::eeg("Muse", &["TP9"]);
            for second in 0..3 {
                let t = f64::from(second);
                eeg = eeg.with_chunk(vec![vec![t]; 2], vec![t, t + 0.5]);
            }
            for i in 0..8 {
                let t = f64::from(i) * 0.25;
                eeg = eeg.with_sample(Some((vec![t], t)));
            }
            let resolver = FakeResolver::default()
                .with_stream(eeg)
                .stop_when_drained(stop.clone());
            move || resolver.clone()
        }

        fn control_config(stream_type: &str) -> ControlConfig {
            ControlConfig {
                stream_type: stream_type.to_owned(),
                sample_rate_hz: 4.0,
                window_secs: 1.0,
                channels: 1,
                cycle_interval: Duration::ZERO,
                actuator_url: "http://127.0.0.1:9".to_owned(),
                ..ControlConfig::default()
            }
        }

        fn record_config(source: SourceKind, output: &Path) -> RecorderConfig {
            RecorderConfig {
                source,
                output: output.to_owned(),
                marker_stream: None,
                ..RecorderConfig::default()
            }
        }

        #[test]
        fn recorder_keeps_going_when_control_finds_no_stream() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("EEG.csv");
            let stop = StopToken::new();

            let outcome = run_session(
                headset(&stop),
                || Ok(Neutral),
                &control_config("ECG"),
                record_config(SourceKind::Eeg, &path),
                &stop,
            )
            .unwrap();

            assert!(outcome.control.is_err());
            let report = outcome.recording.unwrap();
            assert_eq!(report.rows, 6);
            assert_eq!(RecordingReader::open(&path).unwrap().rows().len(), 6);
        }

        #[test]
        fn recorder_keeps_going_when_no_classifier_loads() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("EEG.csv");
            let stop = StopToken::new();

            let outcome = run_session(
                headset(&stop),
                || -> Result<Neutral> { bail!("no model") },
                &control_config("EEG"),
                record_config(SourceKind::Eeg, &path),
                &stop,
            )
            .unwrap();

            assert!(outcome.control.is_err());
            assert_eq!(outcome.recording.unwrap().rows, 6);
        }

        #[test]
        fn control_keeps_going_when_recorder_finds_no_stream() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("PPG.csv");
            let stop = StopToken::new();

            let outcome = run_session(
                headset(&stop),
                || Ok(Neutral),
                &control_config("EEG"),
                record_config(SourceKind::Ppg, &path),
                &stop,
            )
            .unwrap();

            assert!(outcome.recording.is_err());
            assert!(!path.exists());
            let stats = outcome.control.unwrap();
            assert!(stats.cycles > 0);
            assert_eq!(stats.actuations, 0);
        }
    }
}
