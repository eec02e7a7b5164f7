// SPDX-License-Identifier: MIT
//! Headless stream recording with periodic checkpoints.
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use num_format::{Locale, ToFormattedString};

use super::buffer::{ChunkBuffer, dejitter};
use super::checkpoint::Checkpoint;
use super::format::{RecordBatch, RecordingLayout};
use super::markers::MarkerAligner;
use super::writer::RecordingWriter;
use crate::config::RecorderConfig;
use crate::source::{Inlet, StreamInfo, StreamProperty, StreamResolver, resolve_first};
use crate::stop::StopToken;

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    WaitingForStream,
    Acquiring,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    DurationElapsed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionReport {
    pub path: PathBuf,
    pub rows: u64,
    pub samples_pulled: u64,
    pub intermediate_flushes: u64,
    pub final_rows: usize,
    pub markers_received: u64,
    /// Markers whose clock ran too far ahead and were applied on arrival.
    pub markers_pulled_in: u64,
    pub start_correction: f64,
    pub end_correction: f64,
    pub reason: StopReason,
}

/// Everything a flush needs, borrowed from the session's acquisition state.
struct Persist<'w> {
    writer: &'w mut RecordingWriter,
    markers: Option<&'w mut MarkerAligner>,
    dejitter: bool,
}

impl Persist<'_> {
    /// Drains `buffer` into the file with `correction` added to every timestamp.
    /// Returns the newest raw timestamp and the rows written.
    fn flush(
        &mut self,
        buffer: &mut ChunkBuffer,
        correction: f64,
    ) -> Result<Option<(f64, usize)>> {
        let Some(newest) = buffer.newest_timestamp() else {
            return Ok(None);
        };
        let (mut timestamps, samples) = buffer.drain();
        // Markers share the raw stream clock, so align before touching timestamps.
        let markers = self.markers.as_mut().map(|m| m.align(&timestamps));
        if self.dejitter {
            dejitter(&mut timestamps);
        }
        for t in &mut timestamps {
            *t += correction;
        }
        let rows = self.writer.append(&RecordBatch {
            timestamps,
            samples,
            markers,
        })?;
        Ok(Some((newest, rows)))
    }
}

pub struct RecordingSession<'a, R: ?Sized> {
    resolver: &'a R,
    config: RecorderConfig,
    stop: StopToken,
    state: SessionState,
}

impl<'a, R: StreamResolver + ?Sized> RecordingSession<'a, R> {
    #[must_use]
    pub fn new(resolver: &'a R, config: RecorderConfig, stop: StopToken) -> Self {
        Self {
            resolver,
            config,
            stop,
            state: SessionState::WaitingForStream,
        }
    }

    #[cfg(test)]
    fn state(&self) -> SessionState {
        self.state
    }

    fn enter(&mut self, state: SessionState) {
        log::debug!("recorder: {:?} -> {state:?}", self.state);
        self.state = state;
    }

    /// Records until the stop token is set or the duration elapses, then
    /// writes whatever is still buffered. The session ends `Stopped` on every
    /// path.
    ///
    /// # Errors
    ///
    /// Returns an error if no stream is found, its channel labels are
    /// unusable, or the recording file cannot be written. Discovery and label
    /// failures happen before the file is created.
    pub fn run(&mut self) -> Result<SessionReport> {
        self.enter(SessionState::WaitingForStream);
        let result = self.record();
        self.enter(SessionState::Stopped);
        result
    }

    fn record(&mut self) -> Result<SessionReport> {
        let config = self.config.clone();
        let kind = config.source.stream_type();
        let chunk_len = config.source.chunk_len();

        log::info!("looking for a {kind} stream...");
        let info = resolve_first(
            self.resolver,
            StreamProperty::Type,
            kind,
            config.discovery_timeout,
        )
        .with_context(|| format!("can't find {kind} stream"))?;
        let mut inlet = self
            .resolver
            .open(&info, chunk_len)
            .with_context(|| format!("failed to open inlet for '{}'", info.name))?;
        let labels = inlet.describe()?.into_labels(&info.name)?;
        log::info!("recording '{}': {}", info.name, labels.join(", "));

        let mut marker_source = self.open_markers();
        let mut aligner = marker_source
            .as_ref()
            .map(|(info, _)| MarkerAligner::new(info.channel_count, config.marker_mode));

        let start_correction = inlet
            .time_correction()
            .context("failed to query time correction")?;
        log::info!("time correction: {start_correction:.6} s");
        // Marker timestamps are moved onto the sample stream's clock.
        let marker_offset = match &mut marker_source {
            Some((info, marker_inlet)) => match marker_inlet.time_correction() {
                Ok(correction) => correction - start_correction,
                Err(e) => {
                    log::warn!(
                        "no time correction for '{}', using its clock as is: {e}",
                        info.name
                    );
                    0.0
                }
            },
            None => 0.0,
        };

        self.enter(SessionState::Acquiring);
        let layout = RecordingLayout {
            channel_labels: labels,
            marker_width: aligner.as_ref().map_or(0, MarkerAligner::width),
        };
        let mut writer = RecordingWriter::create(&config.output, &layout)?;
        let mut buffer = ChunkBuffer::new(layout.channel_labels.len());
        let mut checkpoint = Checkpoint::new(config.checkpoint_interval);

        log::info!("recording to {} ...", config.output.display());
        let started = Instant::now();
        let mut last_status = Instant::now();
        let mut newest_sample: Option<f64> = None;

        let reason = loop {
            if self.stop.is_stopped() {
                log::info!("interrupted");
                break StopReason::Interrupted;
            }
            if let Some(max) = config.duration
                && started.elapsed() >= max
            {
                log::info!("duration limit reached");
                break StopReason::DurationElapsed;
            }

            match inlet.pull_chunk(config.chunk_pull_timeout, chunk_len) {
                Ok(chunk) if chunk.is_empty() => {}
                Ok(chunk) => {
                    let newest = chunk.timestamps.last().copied();
                    if let Err(e) = buffer.append(chunk) {
                        log::warn!("dropping chunk: {e}");
                    } else {
                        newest_sample = newest.or(newest_sample);
                    }
                }
                Err(e) => log::warn!("chunk pull failed: {e}"),
            }

            if let (Some((_, marker_inlet)), Some(aligner)) = (&mut marker_source, &mut aligner) {
                match marker_inlet.pull_sample(config.marker_pull_timeout) {
                    Ok(Some(marker)) => {
                        log::debug!("marker {:?} at {:.3}", marker.values, marker.timestamp);
                        aligner.push(
                            &marker.values,
                            marker.timestamp + marker_offset,
                            newest_sample,
                        );
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("marker pull failed: {e}"),
                }
            }

            if config.continuous && checkpoint.is_due(buffer.newest_timestamp()) {
                let mut persist = Persist {
                    writer: &mut writer,
                    markers: aligner.as_mut(),
                    dejitter: config.dejitter,
                };
                if let Some((newest, rows)) = persist.flush(&mut buffer, start_correction)? {
                    checkpoint.record_flush(newest, rows);
                    log::debug!(
                        "checkpoint at {newest:.3}: {rows} rows, {} persisted so far",
                        checkpoint.rows_persisted()
                    );
                }
            }

            if last_status.elapsed() >= STATUS_INTERVAL {
                log_status(started.elapsed(), buffer.total_pulled(), &config.output);
                last_status = Instant::now();
            }
        };

        let end_correction = match inlet.time_correction() {
            Ok(correction) => correction,
            Err(e) => {
                log::warn!("failed to re-query time correction, keeping the start value: {e}");
                start_correction
            }
        };
        log::info!("time correction: {end_correction:.6} s");

        let mut persist = Persist {
            writer: &mut writer,
            markers: aligner.as_mut(),
            dejitter: config.dejitter,
        };
        let final_rows = persist
            .flush(&mut buffer, end_correction)?
            .map_or(0, |(_, rows)| rows);
        let rows = writer.finish()?;

        log::info!(
            "done: {} rows written to {}",
            rows.to_formatted_string(&Locale::en),
            config.output.display()
        );
        Ok(SessionReport {
            path: config.output.clone(),
            rows,
            samples_pulled: buffer.total_pulled(),
            intermediate_flushes: checkpoint.flushes(),
            final_rows,
            markers_received: aligner.as_ref().map_or(0, MarkerAligner::received),
            markers_pulled_in: aligner.as_ref().map_or(0, MarkerAligner::pulled_in),
            start_correction,
            end_correction,
            reason,
        })
    }

    /// The marker stream is optional: any failure here is logged and the
    /// session continues without marker columns.
    fn open_markers(&self) -> Option<(StreamInfo, R::Inlet)> {
        let name = self.config.marker_stream.as_deref()?;
        log::info!("looking for marker stream '{name}'...");
        let opened = resolve_first(
            self.resolver,
            StreamProperty::Name,
            name,
            self.config.discovery_timeout,
        )
        .and_then(|info| {
            let inlet = self.resolver.open(&info, 1)?;
            Ok((info, inlet))
        });
        match opened {
            Ok((info, inlet)) => {
                log::info!("found marker stream '{}' ({} values)", info.name, info.channel_count);
                Some((info, inlet))
            }
            Err(e) => {
                log::warn!("continuing without markers: {e}");
                None
            }
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn log_status(elapsed: Duration, samples: u64, path: &Path) {
    let size = std::fs::metadata(path).map_or(0, |m| m.len());
    log::info!(
        "  [{}s] {} samples, {:.1} KB on disk",
        elapsed.as_secs(),
        samples.to_formatted_string(&Locale::en),
        size as f64 / 1024.0
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::markers::MarkerMode;
    use crate::recording::reader::RecordingReader;
    use crate::source::fake::{FakeResolver, FakeStream};

    fn config(output: &Path) -> RecorderConfig {
        RecorderConfig {
            output: output.to_owned(),
            ..RecorderConfig::default()
        }
    }

    /// Twelve seconds at 8 Hz in one-second chunks; every timestamp is exact.
    fn twelve_seconds() -> FakeStream {
        (0..12).fold(FakeStream::eeg("Muse", &["TP9", "AF7"]), |stream, second| {
            let timestamps: Vec<f64> = (0..8)
                .map(|i| f64::from(second) + f64::from(i) / 8.0)
                .collect();
            let samples = timestamps.iter().map(|&t| vec![t, -t]).collect();
            stream.with_chunk(samples, timestamps)
        })
    }

    fn run(
        resolver: FakeResolver,
        config: RecorderConfig,
        stop: &StopToken,
    ) -> Result<SessionReport> {
        let resolver = resolver.stop_when_drained(stop.clone());
        let mut session = RecordingSession::new(&resolver, config, stop.clone());
        let report = session.run();
        assert_eq!(session.state(), SessionState::Stopped);
        report
    }

    #[test]
    fn checkpoints_cover_every_sample_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EEG.csv");
        let stop = StopToken::new();

        let report = run(
            FakeResolver::default().with_stream(twelve_seconds()),
            config(&path),
            &stop,
        )
        .unwrap();

        assert_eq!(report.reason, StopReason::Interrupted);
        assert!(report.intermediate_flushes >= 2);
        assert!(report.final_rows > 0);
        assert_eq!(report.rows, 96);
        assert_eq!(report.samples_pulled, 96);

        let reader = RecordingReader::open(&path).unwrap();
        assert_eq!(reader.layout().channel_labels, vec!["TP9", "AF7"]);
        assert_eq!(reader.layout().marker_width, 0);
        let timestamps: Vec<f64> = reader.rows().iter().map(|r| r.timestamp).collect();
        let expected: Vec<f64> = (0..96).map(|k| f64::from(k) / 8.0).collect();
        assert_eq!(timestamps, expected);
        assert_eq!(reader.rows()[9].values, vec![1.125, -1.125]);
    }

    #[test]
    fn stop_only_mode_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EEG.csv");
        let stop = StopToken::new();

        let report = run(
            FakeResolver::default().with_stream(twelve_seconds()),
            RecorderConfig {
                continuous: false,
                ..config(&path)
            },
            &stop,
        )
        .unwrap();

        assert_eq!(report.intermediate_flushes, 0);
        assert_eq!(report.final_rows, 96);
        assert_eq!(RecordingReader::open(&path).unwrap().rows().len(), 96);
    }

    #[test]
    fn markers_carry_forward_across_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EEG.csv");
        let stop = StopToken::new();

        let eeg = [0.5, 2.0, 3.5, 4.5]
            .into_iter()
            .fold(FakeStream::eeg("Muse", &["TP9"]), |s, t| {
                s.with_chunk(vec![vec![t]], vec![t])
            });
        let buttons = FakeStream::markers("ArduinoMarkers", 4)
            .with_sample(Some((vec![1.0, 0.0, 0.0, 0.0], 1.0)))
            .with_sample(Some((vec![1.0, 0.0, 1.0, 0.0], 4.0)));
        let resolver = FakeResolver::default().with_stream(eeg).with_stream(buttons);

        let report = run(resolver, config(&path), &stop).unwrap();
        assert_eq!(report.markers_received, 2);
        assert_eq!(report.intermediate_flushes, 1);

        let markers: Vec<Vec<i32>> = RecordingReader::open(&path)
            .unwrap()
            .rows()
            .iter()
            .map(|r| r.markers.clone())
            .collect();
        assert_eq!(
            markers,
            vec![
                vec![0, 0, 0, 0],
                vec![1, 0, 0, 0],
                vec![1, 0, 0, 0],
                vec![1, 0, 1, 0],
            ]
        );
    }

    fn carry_forward_rows(path: &Path) -> Vec<Vec<i32>> {
        RecordingReader::open(path)
            .unwrap()
            .rows()
            .iter()
            .map(|r| r.markers.clone())
            .collect()
    }

    #[test]
    fn marker_clock_is_corrected_onto_the_sample_clock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EEG.csv");
        let stop = StopToken::new();

        let eeg = [0.5, 2.0, 3.5, 4.5]
            .into_iter()
            .fold(FakeStream::eeg("Muse", &["TP9"]), |s, t| {
                s.with_chunk(vec![vec![t]], vec![t])
            });
        // The marker host's clock reads 1000 s behind the EEG host's.
        let buttons = FakeStream::markers("ArduinoMarkers", 1)
            .with_sample(Some((vec![1.0], 1.0 - 1000.0)))
            .with_sample(Some((vec![2.0], 4.0 - 1000.0)))
            .with_time_correction(1000.0, 1000.0);
        let resolver = FakeResolver::default().with_stream(eeg).with_stream(buttons);

        let report = run(resolver, config(&path), &stop).unwrap();
        assert_eq!(report.markers_pulled_in, 0);
        assert_eq!(
            carry_forward_rows(&path),
            vec![vec![0], vec![1], vec![1], vec![2]]
        );
    }

    #[test]
    fn markers_from_a_clock_far_ahead_still_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EEG.csv");
        let stop = StopToken::new();

        let eeg = [0.5, 2.0, 3.5, 4.5]
            .into_iter()
            .fold(FakeStream::eeg("Muse", &["TP9"]), |s, t| {
                s.with_chunk(vec![vec![t]], vec![t])
            });
        let buttons = FakeStream::markers("ArduinoMarkers", 1)
            .with_sample(Some((vec![1.0], 1001.0)))
            .with_sample(Some((vec![2.0], 1004.0)));
        let resolver = FakeResolver::default().with_stream(eeg).with_stream(buttons);

        let report = run(resolver, config(&path), &stop).unwrap();
        assert_eq!(report.markers_pulled_in, 2);
        assert_eq!(
            carry_forward_rows(&path),
            vec![vec![1], vec![2], vec![2], vec![2]]
        );
    }

    #[test]
    fn instant_markers_mark_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EEG.csv");
        let stop = StopToken::new();

        let eeg = FakeStream::eeg("Muse", &["TP9"])
            .with_chunk(vec![vec![0.0]; 4], vec![0.5, 2.0, 3.5, 4.5]);
        let buttons =
            FakeStream::markers("ArduinoMarkers", 1).with_sample(Some((vec![1.0], 2.1)));
        let resolver = FakeResolver::default().with_stream(eeg).with_stream(buttons);

        run(
            resolver,
            RecorderConfig {
                marker_mode: MarkerMode::Instant,
                continuous: false,
                ..config(&path)
            },
            &stop,
        )
        .unwrap();

        let markers: Vec<i32> = RecordingReader::open(&path)
            .unwrap()
            .rows()
            .iter()
            .map(|r| r.markers[0])
            .collect();
        assert_eq!(markers, vec![0, 1, 0, 0]);
    }

    #[test]
    fn start_correction_for_checkpoints_end_correction_at_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EEG.csv");
        let stop = StopToken::new();

        let eeg = FakeStream::eeg("Muse", &["TP9"])
            .with_chunk(vec![vec![1.0], vec![2.0]], vec![0.0, 0.25])
            .with_chunk(vec![vec![3.0], vec![4.0]], vec![0.5, 0.75])
            .with_time_correction(0.5, 2.0);

        let report = run(
            FakeResolver::default().with_stream(eeg),
            config(&path),
            &stop,
        )
        .unwrap();
        assert!((report.start_correction - 0.5).abs() < f64::EPSILON);
        assert!((report.end_correction - 2.0).abs() < f64::EPSILON);

        let timestamps: Vec<f64> = RecordingReader::open(&path)
            .unwrap()
            .rows()
            .iter()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(timestamps, vec![0.5, 0.75, 2.5, 2.75]);
    }

    #[test]
    fn dejitter_regularises_flushed_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EEG.csv");
        let stop = StopToken::new();

        let eeg = FakeStream::eeg("Muse", &["TP9"])
            .with_chunk(vec![vec![0.0]; 3], vec![0.0, 1.25, 2.0]);

        run(
            FakeResolver::default().with_stream(eeg),
            RecorderConfig {
                dejitter: true,
                continuous: false,
                ..config(&path)
            },
            &stop,
        )
        .unwrap();

        let rows = RecordingReader::open(&path).unwrap();
        let timestamps: Vec<f64> = rows.rows().iter().map(|r| r.timestamp).collect();
        for (got, want) in timestamps.iter().zip([0.0833, 1.0833, 2.0833]) {
            assert!((got - want).abs() < 1e-3, "{timestamps:?}");
        }
    }

    #[test]
    fn missing_stream_aborts_without_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EEG.csv");
        let stop = StopToken::new();

        let resolver =
            FakeResolver::default().with_stream(FakeStream::markers("ArduinoMarkers", 4));
        let err = run(resolver, config(&path), &stop).unwrap_err();

        assert!(err.to_string().contains("EEG"));
        assert!(!path.exists());
    }

    #[test]
    fn unlabelled_stream_aborts_without_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EEG.csv");
        let stop = StopToken::new();

        let eeg = twelve_seconds().without_labels();
        assert!(run(FakeResolver::default().with_stream(eeg), config(&path), &stop).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn zero_duration_stops_before_pulling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EEG.csv");
        let stop = StopToken::new();

        let report = run(
            FakeResolver::default().with_stream(twelve_seconds()),
            RecorderConfig {
                duration: Some(Duration::ZERO),
                ..config(&path)
            },
            &stop,
        )
        .unwrap();

        assert_eq!(report.reason, StopReason::DurationElapsed);
        assert_eq!(report.rows, 0);
        assert!(RecordingReader::open(&path).unwrap().rows().is_empty());
    }
}
