// SPDX-License-Identifier: MIT
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use super::format::RecordingLayout;

#[derive(Clone, Debug, PartialEq)]
pub struct RecordRow {
    pub timestamp: f64,
    pub values: Vec<f64>,
    pub markers: Vec<i32>,
}

pub struct RecordingReader {
    layout: RecordingLayout,
    rows: Vec<RecordRow>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordingSummary {
    pub rows: usize,
    pub channels: Vec<String>,
    pub marker_width: usize,
    pub first_timestamp: Option<f64>,
    pub last_timestamp: Option<f64>,
    pub span_secs: f64,
    /// Rows whose marker vector differs from the previous row's.
    pub marker_transitions: usize,
}

impl RecordingReader {
    /// Reads a whole recording into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the header is not a
    /// recording header, or a row is malformed.
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("failed to open recording file: {}", path.display()))?;

        let header = reader
            .headers()
            .with_context(|| format!("failed to read header of {}", path.display()))?;
        let Some(layout) = RecordingLayout::from_header(header.iter()) else {
            bail!("{} is not a recording (no timestamps column)", path.display());
        };

        let channels = layout.channel_labels.len();
        let mut rows = Vec::new();
        for (i, record) in reader.records().enumerate() {
            let line = i + 2;
            let record = record.with_context(|| format!("invalid row at line {line}"))?;
            if record.len() != layout.column_count() {
                bail!(
                    "line {line} has {} columns, expected {}",
                    record.len(),
                    layout.column_count()
                );
            }
            let timestamp: f64 = record[0]
                .parse()
                .with_context(|| format!("invalid timestamp at line {line}"))?;
            let values = record
                .iter()
                .skip(1)
                .take(channels)
                .map(str::parse::<f64>)
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("invalid sample value at line {line}"))?;
            let markers = record
                .iter()
                .skip(1 + channels)
                .map(str::parse::<i32>)
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("invalid marker value at line {line}"))?;
            rows.push(RecordRow {
                timestamp,
                values,
                markers,
            });
        }

        Ok(Self { layout, rows })
    }

    #[must_use]
    pub fn layout(&self) -> &RecordingLayout {
        &self.layout
    }

    #[must_use]
    pub fn rows(&self) -> &[RecordRow] {
        &self.rows
    }

    #[must_use]
    pub fn summary(&self) -> RecordingSummary {
        let first_timestamp = self.rows.first().map(|r| r.timestamp);
        let last_timestamp = self.rows.last().map(|r| r.timestamp);
        let span_secs = match (first_timestamp, last_timestamp) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };
        let marker_transitions = self
            .rows
            .windows(2)
            .filter(|pair| pair[0].markers != pair[1].markers)
            .count();

        RecordingSummary {
            rows: self.rows.len(),
            channels: self.layout.channel_labels.clone(),
            marker_width: self.layout.marker_width,
            first_timestamp,
            last_timestamp,
            span_secs,
            marker_transitions,
        }
    }
}
