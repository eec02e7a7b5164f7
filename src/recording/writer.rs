// SPDX-License-Identifier: MIT
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use super::format::{RecordBatch, RecordingLayout};

/// Appends rows to a CSV recording. The header goes out exactly once, at
/// creation; every append is flushed and synced before it returns.
pub struct RecordingWriter {
    csv: csv::Writer<File>,
    layout: RecordingLayout,
    path: PathBuf,
    rows: u64,
}

impl RecordingWriter {
    /// Creates the recording file at `path` and writes the header row.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or the header cannot be written.
    pub fn create(path: &Path, layout: &RecordingLayout) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create recording file: {}", path.display()))?;
        let mut csv = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        csv.write_record(layout.header())
            .context("failed to write CSV header")?;
        csv.flush().context("failed to flush CSV header")?;

        Ok(Self {
            csv,
            layout: layout.clone(),
            path: path.to_owned(),
            rows: 0,
        })
    }

    /// Appends `batch` and makes it durable. Returns the number of rows written.
    ///
    /// # Errors
    ///
    /// Returns an error if a row does not match the layout or the write fails.
    pub fn append(&mut self, batch: &RecordBatch) -> Result<usize> {
        if batch.samples.len() != batch.len()
            || batch.markers.as_ref().is_some_and(|m| m.len() != batch.len())
        {
            bail!("batch columns have different lengths");
        }
        self.validate(batch)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut row: Vec<String> = Vec::with_capacity(self.layout.column_count());
        for (i, (&timestamp, sample)) in batch.timestamps.iter().zip(&batch.samples).enumerate() {
            row.clear();
            row.push(timestamp.to_string());
            row.extend(sample.iter().map(f64::to_string));
            if let Some(markers) = &batch.markers
                && self.layout.marker_width > 0
            {
                row.extend(markers[i].iter().map(i32::to_string));
            }
            self.csv
                .write_record(&row)
                .with_context(|| format!("failed to write row to {}", self.path.display()))?;
        }

        self.csv.flush().context("failed to flush recording")?;
        self.csv
            .get_ref()
            .sync_data()
            .context("failed to sync recording to disk")?;

        self.rows += batch.len() as u64;
        Ok(batch.len())
    }

    /// Checks every row against the layout so a bad batch writes nothing.
    fn validate(&self, batch: &RecordBatch) -> Result<()> {
        let channels = self.layout.channel_labels.len();
        if let Some(sample) = batch.samples.iter().find(|s| s.len() != channels) {
            bail!(
                "sample has {} values, recording has {channels} channels",
                sample.len()
            );
        }
        match (&batch.markers, self.layout.marker_width) {
            (_, 0) => Ok(()),
            (None, _) => bail!("batch is missing its marker columns"),
            (Some(markers), width) => {
                if markers.iter().any(|m| m.len() != width) {
                    bail!("marker vector width differs from the recording's {width}");
                }
                Ok(())
            }
        }
    }

    /// Flushes and closes the file. Returns the total rows written.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub fn finish(mut self) -> Result<u64> {
        self.csv.flush().context("failed to flush recording")?;
        self.csv
            .get_ref()
            .sync_all()
            .context("failed to sync recording to disk")?;
        Ok(self.rows)
    }
}
