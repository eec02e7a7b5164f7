// SPDX-License-Identifier: MIT
//! CSV layout of a recording: `timestamps,<channel labels…>[,Marker0…]`.
use serde::Serialize;

pub const TIMESTAMP_COLUMN: &str = "timestamps";
pub const MARKER_COLUMN_PREFIX: &str = "Marker";

#[must_use]
pub fn marker_column(index: usize) -> String {
    format!("{MARKER_COLUMN_PREFIX}{index}")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordingLayout {
    pub channel_labels: Vec<String>,
    /// Zero when the recording carries no marker columns.
    pub marker_width: usize,
}

impl RecordingLayout {
    #[must_use]
    pub fn header(&self) -> Vec<String> {
        std::iter::once(TIMESTAMP_COLUMN.to_owned())
            .chain(self.channel_labels.iter().cloned())
            .chain((0..self.marker_width).map(marker_column))
            .collect()
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        1 + self.channel_labels.len() + self.marker_width
    }

    /// Recovers the layout from a header row.
    ///
    /// Returns `None` if the first column is not the timestamp column.
    #[must_use]
    pub fn from_header<'a>(header: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut columns = header.into_iter();
        if columns.next()? != TIMESTAMP_COLUMN {
            return None;
        }
        let mut channel_labels = Vec::new();
        let mut marker_width = 0;
        for column in columns {
            if column
                .strip_prefix(MARKER_COLUMN_PREFIX)
                .is_some_and(|n| n.parse::<usize>().is_ok())
            {
                marker_width += 1;
            } else {
                channel_labels.push(column.to_owned());
            }
        }
        Some(Self {
            channel_labels,
            marker_width,
        })
    }
}

/// Rows ready to be appended, already clock-corrected.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordBatch {
    pub timestamps: Vec<f64>,
    pub samples: Vec<Vec<f64>>,
    /// One marker vector per row, when the recording has markers.
    pub markers: Option<Vec<Vec<i32>>>,
}

impl RecordBatch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}
