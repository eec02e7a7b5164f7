// SPDX-License-Identifier: MIT
//! Pairing an irregular marker stream with regularly sampled data.
use std::collections::VecDeque;

use clap::ValueEnum;

/// A marker stamped further than this ahead of the newest sample is taken to
/// have happened at that sample.
pub const MAX_MARKER_LEAD_SECS: f64 = 10.0;
/// Queue bound; past it the oldest queued marker becomes current early.
pub const MAX_PENDING_MARKERS: usize = 65_536;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum MarkerMode {
    /// Every sample carries the last marker known at its timestamp.
    #[default]
    CarryForward,
    /// Only the sample closest to a marker carries it; the rest get the default.
    Instant,
}

#[derive(Clone, Debug, PartialEq)]
struct TimedMarker {
    values: Vec<i32>,
    timestamp: f64,
}

/// Markers are queued by timestamp and resolved against each flushed batch,
/// so alignment follows the stream clock rather than arrival order.
#[derive(Debug)]
pub struct MarkerAligner {
    mode: MarkerMode,
    default: Vec<i32>,
    last_known: Vec<i32>,
    pending: VecDeque<TimedMarker>,
    received: u64,
    pulled_in: u64,
}

impl MarkerAligner {
    /// `width` fixes the marker vector length; the default marker is all zeros.
    #[must_use]
    pub fn new(width: usize, mode: MarkerMode) -> Self {
        Self {
            mode,
            default: vec![0; width],
            last_known: vec![0; width],
            pending: VecDeque::new(),
            received: 0,
            pulled_in: 0,
        }
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.default.len()
    }

    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Markers whose timestamp was pulled back to the newest sample.
    #[must_use]
    pub fn pulled_in(&self) -> u64 {
        self.pulled_in
    }

    /// Queues a marker stamped on the sample clock. Values are rounded and
    /// padded or cut to the marker width.
    ///
    /// `newest_sample` is the latest sample timestamp seen so far. A marker
    /// stamped more than [`MAX_MARKER_LEAD_SECS`] past it could never be
    /// reached, so it is treated as arriving at `newest_sample`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn push(&mut self, values: &[f64], timestamp: f64, newest_sample: Option<f64>) {
        let mut marker: Vec<i32> = values
            .iter()
            .take(self.width())
            .map(|v| v.round() as i32)
            .collect();
        marker.resize(self.width(), 0);

        let timestamp = match newest_sample {
            Some(now) if timestamp > now + MAX_MARKER_LEAD_SECS => {
                if self.pulled_in == 0 {
                    log::warn!(
                        "marker at {timestamp:.3} is {:.1} s ahead of the samples; \
                         clocks disagree, applying markers on arrival",
                        timestamp - now
                    );
                }
                self.pulled_in += 1;
                now
            }
            _ => timestamp,
        };

        let pos = self.pending.partition_point(|m| m.timestamp <= timestamp);
        self.pending.insert(
            pos,
            TimedMarker {
                values: marker,
                timestamp,
            },
        );
        self.received += 1;

        while self.pending.len() > MAX_PENDING_MARKERS {
            if let Some(oldest) = self.pending.pop_front() {
                self.last_known = oldest.values;
            }
        }
    }

    /// One marker vector per entry of `timestamps`, which must be ascending.
    /// Markers newer than the last timestamp stay queued for the next batch.
    pub fn align(&mut self, timestamps: &[f64]) -> Vec<Vec<i32>> {
        match self.mode {
            MarkerMode::CarryForward => self.carry_forward(timestamps),
            MarkerMode::Instant => self.instant(timestamps),
        }
    }

    fn carry_forward(&mut self, timestamps: &[f64]) -> Vec<Vec<i32>> {
        timestamps
            .iter()
            .map(|&t| {
                while let Some(marker) = self.pending.front()
                    && marker.timestamp <= t
                {
                    if let Some(marker) = self.pending.pop_front() {
                        self.last_known = marker.values;
                    }
                }
                self.last_known.clone()
            })
            .collect()
    }

    fn instant(&mut self, timestamps: &[f64]) -> Vec<Vec<i32>> {
        let mut aligned = vec![self.default.clone(); timestamps.len()];
        while let Some(marker) = self.pending.front() {
            let after = timestamps.partition_point(|&t| t < marker.timestamp);
            if after == timestamps.len() {
                break;
            }
            let target = if after > 0
                && marker.timestamp - timestamps[after - 1] < timestamps[after] - marker.timestamp
            {
                after - 1
            } else {
                after
            };
            if let Some(marker) = self.pending.pop_front() {
                self.last_known.clone_from(&marker.values);
                aligned[target] = marker.values;
            }
        }
        aligned
    }
}
