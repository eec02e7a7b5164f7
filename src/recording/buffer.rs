// SPDX-License-Identifier: MIT
use thiserror::Error;

use crate::source::Chunk;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("chunk has {samples} samples but {timestamps} timestamps")]
    LengthMismatch { samples: usize, timestamps: usize },

    #[error("sample has {actual} channels, stream has {expected}")]
    ChannelMismatch { expected: usize, actual: usize },
}

/// Samples pulled since the last checkpoint, in arrival order.
#[derive(Debug)]
pub struct ChunkBuffer {
    channels: usize,
    timestamps: Vec<f64>,
    samples: Vec<Vec<f64>>,
    total_pulled: u64,
}

impl ChunkBuffer {
    #[must_use]
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            timestamps: Vec::new(),
            samples: Vec::new(),
            total_pulled: 0,
        }
    }

    /// Takes ownership of a pulled chunk. A malformed chunk is rejected whole.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk's columns disagree in length or a sample
    /// has the wrong channel count.
    pub fn append(&mut self, chunk: Chunk) -> Result<usize, BufferError> {
        if chunk.samples.len() != chunk.timestamps.len() {
            return Err(BufferError::LengthMismatch {
                samples: chunk.samples.len(),
                timestamps: chunk.timestamps.len(),
            });
        }
        if let Some(bad) = chunk.samples.iter().find(|s| s.len() != self.channels) {
            return Err(BufferError::ChannelMismatch {
                expected: self.channels,
                actual: bad.len(),
            });
        }
        let n = chunk.len();
        self.timestamps.extend(chunk.timestamps);
        self.samples.extend(chunk.samples);
        self.total_pulled += n as u64;
        Ok(n)
    }

    #[must_use]
    pub fn newest_timestamp(&self) -> Option<f64> {
        self.timestamps.last().copied()
    }

    /// Samples accepted over the buffer's lifetime, drained or not.
    #[must_use]
    pub fn total_pulled(&self) -> u64 {
        self.total_pulled
    }

    /// Empties the buffer, returning `(timestamps, samples)`.
    pub fn drain(&mut self) -> (Vec<f64>, Vec<Vec<f64>>) {
        (
            std::mem::take(&mut self.timestamps),
            std::mem::take(&mut self.samples),
        )
    }
}

/// Replaces `timestamps` with their least-squares line over the sample index,
/// removing arrival jitter while keeping the mean rate.
#[allow(clippy::cast_precision_loss)]
pub fn dejitter(timestamps: &mut [f64]) {
    let n = timestamps.len();
    if n < 2 {
        return;
    }
    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = timestamps.iter().sum::<f64>() / nf;

    let mut cov = 0.0;
    let mut var = 0.0;
    for (i, &t) in timestamps.iter().enumerate() {
        let dx = i as f64 - mean_x;
        cov += dx * (t - mean_y);
        var += dx * dx;
    }
    let slope = cov / var;
    let intercept = mean_y - slope * mean_x;

    for (i, t) in timestamps.iter_mut().enumerate() {
        *t = intercept + slope * i as f64;
    }
}
