// SPDX-License-Identifier: MIT
use std::num::NonZeroUsize;

use ndarray::Array2;
use thiserror::Error;

/// Largest window the control loop allocates, in samples times channels.
pub const MAX_WINDOW_VALUES: usize = 1 << 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error(
        "window of {capacity} samples x {channels} channels exceeds {MAX_WINDOW_VALUES} values"
    )]
    TooLarge { capacity: usize, channels: usize },

    #[error("window not primed: {pushed} of {capacity} samples collected")]
    NotPrimed { pushed: usize, capacity: usize },

    #[error("sample has {actual} channels, window expects {expected}")]
    ChannelMismatch { expected: usize, actual: usize },
}

/// The most recent `capacity` samples, oldest first.
///
/// Storage is a single ring allocated up front; pushes overwrite the oldest
/// slot in place once the window is full.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    data: Vec<f32>,
    channels: usize,
    capacity: usize,
    /// Slot holding the oldest sample.
    head: usize,
    len: usize,
}

impl RollingWindow {
    /// # Errors
    ///
    /// Returns [`WindowError::TooLarge`] if the ring would hold more than
    /// [`MAX_WINDOW_VALUES`] values.
    pub fn new(capacity: NonZeroUsize, channels: NonZeroUsize) -> Result<Self, WindowError> {
        let (capacity, channels) = (capacity.get(), channels.get());
        let values = capacity
            .checked_mul(channels)
            .filter(|&n| n <= MAX_WINDOW_VALUES)
            .ok_or(WindowError::TooLarge { capacity, channels })?;
        Ok(Self {
            data: vec![0.0; values],
            channels,
            capacity,
            head: 0,
            len: 0,
        })
    }

    /// Appends one sample, evicting the oldest when full. A sample with the
    /// wrong channel count is rejected and leaves the window untouched.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::ChannelMismatch`] if `values` has the wrong length.
    #[allow(clippy::cast_possible_truncation)]
    pub fn push(&mut self, values: &[f64]) -> Result<(), WindowError> {
        if values.len() != self.channels {
            return Err(WindowError::ChannelMismatch {
                expected: self.channels,
                actual: values.len(),
            });
        }

        let slot = if self.len < self.capacity {
            let slot = (self.head + self.len) % self.capacity;
            self.len += 1;
            slot
        } else {
            let slot = self.head;
            self.head = (self.head + 1) % self.capacity;
            slot
        };

        let start = slot * self.channels;
        for (dst, &src) in self.data[start..start + self.channels].iter_mut().zip(values) {
            *dst = src as f32;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_primed(&self) -> bool {
        self.len == self.capacity
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copies the window out as a `capacity × channels` array, oldest row first.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::NotPrimed`] until `capacity` samples have been pushed.
    pub fn snapshot(&self) -> Result<Array2<f32>, WindowError> {
        if !self.is_primed() {
            return Err(WindowError::NotPrimed {
                pushed: self.len,
                capacity: self.capacity,
            });
        }
        Ok(Array2::from_shape_fn(
            (self.capacity, self.channels),
            |(row, ch)| self.data[((self.head + row) % self.capacity) * self.channels + ch],
        ))
    }
}
