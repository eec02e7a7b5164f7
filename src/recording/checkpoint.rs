// SPDX-License-Identifier: MIT
use std::time::Duration;

/// Decides when buffered samples are due to be persisted. Time is measured on
/// the stream clock, so a stalled stream never triggers empty flushes.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    interval: f64,
    last_persisted: Option<f64>,
    flushes: u64,
    rows_persisted: u64,
}

impl Checkpoint {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.as_secs_f64(),
            last_persisted: None,
            flushes: 0,
            rows_persisted: 0,
        }
    }

    /// Due when nothing has been persisted yet, or once the newest buffered
    /// timestamp is strictly past the last persisted one plus the interval.
    #[must_use]
    pub fn is_due(&self, newest: Option<f64>) -> bool {
        match (self.last_persisted, newest) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(last), Some(newest)) => last + self.interval < newest,
        }
    }

    pub fn record_flush(&mut self, newest: f64, rows: usize) {
        self.last_persisted = Some(newest);
        self.flushes += 1;
        self.rows_persisted += rows as u64;
    }

    #[must_use]
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    #[must_use]
    pub fn rows_persisted(&self) -> u64 {
        self.rows_persisted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_data_is_always_due() {
        let checkpoint = Checkpoint::new(Duration::from_secs(5));
        assert!(!checkpoint.is_due(None));
        assert!(checkpoint.is_due(Some(0.0)));
    }

    #[test]
    fn due_strictly_after_interval() {
        let mut checkpoint = Checkpoint::new(Duration::from_secs(5));
        checkpoint.record_flush(10.0, 12);

        assert!(!checkpoint.is_due(Some(14.0)));
        assert!(!checkpoint.is_due(Some(15.0)));
        assert!(checkpoint.is_due(Some(15.5)));
        assert_eq!(checkpoint.flushes(), 1);
        assert_eq!(checkpoint.rows_persisted(), 12);
        assert_eq!(checkpoint.last_persisted, Some(10.0));
    }
}
