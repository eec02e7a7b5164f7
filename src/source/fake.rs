// SPDX-License-Identifier: MIT
//! Scripted in-memory streams for tests.
use std::collections::VecDeque;
use std::time::Duration;

use super::{
    Chunk, Inlet, Sample, SourceError, StreamDescription, StreamInfo, StreamProperty,
    StreamResolver,
};
use crate::stop::StopToken;

#[derive(Clone, Debug)]
pub struct FakeStream {
    pub info: StreamInfo,
    pub labels: Option<Vec<String>>,
    pub chunks: VecDeque<Chunk>,
    pub samples: VecDeque<Option<Sample>>,
    pub time_correction: f64,
    pub time_correction_end: Option<f64>,
}

impl FakeStream {
    pub fn eeg(name: &str, labels: &[&str]) -> Self {
        Self {
            info: StreamInfo {
                name: name.to_owned(),
                stream_type: "EEG".to_owned(),
                source_id: format!("{name}-src"),
                channel_count: labels.len(),
                nominal_srate: 256.0,
            },
            labels: Some(labels.iter().map(|&l| l.to_owned()).collect()),
            chunks: VecDeque::new(),
            samples: VecDeque::new(),
            time_correction: 0.0,
            time_correction_end: None,
        }
    }

    pub fn markers(name: &str, width: usize) -> Self {
        Self {
            info: StreamInfo {
                name: name.to_owned(),
                stream_type: "Markers".to_owned(),
                source_id: format!("{name}-src"),
                channel_count: width,
                nominal_srate: 0.0,
            },
            labels: None,
            chunks: VecDeque::new(),
            samples: VecDeque::new(),
            time_correction: 0.0,
            time_correction_end: None,
        }
    }

    pub fn with_chunk(mut self, samples: Vec<Vec<f64>>, timestamps: Vec<f64>) -> Self {
        self.chunks.push_back(Chunk {
            samples,
            timestamps,
        });
        self
    }

    /// Queues one `pull_sample` result; `None` scripts a timed-out pull.
    pub fn with_sample(mut self, sample: Option<(Vec<f64>, f64)>) -> Self {
        self.samples.push_back(sample.map(|(values, timestamp)| Sample { values, timestamp }));
        self
    }

    pub fn with_time_correction(mut self, start: f64, end: f64) -> Self {
        self.time_correction = start;
        self.time_correction_end = Some(end);
        self
    }

    pub fn without_labels(mut self) -> Self {
        self.labels = None;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct FakeResolver {
    streams: Vec<FakeStream>,
    stop_when_drained: Option<StopToken>,
}

impl FakeResolver {
    pub fn with_stream(mut self, stream: FakeStream) -> Self {
        self.streams.push(stream);
        self
    }

    /// Sets `token` once the primary (non-marker) inlet runs out of scripted
    /// chunks or samples.
    pub fn stop_when_drained(mut self, token: StopToken) -> Self {
        self.stop_when_drained = Some(token);
        self
    }
}

impl StreamResolver for FakeResolver {
    type Inlet = FakeInlet;

    fn resolve(
        &self,
        property: StreamProperty,
        value: &str,
        _timeout: Duration,
    ) -> Result<Vec<StreamInfo>, SourceError> {
        Ok(self
            .streams
            .iter()
            .filter(|s| s.info.matches(property, value))
            .map(|s| s.info.clone())
            .collect())
    }

    fn resolve_all(&self, _timeout: Duration) -> Result<Vec<StreamInfo>, SourceError> {
        Ok(self.streams.iter().map(|s| s.info.clone()).collect())
    }

    fn open(&self, info: &StreamInfo, _max_chunk_len: usize) -> Result<FakeInlet, SourceError> {
        let stream = self
            .streams
            .iter()
            .find(|s| s.info == *info)
            .cloned()
            .ok_or_else(|| SourceError::Backend(format!("unknown stream {}", info.name)))?;
        let stop = if stream.info.nominal_srate > 0.0 {
            self.stop_when_drained.clone()
        } else {
            None
        };
        Ok(FakeInlet {
            stream,
            stop_when_drained: stop,
            corrections_queried: 0,
        })
    }
}

#[derive(Debug)]
pub struct FakeInlet {
    stream: FakeStream,
    stop_when_drained: Option<StopToken>,
    corrections_queried: usize,
}

impl Inlet for FakeInlet {
    fn pull_sample(&mut self, _timeout: Duration) -> Result<Option<Sample>, SourceError> {
        let sample = self.stream.samples.pop_front().flatten();
        if self.stream.samples.is_empty()
            && let Some(stop) = &self.stop_when_drained
        {
            stop.stop();
        }
        Ok(sample)
    }

    fn pull_chunk(
        &mut self,
        _timeout: Duration,
        _max_samples: usize,
    ) -> Result<Chunk, SourceError> {
        let chunk = self.stream.chunks.pop_front().unwrap_or_default();
        if self.stream.chunks.is_empty()
            && let Some(stop) = &self.stop_when_drained
        {
            stop.stop();
        }
        Ok(chunk)
    }

    fn time_correction(&mut self) -> Result<f64, SourceError> {
        self.corrections_queried += 1;
        match self.stream.time_correction_end {
            Some(end) if self.corrections_queried > 1 => Ok(end),
            _ => Ok(self.stream.time_correction),
        }
    }

    fn describe(&mut self) -> Result<StreamDescription, SourceError> {
        Ok(StreamDescription {
            channel_count: self.stream.info.channel_count,
            channel_labels: self.stream.labels.clone(),
        })
    }
}
