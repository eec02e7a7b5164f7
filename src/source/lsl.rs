// SPDX-License-Identifier: MIT
//! Lab Streaming Layer backend.
//!
//! liblsl is synchronous; every call here blocks for at most the timeout it
//! is given.
use std::thread;
use std::time::{Duration, Instant};

use lsl::Pullable;

use super::{
    Chunk, Inlet, Sample, SourceError, StreamDescription, StreamInfo, StreamProperty,
    StreamResolver,
};

/// Buffer liblsl keeps for an inlet, in seconds of data.
const MAX_BUFFER_SECS: i32 = 360;
const INFO_TIMEOUT_SECS: f64 = 2.0;
const TIME_CORRECTION_TIMEOUT_SECS: f64 = 2.0;
const REOPEN_TIMEOUT_SECS: f64 = 2.0;
const CHUNK_POLL_INTERVAL: Duration = Duration::from_millis(2);

fn backend(err: impl std::fmt::Debug) -> SourceError {
    SourceError::Backend(format!("{err:?}"))
}

fn to_info(info: &lsl::StreamInfo) -> StreamInfo {
    StreamInfo {
        name: info.stream_name(),
        stream_type: info.stream_type(),
        source_id: info.source_id(),
        channel_count: usize::try_from(info.channel_count()).unwrap_or(0),
        nominal_srate: info.nominal_srate(),
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LslResolver;

impl StreamResolver for LslResolver {
    type Inlet = LslInlet;

    fn resolve(
        &self,
        property: StreamProperty,
        value: &str,
        timeout: Duration,
    ) -> Result<Vec<StreamInfo>, SourceError> {
        let found = lsl::resolve_byprop(property.as_str(), value, 1, timeout.as_secs_f64())
            .map_err(backend)?;
        Ok(found.iter().map(to_info).collect())
    }

    fn resolve_all(&self, timeout: Duration) -> Result<Vec<StreamInfo>, SourceError> {
        let found = lsl::resolve_streams(timeout.as_secs_f64()).map_err(backend)?;
        Ok(found.iter().map(to_info).collect())
    }

    fn open(&self, info: &StreamInfo, max_chunk_len: usize) -> Result<LslInlet, SourceError> {
        // Handles are not kept across calls, so look the stream up again by
        // its most specific property.
        let (property, value) = if info.source_id.is_empty() {
            (StreamProperty::Name, info.name.as_str())
        } else {
            (StreamProperty::SourceId, info.source_id.as_str())
        };
        let handle = lsl::resolve_byprop(property.as_str(), value, 1, REOPEN_TIMEOUT_SECS)
            .map_err(backend)?
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::NotFound {
                property,
                value: value.to_owned(),
                timeout: Duration::from_secs_f64(REOPEN_TIMEOUT_SECS),
            })?;

        let max_chunk_len = i32::try_from(max_chunk_len).unwrap_or(0);
        let inner =
            lsl::StreamInlet::new(&handle, MAX_BUFFER_SECS, max_chunk_len, true).map_err(backend)?;
        log::debug!("opened LSL inlet on '{}'", info.name);

        Ok(LslInlet { inner })
    }
}

pub struct LslInlet {
    inner: lsl::StreamInlet,
}

impl Inlet for LslInlet {
    fn pull_sample(&mut self, timeout: Duration) -> Result<Option<Sample>, SourceError> {
        let (values, timestamp): (Vec<f64>, f64) =
            self.inner.pull_sample(timeout.as_secs_f64()).map_err(backend)?;
        // liblsl reports a timed-out pull as a zero timestamp.
        if timestamp == 0.0 || values.is_empty() {
            return Ok(None);
        }
        Ok(Some(Sample { values, timestamp }))
    }

    fn pull_chunk(&mut self, timeout: Duration, max_samples: usize) -> Result<Chunk, SourceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let (samples, timestamps): (Vec<Vec<f64>>, Vec<f64>) =
                self.inner.pull_chunk().map_err(backend)?;
            if !timestamps.is_empty() {
                if timestamps.len() > max_samples && max_samples > 0 {
                    log::trace!(
                        "LSL delivered {} samples, more than the {max_samples} requested",
                        timestamps.len()
                    );
                }
                return Ok(Chunk {
                    samples,
                    timestamps,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Chunk::default());
            }
            thread::sleep(CHUNK_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn time_correction(&mut self) -> Result<f64, SourceError> {
        self.inner
            .time_correction(TIME_CORRECTION_TIMEOUT_SECS)
            .map_err(backend)
    }

    fn describe(&mut self) -> Result<StreamDescription, SourceError> {
        let mut info = self.inner.info(INFO_TIMEOUT_SECS).map_err(backend)?;
        let channel_count = usize::try_from(info.channel_count()).unwrap_or(0);

        let mut labels = Vec::with_capacity(channel_count);
        let mut channel = info.desc().child("channels").first_child();
        while channel.is_valid() && labels.len() < channel_count {
            labels.push(channel.child_value_named("label"));
            channel = channel.next_sibling();
        }

        let channel_labels = if labels.is_empty() || labels.iter().any(String::is_empty) {
            None
        } else {
            Some(labels)
        };
        Ok(StreamDescription {
            channel_count,
            channel_labels,
        })
    }
}
