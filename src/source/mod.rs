// SPDX-License-Identifier: MIT
//! Stream discovery and pull interfaces.
//!
//! A resolver finds streams by one of their advertised properties and opens
//! inlets on them. Every consumer opens its own inlet; inlets are never
//! shared, so pull cursors are never coupled between subsystems.

#[cfg(test)]
pub mod fake;
#[cfg(feature = "lsl")]
pub mod lsl;
pub mod simulated;

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[cfg(feature = "lsl")]
pub use self::lsl::LslResolver as LiveResolver;
#[cfg(not(feature = "lsl"))]
pub use self::unavailable::UnavailableResolver as LiveResolver;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no stream with {property}='{value}' found within {timeout:?}")]
    NotFound {
        property: StreamProperty,
        value: String,
        timeout: Duration,
    },

    #[error("stream '{stream}' does not describe its channel labels")]
    MissingChannelLabels { stream: String },

    #[error("stream '{stream}' describes {labels} channel labels for {channels} channels")]
    LabelCountMismatch {
        stream: String,
        labels: usize,
        channels: usize,
    },

    #[error("stream backend error: {0}")]
    Backend(String),
}

/// Stream property a resolver can match on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamProperty {
    Name,
    Type,
    SourceId,
}

impl StreamProperty {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Type => "type",
            Self::SourceId => "source_id",
        }
    }
}

impl fmt::Display for StreamProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stream advertises before anyone connects to it.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    pub name: String,
    pub stream_type: String,
    pub source_id: String,
    pub channel_count: usize,
    /// Nominal sampling rate in Hz; zero for irregular streams such as markers.
    pub nominal_srate: f64,
}

impl StreamInfo {
    #[must_use]
    pub fn matches(&self, property: StreamProperty, value: &str) -> bool {
        match property {
            StreamProperty::Name => self.name == value,
            StreamProperty::Type => self.stream_type == value,
            StreamProperty::SourceId => self.source_id == value,
        }
    }
}

/// Self-description read from an open inlet.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamDescription {
    pub channel_count: usize,
    pub channel_labels: Option<Vec<String>>,
}

impl StreamDescription {
    /// Returns the channel labels, failing when they are absent or do not
    /// cover every channel.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::MissingChannelLabels`] or
    /// [`SourceError::LabelCountMismatch`].
    pub fn into_labels(self, stream: &str) -> Result<Vec<String>, SourceError> {
        let labels = self
            .channel_labels
            .filter(|labels| !labels.is_empty())
            .ok_or_else(|| SourceError::MissingChannelLabels {
                stream: stream.to_owned(),
            })?;

        if labels.len() != self.channel_count {
            return Err(SourceError::LabelCountMismatch {
                stream: stream.to_owned(),
                labels: labels.len(),
                channels: self.channel_count,
            });
        }
        Ok(labels)
    }
}

/// One multi-channel reading with its source timestamp in seconds.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub values: Vec<f64>,
    pub timestamp: f64,
}

/// Samples pulled together, with one timestamp per sample.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Chunk {
    pub samples: Vec<Vec<f64>>,
    pub timestamps: Vec<f64>,
}

impl Chunk {
    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

pub trait Inlet {
    /// Waits up to `timeout` for one sample. `Ok(None)` means the wait timed out.
    fn pull_sample(&mut self, timeout: Duration) -> Result<Option<Sample>, SourceError>;

    /// Waits up to `timeout` for any available samples, returning at most
    /// `max_samples`. An empty chunk means the wait timed out.
    fn pull_chunk(&mut self, timeout: Duration, max_samples: usize)
    -> Result<Chunk, SourceError>;

    /// Offset in seconds to add to this stream's timestamps to express them
    /// on the local clock.
    fn time_correction(&mut self) -> Result<f64, SourceError>;

    fn describe(&mut self) -> Result<StreamDescription, SourceError>;
}

pub trait StreamResolver {
    type Inlet: Inlet;

    /// Lists streams whose `property` equals `value`, waiting up to `timeout`.
    fn resolve(
        &self,
        property: StreamProperty,
        value: &str,
        timeout: Duration,
    ) -> Result<Vec<StreamInfo>, SourceError>;

    /// Lists every stream visible within `timeout`.
    fn resolve_all(&self, timeout: Duration) -> Result<Vec<StreamInfo>, SourceError>;

    fn open(&self, info: &StreamInfo, max_chunk_len: usize) -> Result<Self::Inlet, SourceError>;
}

/// Resolves the first stream matching `property=value`.
///
/// # Errors
///
/// Returns [`SourceError::NotFound`] when nothing matches within `timeout`,
/// or the resolver's own error.
pub fn resolve_first<R: StreamResolver + ?Sized>(
    resolver: &R,
    property: StreamProperty,
    value: &str,
    timeout: Duration,
) -> Result<StreamInfo, SourceError> {
    let mut streams = resolver.resolve(property, value, timeout)?;
    if streams.len() > 1 {
        log::warn!(
            "{} streams match {property}='{value}', using the first",
            streams.len()
        );
    }
    if streams.is_empty() {
        return Err(SourceError::NotFound {
            property,
            value: value.to_owned(),
            timeout,
        });
    }
    Ok(streams.swap_remove(0))
}

#[cfg(not(feature = "lsl"))]
mod unavailable {
    use std::time::Duration;

    use super::{
        Chunk, Inlet, Sample, SourceError, StreamDescription, StreamInfo, StreamProperty,
        StreamResolver,
    };

    const MESSAGE: &str = "built without the `lsl` feature; use --simulate";

    /// Stand-in for the network backend when it is compiled out.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct UnavailableResolver;

    pub enum NoInlet {}

    impl Inlet for NoInlet {
        fn pull_sample(&mut self, _timeout: Duration) -> Result<Option<Sample>, SourceError> {
            match *self {}
        }

        fn pull_chunk(
            &mut self,
            _timeout: Duration,
            _max_samples: usize,
        ) -> Result<Chunk, SourceError> {
            match *self {}
        }

        fn time_correction(&mut self) -> Result<f64, SourceError> {
            match *self {}
        }

        fn describe(&mut self) -> Result<StreamDescription, SourceError> {
            match *self {}
        }
    }

    impl StreamResolver for UnavailableResolver {
        type Inlet = NoInlet;

        fn resolve(
            &self,
            _property: StreamProperty,
            _value: &str,
            _timeout: Duration,
        ) -> Result<Vec<StreamInfo>, SourceError> {
            Err(SourceError::Backend(MESSAGE.to_owned()))
        }

        fn resolve_all(&self, _timeout: Duration) -> Result<Vec<StreamInfo>, SourceError> {
            Err(SourceError::Backend(MESSAGE.to_owned()))
        }

        fn open(&self, _info: &StreamInfo, _max_chunk_len: usize) -> Result<NoInlet, SourceError> {
            Err(SourceError::Backend(MESSAGE.to_owned()))
        }
    }
}
