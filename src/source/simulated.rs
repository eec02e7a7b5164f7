// SPDX-License-Identifier: MIT
//! Synthetic headset and button-box streams for running without hardware.
use std::f64::consts::TAU;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{
    Chunk, Inlet, Sample, SourceError, StreamDescription, StreamInfo, StreamProperty,
    StreamResolver,
};

const MUSE_LABELS: [&str; 5] = ["TP9", "AF7", "AF8", "TP10", "Right AUX"];
const MUSE_SRATE: f64 = 256.0;
const BUTTON_COUNT: usize = 4;
const NOISE_UV: f64 = 4.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Signal {
    /// Regularly sampled alpha/beta mixture plus noise.
    Waveform,
    /// Irregular button states that toggle every few seconds.
    Buttons,
}

#[derive(Clone, Debug)]
struct SimulatedStream {
    info: StreamInfo,
    labels: Vec<String>,
    signal: Signal,
}

#[derive(Clone, Debug)]
pub struct SimulatedResolver {
    streams: Vec<SimulatedStream>,
    epoch: Instant,
}

impl Default for SimulatedResolver {
    fn default() -> Self {
        let eeg = SimulatedStream {
            info: StreamInfo {
                name: "Muse".to_owned(),
                stream_type: "EEG".to_owned(),
                source_id: "simulated-muse".to_owned(),
                channel_count: MUSE_LABELS.len(),
                nominal_srate: MUSE_SRATE,
            },
            labels: MUSE_LABELS.iter().map(|&l| l.to_owned()).collect(),
            signal: Signal::Waveform,
        };
        let markers = SimulatedStream {
            info: StreamInfo {
                name: "ArduinoMarkers".to_owned(),
                stream_type: "Markers".to_owned(),
                source_id: "simulated-buttons".to_owned(),
                channel_count: BUTTON_COUNT,
                nominal_srate: 0.0,
            },
            labels: (0..BUTTON_COUNT).map(|i| format!("Button{i}")).collect(),
            signal: Signal::Buttons,
        };
        Self {
            streams: vec![eeg, markers],
            epoch: Instant::now(),
        }
    }
}

impl StreamResolver for SimulatedResolver {
    type Inlet = SimulatedInlet;

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

    fn open(
        &self,
        info: &StreamInfo,
        _max_chunk_len: usize,
    ) -> Result<SimulatedInlet, SourceError> {
        let stream = self
            .streams
            .iter()
            .find(|s| s.info.source_id == info.source_id)
            .cloned()
            .ok_or_else(|| SourceError::Backend(format!("no simulated stream '{}'", info.name)))?;

        let opened = Instant::now();
        Ok(SimulatedInlet {
            origin: opened.duration_since(self.epoch).as_secs_f64(),
            opened,
            emitted: 0,
            buttons: vec![0.0; stream.info.channel_count],
            next_toggle: opened + Duration::from_secs(1),
            rng: StdRng::seed_from_u64(0x5eed),
            stream,
        })
    }
}

pub struct SimulatedInlet {
    stream: SimulatedStream,
    /// Stream clock reading at `opened`, in seconds since the resolver epoch.
    origin: f64,
    opened: Instant,
    emitted: u64,
    buttons: Vec<f64>,
    next_toggle: Instant,
    rng: StdRng,
}

impl SimulatedInlet {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn due_samples(&self) -> u64 {
        let elapsed = self.opened.elapsed().as_secs_f64();
        let produced = (elapsed * self.stream.info.nominal_srate) as u64;
        produced.saturating_sub(self.emitted)
    }

    #[allow(clippy::cast_precision_loss)]
    fn next_waveform_sample(&mut self) -> (Vec<f64>, f64) {
        let t = self.emitted as f64 / self.stream.info.nominal_srate;
        let values = (0..self.stream.info.channel_count)
            .map(|ch| {
                let phase = ch as f64 * 0.7;
                let alpha = 20.0 * (TAU * 10.0 * t + phase).sin();
                let beta = 6.0 * (TAU * 21.0 * t + phase).sin();
                alpha + beta + self.rng.gen_range(-NOISE_UV..NOISE_UV)
            })
            .collect();
        self.emitted += 1;
        (values, self.origin + t)
    }

    fn pull_waveform(&mut self, timeout: Duration, max_samples: usize) -> Chunk {
        let deadline = Instant::now() + timeout;
        let period = Duration::from_secs_f64(1.0 / self.stream.info.nominal_srate);
        loop {
            let due = self.due_samples();
            if due > 0 {
                let take = usize::try_from(due).unwrap_or(usize::MAX).min(max_samples.max(1));
                let mut chunk = Chunk::default();
                for _ in 0..take {
                    let (values, ts) = self.next_waveform_sample();
                    chunk.samples.push(values);
                    chunk.timestamps.push(ts);
                }
                return chunk;
            }
            let now = Instant::now();
            if now >= deadline {
                return Chunk::default();
            }
            thread::sleep(period.min(deadline - now));
        }
    }

    fn pull_buttons(&mut self, timeout: Duration) -> Option<Sample> {
        let now = Instant::now();
        if now < self.next_toggle {
            let wait = self.next_toggle - now;
            if wait > timeout {
                thread::sleep(timeout);
                return None;
            }
            thread::sleep(wait);
        }

        let button = self.rng.gen_range(0..self.buttons.len().max(1));
        if let Some(state) = self.buttons.get_mut(button) {
            *state = 1.0 - *state;
        }
        self.next_toggle = Instant::now() + Duration::from_secs_f64(self.rng.gen_range(0.5..3.0));
        Some(Sample {
            values: self.buttons.clone(),
            timestamp: self.origin + self.opened.elapsed().as_secs_f64(),
        })
    }
}

impl Inlet for SimulatedInlet {
    fn pull_sample(&mut self, timeout: Duration) -> Result<Option<Sample>, SourceError> {
        Ok(match self.stream.signal {
            Signal::Waveform => {
                let mut chunk = self.pull_waveform(timeout, 1);
                chunk.samples.pop().zip(chunk.timestamps.pop()).map(|(values, timestamp)| Sample {
                    values,
                    timestamp,
                })
            }
            Signal::Buttons => self.pull_buttons(timeout),
        })
    }

    fn pull_chunk(&mut self, timeout: Duration, max_samples: usize) -> Result<Chunk, SourceError> {
        Ok(match self.stream.signal {
            Signal::Waveform => self.pull_waveform(timeout, max_samples),
            Signal::Buttons => {
                let mut chunk = Chunk::default();
                if let Some(sample) = self.pull_buttons(timeout) {
                    chunk.samples.push(sample.values);
                    chunk.timestamps.push(sample.timestamp);
                }
                chunk
            }
        })
    }

    /// Synthetic streams share the local clock.
    fn time_correction(&mut self) -> Result<f64, SourceError> {
        Ok(0.0)
    }

    fn describe(&mut self) -> Result<StreamDescription, SourceError> {
        Ok(StreamDescription {
            channel_count: self.stream.info.channel_count,
            channel_labels: Some(self.stream.labels.clone()),
        })
    }
}
