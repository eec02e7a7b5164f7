// SPDX-License-Identifier: MIT
use ndarray::ArrayView2;
use thiserror::Error;

#[derive(Debug, Error)]
#[cfg_attr(not(feature = "onnx"), allow(dead_code))]
pub enum ClassifierError {
    #[cfg(feature = "onnx")]
    #[error("ONNX Runtime error: {0}")]
    Onnx(#[from] ort::Error),

    #[error("model returned no output tensor")]
    NoOutput,

    #[error("window is {rows}x{cols}, model expects {expected}")]
    InvalidShape {
        rows: usize,
        cols: usize,
        expected: String,
    },
}

/// Scores one window. Implementations keep no state between calls.
pub trait Classifier {
    /// `window` is `samples × channels`, oldest sample first. Returns one
    /// score per command class.
    fn predict(&mut self, window: ArrayView2<'_, f32>) -> Result<Vec<f32>, ClassifierError>;
}

impl<T: Classifier + ?Sized> Classifier for Box<T> {
    fn predict(&mut self, window: ArrayView2<'_, f32>) -> Result<Vec<f32>, ClassifierError> {
        (**self).predict(window)
    }
}

impl<T: Classifier + ?Sized> Classifier for &mut T {
    fn predict(&mut self, window: ArrayView2<'_, f32>) -> Result<Vec<f32>, ClassifierError> {
        (**self).predict(window)
    }
}

#[cfg(feature = "onnx")]
pub use self::onnx::OnnxClassifier;

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::Path;

    use anyhow::Context;
    use ndarray::ArrayView2;
    use ort::session::Session;
    use ort::session::builder::GraphOptimizationLevel;
    use ort::value::{Tensor, ValueType};

    use super::{Classifier, ClassifierError};

    /// Runs an exported EEGNet-style model.
    ///
    /// The window is fed channel-major as `(1, C, N, 1)`, or `(1, C, N)` when
    /// the model declares a rank-3 input.
    pub struct OnnxClassifier {
        session: Session,
        input_name: String,
        input_rank: usize,
    }

    impl OnnxClassifier {
        /// Loads the model at `path`.
        ///
        /// # Errors
        ///
        /// Returns an error if the runtime cannot be initialised or the model
        /// cannot be loaded.
        pub fn load(path: &Path) -> anyhow::Result<Self> {
            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .commit_from_file(path)
                .with_context(|| format!("failed to load ONNX model: {}", path.display()))?;

            let input_name = session
                .inputs
                .first()
                .map_or_else(|| "input".to_owned(), |i| i.name.clone());
            let input_rank = session
                .inputs
                .first()
                .and_then(|i| match &i.input_type {
                    ValueType::Tensor { shape, .. } => Some(shape.len()),
                    _ => None,
                })
                .unwrap_or(4);

            log::info!(
                "loaded model {} (input '{input_name}', rank {input_rank})",
                path.display()
            );
            Ok(Self {
                session,
                input_name,
                input_rank,
            })
        }
    }

    impl Classifier for OnnxClassifier {
        fn predict(&mut self, window: ArrayView2<'_, f32>) -> Result<Vec<f32>, ClassifierError> {
            let (samples, channels) = window.dim();
            let data: Vec<f32> = window.t().iter().copied().collect();

            let shape = match self.input_rank {
                3 => vec![1_usize, channels, samples],
                4 => vec![1_usize, channels, samples, 1],
                rank => {
                    return Err(ClassifierError::InvalidShape {
                        rows: samples,
                        cols: channels,
                        expected: format!("rank-{rank} input"),
                    });
                }
            };
            let input = Tensor::from_array((shape, data))?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => input])?;

            let first = outputs.values().next().ok_or(ClassifierError::NoOutput)?;
            let (shape, scores) = first.try_extract_tensor::<f32>()?;
            // (batch, classes): keep the single batch row.
            let batch = shape.first().copied().unwrap_or(1).max(1);
            let per_batch = scores.len() / usize::try_from(batch).unwrap_or(1);
            Ok(scores[..per_batch].to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;

    struct MeanOfFirstChannel;

    impl Classifier for MeanOfFirstChannel {
        fn predict(&mut self, window: ArrayView2<'_, f32>) -> Result<Vec<f32>, ClassifierError> {
            let mean = window.column(0).mean().ok_or(ClassifierError::NoOutput)?;
            Ok(vec![mean, 1.0 - mean])
        }
    }

    #[test]
    fn boxed_and_borrowed_classifiers_delegate() {
        let window = Array2::from_elem((4, 2), 0.25_f32);

        let mut boxed: Box<dyn Classifier> = Box::new(MeanOfFirstChannel);
        assert_eq!(boxed.predict(window.view()).unwrap(), vec![0.25, 0.75]);

        fn score<C: Classifier>(mut classifier: C, window: ArrayView2<'_, f32>) -> Vec<f32> {
            classifier.predict(window).unwrap()
        }
        let mut inner = MeanOfFirstChannel;
        assert_eq!(score(&mut inner, window.view()), vec![0.25, 0.75]);
    }
}
