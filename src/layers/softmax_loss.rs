//! Softmax + cross-entropy loss layer
//!
//! Fusing the two lets backward use the closed form `(y - t) / batch_size`
//! instead of differentiating the logarithm and the softmax separately.

use crate::error::{shape_mismatch, LayerError, Result};
use crate::tensor::Tensor;
use crate::utils::activations::{cross_entropy_error, softmax};

/// Training target for [`SoftmaxWithLoss`].
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// One-hot rows with the same shape as the scores.
    OneHot(Tensor),
    /// One class index per sample.
    ClassIndices(Vec<usize>),
}

/// Softmax activation followed by mean cross-entropy loss.
///
/// # Example
///
/// ```
/// use neural_layers::layers::{SoftmaxWithLoss, Target};
/// use neural_layers::Tensor;
///
/// let mut loss_layer = SoftmaxWithLoss::new();
/// let scores = Tensor::from_rows(&[[2.0, 1.0, 0.1]]).unwrap();
/// let loss = loss_layer.forward(&scores, &Target::ClassIndices(vec![0])).unwrap();
/// assert!(loss > 0.0);
///
/// let dx = loss_layer.backward(1.0).unwrap();
/// assert!(dx.sum().abs() < 1e-6);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SoftmaxWithLoss {
    loss: Option<f32>,
    y: Option<Tensor>,
    target: Option<Target>,
}

impl SoftmaxWithLoss {
    pub fn new() -> Self {
        Self::default()
    }

    /// Softmax the scores row-wise and return the batch-mean cross-entropy.
    ///
    /// A rank-1 score vector is treated as a batch of one.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when the scores have no classes, when a one-hot target
    /// differs in shape from the scores,
    /// when the number of class indices differs from the batch size, or when a
    /// class index is out of range.
    pub fn forward(&mut self, scores: &Tensor, target: &Target) -> Result<f32> {
        self.loss = None;
        self.y = None;
        self.target = None;

        let scores = match scores.ndim() {
            1 => scores.reshape(&[1, scores.len()])?,
            2 => scores.clone(),
            _ => {
                return Err(shape_mismatch(format!(
                    "SoftmaxWithLoss expects (batch, classes) scores, got {:?}",
                    scores.shape()
                )))
            }
        };
        let (batch_size, classes) = (scores.shape()[0], scores.shape()[1]);
        if batch_size == 0 {
            return Err(shape_mismatch("SoftmaxWithLoss received an empty batch"));
        }
        if classes == 0 {
            return Err(shape_mismatch("SoftmaxWithLoss received scores with no classes"));
        }

        let target = normalize_target(target, batch_size, classes)?;
        let labels = match &target {
            Target::OneHot(t) => argmax_rows(t.data(), classes),
            Target::ClassIndices(indices) => indices.clone(),
        };

        let y = softmax(&scores)?;
        let loss = cross_entropy_error(y.data(), classes, &labels)?;
        log::trace!("SoftmaxWithLoss forward batch={} loss={}", batch_size, loss);

        self.loss = Some(loss);
        self.y = Some(y);
        self.target = Some(target);
        Ok(loss)
    }

    /// Gradient of the loss with respect to the scores, scaled by `grad_output`
    /// (1.0 when this is the final loss).
    pub fn backward(&mut self, grad_output: f32) -> Result<Tensor> {
        let (y, target) = match (&self.y, &self.target) {
            (Some(y), Some(target)) => (y, target),
            _ => {
                return Err(LayerError::UninitializedState(
                    "SoftmaxWithLoss backward called before forward".to_string(),
                ))
            }
        };
        let (batch_size, classes) = (y.shape()[0], y.shape()[1]);

        let mut dx = match target {
            Target::OneHot(t) => y.sub(t)?,
            Target::ClassIndices(indices) => {
                let mut dx = y.clone();
                for (row, &class) in dx.data_mut().chunks_exact_mut(classes).zip(indices) {
                    row[class] -= 1.0;
                }
                dx
            }
        };
        let factor = grad_output / batch_size as f32;
        dx.data_mut().iter_mut().for_each(|v| *v *= factor);
        Ok(dx)
    }

    /// Loss computed by the most recent forward call.
    pub fn loss(&self) -> Option<f32> {
        self.loss
    }

    /// Softmax probabilities from the most recent forward call.
    pub fn probabilities(&self) -> Option<&Tensor> {
        self.y.as_ref()
    }
}

// Validate the target against the batch and bring one-hot targets to rank 2.
fn normalize_target(target: &Target, batch_size: usize, classes: usize) -> Result<Target> {
    match target {
        Target::OneHot(t) => {
            if t.len() != batch_size * classes || t.ndim() > 2 {
                return Err(shape_mismatch(format!(
                    "one-hot target {:?} does not match scores [{}, {}]",
                    t.shape(),
                    batch_size,
                    classes
                )));
            }
            Ok(Target::OneHot(t.reshape(&[batch_size, classes])?))
        }
        Target::ClassIndices(indices) => {
            if indices.len() != batch_size {
                return Err(shape_mismatch(format!(
                    "{} class indices for a batch of {}",
                    indices.len(),
                    batch_size
                )));
            }
            if let Some(&bad) = indices.iter().find(|&&i| i >= classes) {
                return Err(shape_mismatch(format!(
                    "class index {} out of range for {} classes",
                    bad, classes
                )));
            }
            Ok(Target::ClassIndices(indices.clone()))
        }
    }
}

fn argmax_rows(data: &[f32], cols: usize) -> Vec<usize> {
    data.chunks_exact(cols)
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}
