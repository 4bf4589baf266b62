//! Activation and loss kernels
//!
//! Pure functions over slices and tensors; the layer types in
//! [`crate::layers`] wrap them with forward/backward state.

use crate::error::{shape_mismatch, Result};
use crate::tensor::Tensor;

/// Small constant added inside the logarithm of the cross-entropy.
pub const CROSS_ENTROPY_DELTA: f32 = 1e-7;

/// Sigmoid activation: 1 / (1 + exp(-x)).
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Sigmoid derivative expressed through the activation itself, y = sigmoid(x).
pub fn sigmoid_derivative(y: f32) -> f32 {
    y * (1.0 - y)
}

/// Softmax applied row-wise in place.
///
/// Subtracts each row's maximum before exponentiating so large logits do not
/// overflow.
pub fn softmax_rows(values: &mut [f32], cols: usize) {
    if cols == 0 {
        return;
    }
    for row in values.chunks_exact_mut(cols) {
        let max_value = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        let mut sum = 0.0f32;
        for value in row.iter_mut() {
            *value = (*value - max_value).exp();
            sum += *value;
        }

        let inv_sum = 1.0 / sum;
        for value in row.iter_mut() {
            *value *= inv_sum;
        }
    }
}

/// Row-wise softmax of a rank-1 or rank-2 score tensor.
///
/// A rank-1 tensor is treated as a single row.
pub fn softmax(scores: &Tensor) -> Result<Tensor> {
    let cols = match scores.ndim() {
        1 | 2 => scores.shape()[scores.ndim() - 1],
        _ => {
            return Err(shape_mismatch(format!(
                "softmax expects rank 1 or 2 scores, got {:?}",
                scores.shape()
            )))
        }
    };
    let mut out = scores.clone();
    softmax_rows(out.data_mut(), cols);
    Ok(out)
}

/// Mean cross-entropy between row-wise probabilities and target classes.
///
/// `probabilities` holds one row of `cols` class probabilities per sample and
/// `classes[i]` is the target class of row `i`.
pub fn cross_entropy_error(probabilities: &[f32], cols: usize, classes: &[usize]) -> Result<f32> {
    if cols == 0 || probabilities.len() != classes.len() * cols {
        return Err(shape_mismatch(format!(
            "{} probabilities cannot hold {} rows of {} classes",
            probabilities.len(),
            classes.len(),
            cols
        )));
    }
    let batch_size = classes.len();
    let mut total = 0.0f32;
    for (row, &class) in probabilities.chunks_exact(cols).zip(classes) {
        let p = row.get(class).ok_or_else(|| {
            shape_mismatch(format!("class index {} out of range for {} classes", class, cols))
        })?;
        total -= (p + CROSS_ENTROPY_DELTA).ln();
    }
    Ok(total / batch_size as f32)
}
