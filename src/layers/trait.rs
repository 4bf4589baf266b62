//! Layer trait definitions
//!
//! This module defines the capability set every layer provides: a forward pass
//! that caches whatever the backward pass needs, and a backward pass that turns
//! the gradient of the loss with respect to the layer output into the gradient
//! with respect to its input (storing parameter gradients on the layer).

use crate::error::Result;
use crate::tensor::Tensor;

/// A trainable parameter paired with its most recent gradient.
///
/// Handed to optimizers through [`Layer::params`]: the gradient is read-only,
/// the parameter is updated in place. Both always share a shape.
pub struct Param<'a> {
    pub name: &'static str,
    pub value: &'a mut Tensor,
    pub grad: &'a Tensor,
}

/// Core trait for single-input layers.
///
/// A layer instance holds at most one in-flight forward/backward pair: each
/// forward call overwrites the cache consumed by the next backward call.
/// Layers are not meant to be shared between threads while a pass is running.
///
/// # Example
///
/// ```
/// use neural_layers::layers::{Layer, Relu};
/// use neural_layers::Tensor;
///
/// let mut relu = Relu::new();
/// let x = Tensor::from_rows(&[[-1.0, 2.0]]).unwrap();
/// let y = relu.forward(&x).unwrap();
/// assert_eq!(y.data(), &[0.0, 2.0]);
///
/// let dx = relu.backward(&Tensor::from_rows(&[[5.0, 5.0]]).unwrap()).unwrap();
/// assert_eq!(dx.data(), &[0.0, 5.0]);
/// ```
pub trait Layer {
    /// Forward propagation.
    ///
    /// Computes the layer output and caches the state needed by `backward`.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when the input is incompatible with the layer's
    /// parameters or expected rank.
    fn forward(&mut self, input: &Tensor) -> Result<Tensor>;

    /// Backward propagation.
    ///
    /// Given the gradient of the loss with respect to this layer's output,
    /// returns the gradient with respect to its input and stores parameter
    /// gradients on the layer.
    ///
    /// # Errors
    ///
    /// - `UninitializedState` when no matching forward call precedes it
    /// - `ShapeMismatch` when `grad_output` does not match the cached output
    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor>;

    /// Short, stable name of the layer kind (e.g. "Affine").
    fn name(&self) -> &'static str;

    /// Switch between training and inference behavior.
    ///
    /// Only layers whose behavior differs (Dropout, BatchNorm) react.
    fn set_training(&mut self, _training: bool) {}

    fn is_training(&self) -> bool {
        true
    }

    /// Number of trainable scalars.
    fn parameter_count(&self) -> usize {
        0
    }

    /// Trainable parameters with their current gradients.
    fn params(&mut self) -> Vec<Param<'_>> {
        Vec::new()
    }

    /// Plain gradient-descent step: `param -= learning_rate * grad`.
    fn update_parameters(&mut self, learning_rate: f32) {
        for param in self.params() {
            for (value, &grad) in param.value.data_mut().iter_mut().zip(param.grad.data()) {
                *value -= learning_rate * grad;
            }
        }
    }
}

/// Core trait for two-input elementwise layers.
pub trait BinaryLayer {
    fn forward(&mut self, x: &Tensor, y: &Tensor) -> Result<Tensor>;

    /// Returns the gradients with respect to `x` and `y`, each shaped like the
    /// corresponding forward operand.
    fn backward(&mut self, grad_output: &Tensor) -> Result<(Tensor, Tensor)>;

    fn name(&self) -> &'static str;
}
