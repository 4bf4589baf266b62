//! Affine (fully connected) layer implementation
//!
//! This module provides an Affine layer (also known as Dense or Linear) that
//! performs the transformation: output = input × weights + bias

use crate::error::{invalid_config, shape_mismatch, LayerError, Result};
use crate::layers::{Layer, Param};
use crate::tensor::Tensor;
use rand::Rng;

/// Fully connected layer with weights and bias.
///
/// Performs y = xW + b where x is (batch_size × input_size), W is
/// (input_size × output_size) and b is (output_size). Inputs of higher rank
/// are flattened to (batch_size, features) and the input gradient is reshaped
/// back to the original input shape.
///
/// # Example
///
/// ```
/// use neural_layers::layers::{Affine, Layer};
/// use neural_layers::Tensor;
///
/// let w = Tensor::from_rows(&[[1.0, 0.0], [0.0, 1.0]]).unwrap();
/// let b = Tensor::vector(vec![0.0, 0.0]);
/// let mut layer = Affine::new(w, b).unwrap();
///
/// let x = Tensor::from_rows(&[[1.0, 2.0]]).unwrap();
/// assert_eq!(layer.forward(&x).unwrap().data(), &[1.0, 2.0]);
///
/// let dx = layer.backward(&Tensor::from_rows(&[[1.0, 1.0]]).unwrap()).unwrap();
/// assert_eq!(dx.data(), &[1.0, 1.0]);
/// assert_eq!(layer.grad_weights().data(), &[1.0, 1.0, 2.0, 2.0]);
/// assert_eq!(layer.grad_bias().data(), &[1.0, 1.0]);
/// ```
#[derive(Debug, Clone)]
pub struct Affine {
    weights: Tensor,
    bias: Tensor,
    grad_weights: Tensor,
    grad_bias: Tensor,

    // Cached by forward: flattened input and the caller's original shape
    input: Option<Tensor>,
    input_shape: Vec<usize>,
}

impl Affine {
    /// Create an Affine layer from explicit parameters.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` unless `weights` is rank 2 and `bias` is a rank-1
    /// tensor whose length equals the number of weight columns.
    pub fn new(weights: Tensor, bias: Tensor) -> Result<Self> {
        if weights.ndim() != 2 {
            return Err(shape_mismatch(format!(
                "Affine weights must be (in, out), got {:?}",
                weights.shape()
            )));
        }
        if bias.shape() != [weights.shape()[1]] {
            return Err(shape_mismatch(format!(
                "Affine bias {:?} does not match weight columns {}",
                bias.shape(),
                weights.shape()[1]
            )));
        }
        log::debug!("Affine layer {:?}", weights.shape());

        Ok(Self {
            grad_weights: Tensor::zeros(weights.shape()),
            grad_bias: Tensor::zeros(bias.shape()),
            weights,
            bias,
            input: None,
            input_shape: Vec::new(),
        })
    }

    /// Create an Affine layer with Xavier initialization.
    ///
    /// Weights are sampled uniformly from [-limit, limit] with
    /// limit = sqrt(6 / (input_size + output_size)); biases start at zero.
    pub fn xavier<R: Rng>(
        input_size: usize,
        output_size: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if input_size == 0 || output_size == 0 {
            return Err(invalid_config("Affine sizes must be greater than 0"));
        }
        let limit = (6.0f32 / (input_size + output_size) as f32).sqrt();
        let data = (0..input_size * output_size)
            .map(|_| rng.gen_range(-limit..=limit))
            .collect();
        Self::new(
            Tensor::new(data, vec![input_size, output_size])?,
            Tensor::zeros(&[output_size]),
        )
    }

    pub fn input_size(&self) -> usize {
        self.weights.shape()[0]
    }

    pub fn output_size(&self) -> usize {
        self.weights.shape()[1]
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// dW from the most recent backward call.
    pub fn grad_weights(&self) -> &Tensor {
        &self.grad_weights
    }

    /// db from the most recent backward call.
    pub fn grad_bias(&self) -> &Tensor {
        &self.grad_bias
    }

    /// Replace the weights with a tensor of the same shape.
    pub fn set_weights(&mut self, weights: Tensor) -> Result<()> {
        replace_param("Affine weights", &mut self.weights, weights)
    }

    /// Replace the bias with a tensor of the same shape.
    pub fn set_bias(&mut self, bias: Tensor) -> Result<()> {
        replace_param("Affine bias", &mut self.bias, bias)
    }
}

pub(crate) fn replace_param(what: &str, slot: &mut Tensor, value: Tensor) -> Result<()> {
    if value.shape() != slot.shape() {
        return Err(shape_mismatch(format!(
            "{} must keep shape {:?}, got {:?}",
            what,
            slot.shape(),
            value.shape()
        )));
    }
    *slot = value;
    Ok(())
}

impl Layer for Affine {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.input = None;
        let x = input.flatten_batch()?;
        if x.shape()[1] != self.input_size() {
            return Err(shape_mismatch(format!(
                "Affine expects {} input features, got {} (input {:?})",
                self.input_size(),
                x.shape()[1],
                input.shape()
            )));
        }
        let out = x.matmul(&self.weights)?.add(&self.bias)?;
        log::trace!("Affine forward {:?} -> {:?}", input.shape(), out.shape());

        self.input = Some(x);
        self.input_shape = input.shape().to_vec();
        Ok(out)
    }

    /// dW = xᵀ·dOut, db = column sums of dOut, dx = dOut·Wᵀ (original input shape).
    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let x = self.input.as_ref().ok_or_else(|| {
            LayerError::UninitializedState("Affine backward called before forward".to_string())
        })?;
        let expected = [x.shape()[0], self.output_size()];
        if grad_output.shape() != expected {
            return Err(shape_mismatch(format!(
                "Affine gradient {:?} does not match output {:?}",
                grad_output.shape(),
                expected
            )));
        }

        let dx = grad_output.matmul(&self.weights.transpose()?)?;
        self.grad_weights = x.transpose()?.matmul(grad_output)?;
        self.grad_bias = grad_output.sum_axis0()?;

        dx.into_reshape(&self.input_shape)
    }

    fn name(&self) -> &'static str {
        "Affine"
    }

    fn parameter_count(&self) -> usize {
        self.weights.len() + self.bias.len()
    }

    fn params(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                name: "weights",
                value: &mut self.weights,
                grad: &self.grad_weights,
            },
            Param {
                name: "bias",
                value: &mut self.bias,
                grad: &self.grad_bias,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_affine_creation() {
        let layer = Affine::new(Tensor::zeros(&[10, 5]), Tensor::zeros(&[5])).unwrap();
        assert_eq!(layer.input_size(), 10);
        assert_eq!(layer.output_size(), 5);
        assert_eq!(layer.parameter_count(), 55);
        assert_eq!(layer.grad_weights().shape(), layer.weights().shape());
    }

    #[test]
    fn test_affine_rejects_bad_bias() {
        let err = Affine::new(Tensor::zeros(&[3, 2]), Tensor::zeros(&[3])).unwrap_err();
        assert!(matches!(err, LayerError::ShapeMismatch(_)));
    }

    #[test]
    fn test_xavier_initialization() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let layer = Affine::xavier(100, 50, &mut rng).unwrap();
        let limit = (6.0f32 / 150.0).sqrt();

        for &weight in layer.weights().data() {
            assert!(
                (-limit..=limit).contains(&weight),
                "Weight {} outside Xavier range [{}, {}]",
                weight,
                -limit,
                limit
            );
        }
        assert!(layer.bias().data().iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_deterministic_initialization() {
        let layer1 = Affine::xavier(10, 5, &mut ChaCha8Rng::seed_from_u64(7)).unwrap();
        let layer2 = Affine::xavier(10, 5, &mut ChaCha8Rng::seed_from_u64(7)).unwrap();
        assert_eq!(layer1.weights(), layer2.weights());
    }

    #[test]
    fn test_forward_flattens_rank4_and_restores_gradient_shape() {
        let mut layer = Affine::new(Tensor::filled(&[8, 3], 0.5), Tensor::zeros(&[3])).unwrap();
        let x = Tensor::filled(&[2, 2, 2, 2], 1.0);
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 3]);
        assert!(y.data().iter().all(|&v| (v - 4.0).abs() < 1e-6));

        let dx = layer.backward(&Tensor::filled(&[2, 3], 1.0)).unwrap();
        assert_eq!(dx.shape(), &[2, 2, 2, 2]);
        assert!(dx.data().iter().all(|&v| (v - 1.5).abs() < 1e-6));
    }

    #[test]
    fn test_forward_feature_mismatch() {
        let mut layer = Affine::new(Tensor::zeros(&[4, 2]), Tensor::zeros(&[2])).unwrap();
        assert!(matches!(
            layer.forward(&Tensor::zeros(&[1, 3])),
            Err(LayerError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_backward_before_forward() {
        let mut layer = Affine::new(Tensor::zeros(&[2, 2]), Tensor::zeros(&[2])).unwrap();
        assert!(matches!(
            layer.backward(&Tensor::zeros(&[1, 2])),
            Err(LayerError::UninitializedState(_))
        ));
    }

    #[test]
    fn test_update_parameters_applies_sgd_step() {
        let w = Tensor::from_rows(&[[1.0, 0.0], [0.0, 1.0]]).unwrap();
        let mut layer = Affine::new(w, Tensor::zeros(&[2])).unwrap();
        layer.forward(&Tensor::from_rows(&[[1.0, 2.0]]).unwrap()).unwrap();
        layer.backward(&Tensor::from_rows(&[[1.0, 1.0]]).unwrap()).unwrap();

        layer.update_parameters(0.1);
        assert_eq!(layer.bias().data(), &[-0.1, -0.1]);
        let w = layer.weights().data();
        assert!((w[0] - 0.9).abs() < 1e-6);
        assert!((w[2] + 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_set_weights_checks_shape() {
        let mut layer = Affine::new(Tensor::zeros(&[2, 2]), Tensor::zeros(&[2])).unwrap();
        assert!(layer.set_weights(Tensor::zeros(&[2, 3])).is_err());
        assert!(layer.set_weights(Tensor::filled(&[2, 2], 1.0)).is_ok());
        assert_eq!(layer.weights().sum(), 4.0);
    }
}
