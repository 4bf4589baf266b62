//! Pointwise activation layers: Sigmoid and ReLU

use crate::error::{shape_mismatch, LayerError, Result};
use crate::layers::Layer;
use crate::tensor::Tensor;
use crate::utils::activations::{sigmoid, sigmoid_derivative};

fn check_grad_shape(layer: &str, grad_output: &Tensor, expected: &[usize]) -> Result<()> {
    if grad_output.shape() != expected {
        return Err(shape_mismatch(format!(
            "{} gradient {:?} does not match forward output {:?}",
            layer,
            grad_output.shape(),
            expected
        )));
    }
    Ok(())
}

/// Logistic sigmoid layer.
///
/// Caches its output, since the derivative `y * (1 - y)` only needs the
/// activation and not the input.
#[derive(Debug, Clone, Default)]
pub struct Sigmoid {
    out: Option<Tensor>,
}

impl Sigmoid {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for Sigmoid {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let out = input.map(sigmoid);
        self.out = Some(out.clone());
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let out = self.out.as_ref().ok_or_else(|| {
            LayerError::UninitializedState("Sigmoid backward called before forward".to_string())
        })?;
        check_grad_shape("Sigmoid", grad_output, out.shape())?;
        grad_output.zip_map(out, |g, y| g * sigmoid_derivative(y))
    }

    fn name(&self) -> &'static str {
        "Sigmoid"
    }
}

/// Rectified linear unit.
///
/// Caches a mask of the positions where the input was `<= 0`; no gradient
/// flows through them (the sub-gradient at exactly 0 is taken as 0).
/// `backward` leaves the caller's gradient untouched and returns a new tensor.
#[derive(Debug, Clone, Default)]
pub struct Relu {
    mask: Option<Vec<bool>>,
    shape: Vec<usize>,
}

impl Relu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions zeroed by the last forward call.
    pub fn mask(&self) -> Option<&[bool]> {
        self.mask.as_deref()
    }
}

impl Layer for Relu {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let mask: Vec<bool> = input.data().iter().map(|&v| v <= 0.0).collect();
        let out = input.map(|v| if v <= 0.0 { 0.0 } else { v });
        self.mask = Some(mask);
        self.shape = input.shape().to_vec();
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let mask = self.mask.as_ref().ok_or_else(|| {
            LayerError::UninitializedState("ReLU backward called before forward".to_string())
        })?;
        check_grad_shape("ReLU", grad_output, &self.shape)?;

        let mut grad_input = grad_output.clone();
        for (g, &masked) in grad_input.data_mut().iter_mut().zip(mask) {
            if masked {
                *g = 0.0;
            }
        }
        Ok(grad_input)
    }

    fn name(&self) -> &'static str {
        "ReLU"
    }
}
