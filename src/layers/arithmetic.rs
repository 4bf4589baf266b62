//! Elementwise two-input layers: Add and Multiply
//!
//! Operands may broadcast against each other. Backward reduces each gradient
//! back to the shape of the operand it belongs to.

use crate::error::{shape_mismatch, LayerError, Result};
use crate::layers::BinaryLayer;
use crate::tensor::{broadcast_shape, Tensor};

/// `x + y`.
///
/// Keeps no activations; it only remembers operand shapes so broadcast
/// gradients can be reduced. Without a prior forward call the gradient is
/// passed through to both inputs unchanged.
#[derive(Debug, Clone, Default)]
pub struct Add {
    shapes: Option<(Vec<usize>, Vec<usize>)>,
}

impl Add {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BinaryLayer for Add {
    fn forward(&mut self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        self.shapes = None;
        let out = x.add(y)?;
        self.shapes = Some((x.shape().to_vec(), y.shape().to_vec()));
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<(Tensor, Tensor)> {
        match &self.shapes {
            Some((x_shape, y_shape)) => Ok((
                grad_output.sum_to_shape(x_shape)?,
                grad_output.sum_to_shape(y_shape)?,
            )),
            None => Ok((grad_output.clone(), grad_output.clone())),
        }
    }

    fn name(&self) -> &'static str {
        "Add"
    }
}

/// `x * y` (elementwise).
#[derive(Debug, Clone, Default)]
pub struct Multiply {
    x: Option<Tensor>,
    y: Option<Tensor>,
}

impl Multiply {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BinaryLayer for Multiply {
    fn forward(&mut self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        self.x = None;
        self.y = None;
        let out = x.mul(y)?;
        self.x = Some(x.clone());
        self.y = Some(y.clone());
        Ok(out)
    }

    /// Product rule: `(dOut * y, dOut * x)`.
    fn backward(&mut self, grad_output: &Tensor) -> Result<(Tensor, Tensor)> {
        let (x, y) = match (&self.x, &self.y) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                return Err(LayerError::UninitializedState(
                    "Multiply backward called before forward".to_string(),
                ))
            }
        };
        let out_shape = broadcast_shape(x.shape(), y.shape())?;
        if grad_output.shape() != out_shape.as_slice() {
            return Err(shape_mismatch(format!(
                "Multiply gradient {:?} does not match output {:?}",
                grad_output.shape(),
                out_shape
            )));
        }
        let dx = grad_output.mul(y)?.sum_to_shape(x.shape())?;
        let dy = grad_output.mul(x)?.sum_to_shape(y.shape())?;
        Ok((dx, dy))
    }

    fn name(&self) -> &'static str {
        "Multiply"
    }
}
