//! 2D Convolutional layer implementation
//!
//! This module provides a Convolution layer that turns a 2D convolution into a
//! single matrix product over unrolled patches (see [`crate::utils::im2col`]).

use crate::error::{invalid_config, shape_mismatch, LayerError, Result};
use crate::layers::affine::replace_param;
use crate::layers::{Layer, Param};
use crate::tensor::Tensor;
use crate::utils::im2col::{col2im, conv_output_size, im2col};
use rand::Rng;

// State from the last forward pass.
#[derive(Debug, Clone)]
struct Cache {
    input_shape: Vec<usize>,
    col: Tensor,
    col_w: Tensor,
    out_h: usize,
    out_w: usize,
}

/// 2D Convolutional layer with learnable filters.
///
/// Slides `out_channels` filters over a `(N, C, H, W)` input with symmetric
/// zero padding and a fixed stride, producing `(N, out_channels, out_h, out_w)`.
///
/// # Fields
///
/// * `weights` - Filters (out_channels × in_channels × filter_h × filter_w)
/// * `bias` - One bias per output channel (out_channels)
/// * `stride` - Step between neighbouring windows
/// * `pad` - Zero-padding applied to every spatial border
///
/// # Example
///
/// ```
/// use neural_layers::layers::{Convolution, Layer};
/// use neural_layers::Tensor;
///
/// // one 2x2 filter summing its window
/// let w = Tensor::filled(&[1, 1, 2, 2], 1.0);
/// let mut layer = Convolution::new(w, Tensor::zeros(&[1]), 1, 0).unwrap();
///
/// let x = Tensor::new((1..=9).map(|v| v as f32).collect(), vec![1, 1, 3, 3]).unwrap();
/// let y = layer.forward(&x).unwrap();
/// assert_eq!(y.shape(), &[1, 1, 2, 2]);
/// assert_eq!(y.data(), &[12.0, 16.0, 24.0, 28.0]);
/// ```
#[derive(Debug, Clone)]
pub struct Convolution {
    weights: Tensor,
    bias: Tensor,
    grad_weights: Tensor,
    grad_bias: Tensor,
    stride: usize,
    pad: usize,
    cache: Option<Cache>,
}

impl Convolution {
    /// Creates a convolution layer from explicit filters and biases.
    ///
    /// # Errors
    ///
    /// - `ShapeMismatch` unless `weights` is rank 4 and `bias` has one entry
    ///   per filter
    /// - `InvalidConfiguration` when `stride` is zero or a filter dimension
    ///   is zero
    pub fn new(weights: Tensor, bias: Tensor, stride: usize, pad: usize) -> Result<Self> {
        if weights.ndim() != 4 {
            return Err(shape_mismatch(format!(
                "Convolution weights must be (FN, C, FH, FW), got {:?}",
                weights.shape()
            )));
        }
        if bias.shape() != [weights.shape()[0]] {
            return Err(shape_mismatch(format!(
                "Convolution bias {:?} does not match {} filters",
                bias.shape(),
                weights.shape()[0]
            )));
        }
        if stride == 0 {
            return Err(invalid_config("Convolution stride must be greater than 0"));
        }
        if weights.is_empty() {
            return Err(invalid_config(format!(
                "Convolution filter dimensions must be positive, got {:?}",
                weights.shape()
            )));
        }
        log::debug!(
            "Convolution layer {:?} stride={} pad={}",
            weights.shape(),
            stride,
            pad
        );

        Ok(Self {
            grad_weights: Tensor::zeros(weights.shape()),
            grad_bias: Tensor::zeros(bias.shape()),
            weights,
            bias,
            stride,
            pad,
            cache: None,
        })
    }

    /// Creates a convolution layer with Xavier initialization.
    ///
    /// Uses fan_in = in_channels·filter_h·filter_w and
    /// fan_out = out_channels·filter_h·filter_w; biases start at zero.
    ///
    /// # Arguments
    ///
    /// * `in_channels` - Number of input channels (e.g., 1 for grayscale, 3 for RGB)
    /// * `out_channels` - Number of filters
    /// * `filter` - `(filter_h, filter_w)`
    /// * `stride` - Stride for the convolution
    /// * `pad` - Zero-padding
    /// * `rng` - Random number generator for weight initialization
    pub fn xavier<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        filter: (usize, usize),
        stride: usize,
        pad: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let (filter_h, filter_w) = filter;
        let fan_in = (in_channels * filter_h * filter_w) as f32;
        let fan_out = (out_channels * filter_h * filter_w) as f32;
        if fan_in == 0.0 || fan_out == 0.0 {
            return Err(invalid_config(
                "Convolution channels and filter size must be greater than 0",
            ));
        }
        let limit = (6.0f32 / (fan_in + fan_out)).sqrt();

        let shape = vec![out_channels, in_channels, filter_h, filter_w];
        let count: usize = shape.iter().product();
        let data = (0..count).map(|_| rng.gen_range(-limit..=limit)).collect();
        Self::new(
            Tensor::new(data, shape)?,
            Tensor::zeros(&[out_channels]),
            stride,
            pad,
        )
    }

    pub fn in_channels(&self) -> usize {
        self.weights.shape()[1]
    }

    pub fn out_channels(&self) -> usize {
        self.weights.shape()[0]
    }

    /// `(filter_h, filter_w)`.
    pub fn filter_size(&self) -> (usize, usize) {
        (self.weights.shape()[2], self.weights.shape()[3])
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn pad(&self) -> usize {
        self.pad
    }

    /// Output spatial size for an input of `height × width`.
    pub fn output_size(&self, height: usize, width: usize) -> Result<(usize, usize)> {
        let (filter_h, filter_w) = self.filter_size();
        Ok((
            conv_output_size(height, filter_h, self.stride, self.pad)?,
            conv_output_size(width, filter_w, self.stride, self.pad)?,
        ))
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    pub fn grad_weights(&self) -> &Tensor {
        &self.grad_weights
    }

    pub fn grad_bias(&self) -> &Tensor {
        &self.grad_bias
    }

    pub fn set_weights(&mut self, weights: Tensor) -> Result<()> {
        replace_param("Convolution weights", &mut self.weights, weights)
    }

    pub fn set_bias(&mut self, bias: Tensor) -> Result<()> {
        replace_param("Convolution bias", &mut self.bias, bias)
    }
}

impl Layer for Convolution {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.cache = None;
        if input.ndim() != 4 || input.shape()[1] != self.in_channels() {
            return Err(shape_mismatch(format!(
                "Convolution expects (N, {}, H, W) input, got {:?}",
                self.in_channels(),
                input.shape()
            )));
        }
        let batch = input.shape()[0];
        let (out_h, out_w) = self.output_size(input.shape()[2], input.shape()[3])?;
        let (filter_h, filter_w) = self.filter_size();
        let filters = self.out_channels();

        let col = im2col(input, filter_h, filter_w, self.stride, self.pad)?;
        let col_w = self
            .weights
            .reshape(&[filters, self.weights.len() / filters])?
            .transpose()?;

        // (N·OH·OW, FN) -> (N, OH, OW, FN) -> (N, FN, OH, OW)
        let out = col
            .matmul(&col_w)?
            .add(&self.bias)?
            .into_reshape(&[batch, out_h, out_w, filters])?
            .permute(&[0, 3, 1, 2])?;
        log::trace!("Convolution forward {:?} -> {:?}", input.shape(), out.shape());

        self.cache = Some(Cache {
            input_shape: input.shape().to_vec(),
            col,
            col_w,
            out_h,
            out_w,
        });
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let cache = self.cache.as_ref().ok_or_else(|| {
            LayerError::UninitializedState("Convolution backward called before forward".to_string())
        })?;
        let filters = self.out_channels();
        let expected = [cache.input_shape[0], filters, cache.out_h, cache.out_w];
        if grad_output.shape() != expected {
            return Err(shape_mismatch(format!(
                "Convolution gradient {:?} does not match output {:?}",
                grad_output.shape(),
                expected
            )));
        }

        let dout = grad_output
            .permute(&[0, 2, 3, 1])?
            .into_reshape(&[cache.col.shape()[0], filters])?;

        let grad_bias = dout.sum_axis0()?;
        let grad_weights = cache
            .col
            .transpose()?
            .matmul(&dout)?
            .transpose()?
            .into_reshape(self.weights.shape())?;
        let dcol = dout.matmul(&cache.col_w.transpose()?)?;

        let (filter_h, filter_w) = self.filter_size();
        let dx = col2im(
            &dcol,
            &cache.input_shape,
            filter_h,
            filter_w,
            self.stride,
            self.pad,
        )?;

        self.grad_weights = grad_weights;
        self.grad_bias = grad_bias;
        Ok(dx)
    }

    fn name(&self) -> &'static str {
        "Convolution"
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
