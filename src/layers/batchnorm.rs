//! Batch normalization layer implementation
//!
//! This module provides a BatchNorm layer that normalizes activations across the
//! batch dimension, then applies a learnable per-feature scale and shift.
//!
//! # Batch Normalization Theory
//!
//! 1. Compute batch statistics: mean μ and variance σ² across the batch
//! 2. Normalize: x_norm = (x - μ) / sqrt(σ² + ε)
//! 3. Scale and shift: y = γ * x_norm + β
//!
//! During training, batch statistics are used and running statistics are updated
//! via exponential moving average. During inference the running statistics are
//! used instead and nothing is mutated.
//!
//! Rank-4 input (N, C, H, W) is treated as N samples of C·H·W features, so
//! `gamma` and `beta` must hold C·H·W entries in that case.
//!
//! # References
//!
//! Ioffe, S., & Szegedy, C. (2015). Batch Normalization: Accelerating Deep Network Training
//! by Reducing Internal Covariate Shift. ICML.

use crate::error::{invalid_config, shape_mismatch, LayerError, Result};
use crate::layers::affine::replace_param;
use crate::layers::{Layer, Param};
use crate::tensor::Tensor;

/// Constant added to the variance before taking the square root.
pub const EPSILON: f32 = 1e-6;

/// Default weight of the previous running statistic in the moving average.
pub const DEFAULT_MOMENTUM: f32 = 0.9;

// Values from the last training-mode forward pass.
#[derive(Debug, Clone)]
struct Cache {
    centered: Vec<f32>,
    normalized: Vec<f32>,
    std: Vec<f32>,
    batch_size: usize,
    input_shape: Vec<usize>,
}

/// Batch normalization layer with learnable scale and shift parameters.
///
/// # Fields
///
/// * `momentum` - Weight of the old value in `running = momentum * running + (1 - momentum) * batch`
/// * `training` - Whether the layer is in training mode (true) or inference mode (false)
/// * `gamma` / `beta` - Learnable scale and shift, one entry per feature
/// * `running_mean` / `running_var` - Moving averages used during inference;
///   zero-initialized on the first forward call when not supplied
///
/// # Example
///
/// ```
/// use neural_layers::layers::{BatchNorm, Layer};
/// use neural_layers::Tensor;
///
/// let mut layer = BatchNorm::new(Tensor::filled(&[2], 1.0), Tensor::zeros(&[2])).unwrap();
/// let x = Tensor::from_rows(&[[0.0, 1.0], [2.0, 3.0]]).unwrap();
/// let y = layer.forward(&x).unwrap();
///
/// assert!((y.data()[0] + 1.0).abs() < 1e-4);
/// assert!((y.data()[3] - 1.0).abs() < 1e-4);
/// assert!((layer.running_mean().unwrap().data()[0] - 0.1).abs() < 1e-6);
/// ```
#[derive(Debug, Clone)]
pub struct BatchNorm {
    momentum: f32,
    training: bool,

    gamma: Tensor,
    beta: Tensor,
    grad_gamma: Tensor,
    grad_beta: Tensor,

    running_mean: Option<Tensor>,
    running_var: Option<Tensor>,

    cache: Option<Cache>,
}

impl BatchNorm {
    /// Creates a batch normalization layer with momentum 0.9 and no running
    /// statistics.
    ///
    /// # Arguments
    ///
    /// * `gamma` - Per-feature scale, rank 1
    /// * `beta` - Per-feature shift, same shape as `gamma`
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when `gamma` is not rank 1 or `beta` differs in shape.
    pub fn new(gamma: Tensor, beta: Tensor) -> Result<Self> {
        if gamma.ndim() != 1 || gamma.is_empty() {
            return Err(shape_mismatch(format!(
                "BatchNorm gamma must be a non-empty vector, got {:?}",
                gamma.shape()
            )));
        }
        if beta.shape() != gamma.shape() {
            return Err(shape_mismatch(format!(
                "BatchNorm beta {:?} does not match gamma {:?}",
                beta.shape(),
                gamma.shape()
            )));
        }
        log::debug!("BatchNorm layer with {} features", gamma.len());

        Ok(Self {
            momentum: DEFAULT_MOMENTUM,
            training: true,
            grad_gamma: Tensor::zeros(gamma.shape()),
            grad_beta: Tensor::zeros(beta.shape()),
            gamma,
            beta,
            running_mean: None,
            running_var: None,
            cache: None,
        })
    }

    /// Creates a layer with `gamma = 1` and `beta = 0` for `features` features.
    pub fn with_features(features: usize) -> Result<Self> {
        if features == 0 {
            return Err(invalid_config("BatchNorm needs at least one feature"));
        }
        Self::new(
            Tensor::filled(&[features], 1.0),
            Tensor::zeros(&[features]),
        )
    }

    /// Replaces the moving-average momentum.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` unless `momentum` is in `[0.0, 1.0]`.
    pub fn with_momentum(mut self, momentum: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&momentum) {
            return Err(invalid_config(format!(
                "momentum must be in range [0.0, 1.0], got {}",
                momentum
            )));
        }
        self.momentum = momentum;
        Ok(self)
    }

    /// Supplies pre-existing running statistics, e.g. to resume training or
    /// for inference-only use.
    pub fn with_running_stats(mut self, mean: Tensor, var: Tensor) -> Result<Self> {
        self.set_running_stats(mean, var)?;
        Ok(self)
    }

    pub fn features(&self) -> usize {
        self.gamma.len()
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn gamma(&self) -> &Tensor {
        &self.gamma
    }

    pub fn beta(&self) -> &Tensor {
        &self.beta
    }

    /// dGamma from the most recent backward call.
    pub fn grad_gamma(&self) -> &Tensor {
        &self.grad_gamma
    }

    /// dBeta from the most recent backward call.
    pub fn grad_beta(&self) -> &Tensor {
        &self.grad_beta
    }

    pub fn set_gamma(&mut self, gamma: Tensor) -> Result<()> {
        replace_param("BatchNorm gamma", &mut self.gamma, gamma)
    }

    pub fn set_beta(&mut self, beta: Tensor) -> Result<()> {
        replace_param("BatchNorm beta", &mut self.beta, beta)
    }

    /// Running mean, `None` until supplied or until the first forward call.
    pub fn running_mean(&self) -> Option<&Tensor> {
        self.running_mean.as_ref()
    }

    /// Running variance, `None` until supplied or until the first forward call.
    pub fn running_var(&self) -> Option<&Tensor> {
        self.running_var.as_ref()
    }

    pub fn set_running_stats(&mut self, mean: Tensor, var: Tensor) -> Result<()> {
        for (what, stat) in [("mean", &mean), ("variance", &var)] {
            if stat.shape() != self.gamma.shape() {
                return Err(shape_mismatch(format!(
                    "BatchNorm running {} {:?} does not match features {:?}",
                    what,
                    stat.shape(),
                    self.gamma.shape()
                )));
            }
        }
        self.running_mean = Some(mean);
        self.running_var = Some(var);
        Ok(())
    }

    // Flatten to (N, D), checking D against the parameter length.
    fn flatten(&self, input: &Tensor) -> Result<Tensor> {
        if input.ndim() != 2 && input.ndim() != 4 {
            return Err(shape_mismatch(format!(
                "BatchNorm expects rank-2 or rank-4 input, got {:?}",
                input.shape()
            )));
        }
        let x = input.flatten_batch()?;
        if x.shape()[1] != self.features() {
            return Err(shape_mismatch(format!(
                "BatchNorm has {} features, input {:?} has {}",
                self.features(),
                input.shape(),
                x.shape()[1]
            )));
        }
        Ok(x)
    }

    fn forward_train(&mut self, x: &Tensor, input_shape: &[usize]) -> Result<Tensor> {
        let (batch_size, d) = (x.shape()[0], x.shape()[1]);
        if batch_size == 0 {
            return Err(shape_mismatch("BatchNorm received an empty batch"));
        }
        let n = batch_size as f32;

        let mut mean = vec![0.0f32; d];
        for row in x.data().chunks_exact(d) {
            for (m, &v) in mean.iter_mut().zip(row) {
                *m += v;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);

        let mut centered = x.data().to_vec();
        for row in centered.chunks_exact_mut(d) {
            for (v, &m) in row.iter_mut().zip(&mean) {
                *v -= m;
            }
        }

        let mut var = vec![0.0f32; d];
        for row in centered.chunks_exact(d) {
            for (s, &c) in var.iter_mut().zip(row) {
                *s += c * c;
            }
        }
        var.iter_mut().for_each(|s| *s /= n);

        let std: Vec<f32> = var.iter().map(|&v| (v + EPSILON).sqrt()).collect();

        let mut normalized = centered.clone();
        for row in normalized.chunks_exact_mut(d) {
            for (v, &s) in row.iter_mut().zip(&std) {
                *v /= s;
            }
        }

        let momentum = self.momentum;
        let running_mean = self
            .running_mean
            .get_or_insert_with(|| Tensor::zeros(&[d]));
        for (r, &m) in running_mean.data_mut().iter_mut().zip(&mean) {
            *r = momentum * *r + (1.0 - momentum) * m;
        }
        let running_var = self.running_var.get_or_insert_with(|| Tensor::zeros(&[d]));
        for (r, &v) in running_var.data_mut().iter_mut().zip(&var) {
            *r = momentum * *r + (1.0 - momentum) * v;
        }

        let out = self.scale_shift(&normalized, batch_size)?;
        self.cache = Some(Cache {
            centered,
            normalized,
            std,
            batch_size,
            input_shape: input_shape.to_vec(),
        });
        Ok(out)
    }

    fn forward_inference(&mut self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, d) = (x.shape()[0], x.shape()[1]);
        if self.running_mean.is_none() || self.running_var.is_none() {
            log::warn!("BatchNorm inference before any running statistics; using zeros");
        }
        let mean = self
            .running_mean
            .get_or_insert_with(|| Tensor::zeros(&[d]))
            .data();
        let var = self.running_var.get_or_insert_with(|| Tensor::zeros(&[d])).data();

        let mut normalized = x.data().to_vec();
        for row in normalized.chunks_exact_mut(d) {
            for ((v, &m), &s) in row.iter_mut().zip(mean).zip(var) {
                *v = (*v - m) / (s + EPSILON).sqrt();
            }
        }
        self.scale_shift(&normalized, batch_size)
    }

    fn scale_shift(&self, normalized: &[f32], batch_size: usize) -> Result<Tensor> {
        let d = self.features();
        let mut out = normalized.to_vec();
        for row in out.chunks_exact_mut(d) {
            for ((v, &g), &b) in row.iter_mut().zip(self.gamma.data()).zip(self.beta.data()) {
                *v = g * *v + b;
            }
        }
        Tensor::new(out, vec![batch_size, d])
    }
}

impl Layer for BatchNorm {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.cache = None;
        let x = self.flatten(input)?;
        let out = if self.training {
            self.forward_train(&x, input.shape())?
        } else {
            self.forward_inference(&x)?
        };
        log::trace!(
            "BatchNorm forward {:?} training={}",
            input.shape(),
            self.training
        );
        out.into_reshape(input.shape())
    }

    /// dBeta = Σ dOut, dGamma = Σ(x̂·dOut), then back through the
    /// normalization and centering steps.
    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let cache = self.cache.as_ref().ok_or_else(|| {
            LayerError::UninitializedState(
                "BatchNorm backward requires a preceding training-mode forward".to_string(),
            )
        })?;
        if grad_output.shape() != cache.input_shape.as_slice() {
            return Err(shape_mismatch(format!(
                "BatchNorm gradient {:?} does not match input {:?}",
                grad_output.shape(),
                cache.input_shape
            )));
        }
        let d = self.features();
        let n = cache.batch_size as f32;
        let dout = grad_output.data();

        let mut dbeta = vec![0.0f32; d];
        let mut dgamma = vec![0.0f32; d];
        for (g_row, xn_row) in dout.chunks_exact(d).zip(cache.normalized.chunks_exact(d)) {
            for j in 0..d {
                dbeta[j] += g_row[j];
                dgamma[j] += xn_row[j] * g_row[j];
            }
        }

        // dxn = gamma * dout; dxc = dxn / std
        let gamma = self.gamma.data();
        let mut dxc = vec![0.0f32; dout.len()];
        let mut dstd = vec![0.0f32; d];
        for ((dxc_row, g_row), xc_row) in dxc
            .chunks_exact_mut(d)
            .zip(dout.chunks_exact(d))
            .zip(cache.centered.chunks_exact(d))
        {
            for j in 0..d {
                let dxn = gamma[j] * g_row[j];
                dxc_row[j] = dxn / cache.std[j];
                dstd[j] -= dxn * xc_row[j] / (cache.std[j] * cache.std[j]);
            }
        }

        // dvar = 0.5 * dstd / std; dxc += (2 / N) * xc * dvar
        let dvar: Vec<f32> = dstd
            .iter()
            .zip(&cache.std)
            .map(|(&ds, &s)| 0.5 * ds / s)
            .collect();
        let mut dmu = vec![0.0f32; d];
        for (dxc_row, xc_row) in dxc.chunks_exact_mut(d).zip(cache.centered.chunks_exact(d)) {
            for j in 0..d {
                dxc_row[j] += (2.0 / n) * xc_row[j] * dvar[j];
                dmu[j] += dxc_row[j];
            }
        }

        for row in dxc.chunks_exact_mut(d) {
            for (v, &m) in row.iter_mut().zip(&dmu) {
                *v -= m / n;
            }
        }

        self.grad_gamma = Tensor::new(dgamma, vec![d])?;
        self.grad_beta = Tensor::new(dbeta, vec![d])?;
        Tensor::new(dxc, cache.input_shape.clone())
    }

    fn name(&self) -> &'static str {
        "BatchNorm"
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn parameter_count(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }

    fn params(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                name: "gamma",
                value: &mut self.gamma,
                grad: &self.grad_gamma,
            },
            Param {
                name: "beta",
                value: &mut self.beta,
                grad: &self.grad_beta,
            },
        ]
    }
}
