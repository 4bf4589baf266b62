//! Dropout layer implementation for regularization
//!
//! This module provides a Dropout layer that randomly drops (sets to zero) a
//! fraction of input units during training. Surviving units are not rescaled;
//! instead, inference multiplies every unit by the keep probability `1 - p`
//! so that expected activations match between the two modes.

use crate::error::{invalid_config, shape_mismatch, LayerError, Result};
use crate::layers::Layer;
use crate::tensor::Tensor;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Drop probability used by [`Dropout::default`].
pub const DEFAULT_DROP_RATE: f32 = 0.5;

/// Dropout layer for regularization.
///
/// In training mode every forward call draws a fresh mask (keep where
/// `uniform[0, 1) > drop_rate`) and caches it for the paired backward call.
/// In inference mode the output is `input * (1 - drop_rate)` and no mask is
/// kept, so a backward call after an inference forward fails with
/// `UninitializedState`.
///
/// # Fields
///
/// * `drop_rate` - Probability of dropping each unit, in `[0.0, 1.0)`
/// * `training` - Whether the layer is in training mode
/// * `mask` - Units kept by the last training-mode forward pass
/// * `rng` - Per-layer generator for mask sampling
///
/// # Example
///
/// ```
/// use neural_layers::layers::{Dropout, Layer};
/// use neural_layers::Tensor;
///
/// let mut layer = Dropout::with_seed(0.5, 42).unwrap();
/// let x = Tensor::filled(&[2, 4], 1.0);
///
/// let y = layer.forward(&x).unwrap();
/// let dx = layer.backward(&Tensor::filled(&[2, 4], 1.0)).unwrap();
/// assert_eq!(y, dx);
///
/// layer.set_training(false);
/// let y = layer.forward(&x).unwrap();
/// assert!(y.data().iter().all(|&v| v == 0.5));
/// ```
#[derive(Debug, Clone)]
pub struct Dropout {
    drop_rate: f32,
    training: bool,
    mask: Option<Vec<bool>>,
    shape: Vec<usize>,
    rng: ChaCha8Rng,
}

impl Dropout {
    /// Creates a dropout layer whose masks are seeded from system entropy.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` unless `drop_rate` is in `[0.0, 1.0)`.
    pub fn new(drop_rate: f32) -> Result<Self> {
        Self::with_rng(drop_rate, ChaCha8Rng::from_entropy())
    }

    /// Creates a dropout layer with a reproducible mask sequence.
    ///
    /// Two layers built with the same seed produce identical masks for the
    /// same sequence of forward calls.
    ///
    /// # Examples
    ///
    /// ```
    /// use neural_layers::layers::{Dropout, Layer};
    /// use neural_layers::Tensor;
    ///
    /// let x = Tensor::filled(&[1, 16], 1.0);
    /// let mut a = Dropout::with_seed(0.3, 7).unwrap();
    /// let mut b = Dropout::with_seed(0.3, 7).unwrap();
    /// assert_eq!(a.forward(&x).unwrap(), b.forward(&x).unwrap());
    /// ```
    pub fn with_seed(drop_rate: f32, seed: u64) -> Result<Self> {
        Self::with_rng(drop_rate, ChaCha8Rng::seed_from_u64(seed))
    }

    fn with_rng(drop_rate: f32, rng: ChaCha8Rng) -> Result<Self> {
        if !(0.0..1.0).contains(&drop_rate) {
            return Err(invalid_config(format!(
                "drop_rate must be in range [0.0, 1.0), got {}",
                drop_rate
            )));
        }
        log::debug!("Dropout layer p={}", drop_rate);

        Ok(Self {
            drop_rate,
            training: true,
            mask: None,
            shape: Vec::new(),
            rng,
        })
    }

    pub fn drop_rate(&self) -> f32 {
        self.drop_rate
    }

    /// Mask from the last training-mode forward pass (`true` = kept).
    pub fn mask(&self) -> Option<&[bool]> {
        self.mask.as_deref()
    }
}

impl Default for Dropout {
    fn default() -> Self {
        Self {
            drop_rate: DEFAULT_DROP_RATE,
            training: true,
            mask: None,
            shape: Vec::new(),
            rng: ChaCha8Rng::from_entropy(),
        }
    }
}

impl Layer for Dropout {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        if !self.training {
            self.mask = None;
            let keep = 1.0 - self.drop_rate;
            return Ok(input.map(|v| v * keep));
        }

        let drop_rate = self.drop_rate;
        let rng = &mut self.rng;
        let mask: Vec<bool> = (0..input.len())
            .map(|_| rng.gen::<f32>() > drop_rate)
            .collect();

        let mut out = input.clone();
        for (v, &keep) in out.data_mut().iter_mut().zip(&mask) {
            if !keep {
                *v = 0.0;
            }
        }
        log::trace!(
            "Dropout forward kept {}/{}",
            mask.iter().filter(|&&k| k).count(),
            mask.len()
        );

        self.mask = Some(mask);
        self.shape = input.shape().to_vec();
        Ok(out)
    }

    /// Applies the mask cached by the paired training-mode forward call.
    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let mask = self.mask.as_ref().ok_or_else(|| {
            LayerError::UninitializedState(
                "Dropout backward requires a preceding training-mode forward".to_string(),
            )
        })?;
        if grad_output.shape() != self.shape.as_slice() {
            return Err(shape_mismatch(format!(
                "Dropout gradient {:?} does not match mask shape {:?}",
                grad_output.shape(),
                self.shape
            )));
        }

        let mut grad_input = grad_output.clone();
        for (g, &keep) in grad_input.data_mut().iter_mut().zip(mask) {
            if !keep {
                *g = 0.0;
            }
        }
        Ok(grad_input)
    }

    fn name(&self) -> &'static str {
        "Dropout"
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}
