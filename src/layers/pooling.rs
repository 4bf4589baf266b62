//! Max pooling layer
//!
//! Windows are unrolled with [`im2col`] and then regrouped so that every row
//! holds a single channel's window; the row maximum is the pooled value and
//! its position is remembered so backward can route the gradient.

use crate::error::{invalid_config, shape_mismatch, LayerError, Result};
use crate::layers::Layer;
use crate::tensor::Tensor;
use crate::utils::im2col::{col2im, conv_output_size, im2col};

// State from the last forward pass.
#[derive(Debug, Clone)]
struct Cache {
    input_shape: Vec<usize>,
    arg_max: Vec<usize>,
    out_h: usize,
    out_w: usize,
}

/// Max pooling over `pool_h × pool_w` windows.
///
/// Output size follows the same padded formula as convolution. Padding
/// contributes zeros, so a window lying entirely in negative values next to
/// the border may select a padded position; its gradient is discarded.
/// Ties select the first window position.
///
/// # Example
///
/// ```
/// use neural_layers::layers::{Layer, Pooling};
/// use neural_layers::Tensor;
///
/// let mut pool = Pooling::new(2, 2, 2, 0).unwrap();
/// let x = Tensor::new((1..=16).map(|v| v as f32).collect(), vec![1, 1, 4, 4]).unwrap();
/// let y = pool.forward(&x).unwrap();
/// assert_eq!(y.data(), &[6.0, 8.0, 14.0, 16.0]);
/// ```
#[derive(Debug, Clone)]
pub struct Pooling {
    pool_h: usize,
    pool_w: usize,
    stride: usize,
    pad: usize,
    cache: Option<Cache>,
}

impl Pooling {
    /// # Errors
    ///
    /// `InvalidConfiguration` when a pool dimension or the stride is zero.
    pub fn new(pool_h: usize, pool_w: usize, stride: usize, pad: usize) -> Result<Self> {
        if pool_h == 0 || pool_w == 0 {
            return Err(invalid_config(format!(
                "pool size must be greater than 0, got {}x{}",
                pool_h, pool_w
            )));
        }
        if stride == 0 {
            return Err(invalid_config("Pooling stride must be greater than 0"));
        }
        log::debug!(
            "Pooling layer {}x{} stride={} pad={}",
            pool_h,
            pool_w,
            stride,
            pad
        );
        Ok(Self {
            pool_h,
            pool_w,
            stride,
            pad,
            cache: None,
        })
    }

    /// `(pool_h, pool_w)`.
    pub fn pool_size(&self) -> (usize, usize) {
        (self.pool_h, self.pool_w)
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn pad(&self) -> usize {
        self.pad
    }

    /// Output spatial size for an input of `height × width`.
    pub fn output_size(&self, height: usize, width: usize) -> Result<(usize, usize)> {
        Ok((
            conv_output_size(height, self.pool_h, self.stride, self.pad)?,
            conv_output_size(width, self.pool_w, self.stride, self.pad)?,
        ))
    }

    /// Window index of the maximum for every pooled value of the last forward
    /// call, in `(N, OH, OW, C)` order.
    pub fn arg_max(&self) -> Option<&[usize]> {
        self.cache.as_ref().map(|c| c.arg_max.as_slice())
    }
}

impl Layer for Pooling {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.cache = None;
        if input.ndim() != 4 {
            return Err(shape_mismatch(format!(
                "Pooling expects (N, C, H, W) input, got {:?}",
                input.shape()
            )));
        }
        let (batch, channels) = (input.shape()[0], input.shape()[1]);
        let (out_h, out_w) = self.output_size(input.shape()[2], input.shape()[3])?;
        let window = self.pool_h * self.pool_w;

        // (N·OH·OW, C·PH·PW) rows are already C consecutive windows
        let col = im2col(input, self.pool_h, self.pool_w, self.stride, self.pad)?;

        let mut arg_max = Vec::with_capacity(col.len() / window);
        let mut pooled = Vec::with_capacity(col.len() / window);
        for row in col.data().chunks_exact(window) {
            let (idx, max) = row
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                });
            arg_max.push(idx);
            pooled.push(max);
        }

        let out = Tensor::new(pooled, vec![batch, out_h, out_w, channels])?.permute(&[0, 3, 1, 2])?;
        log::trace!("Pooling forward {:?} -> {:?}", input.shape(), out.shape());

        self.cache = Some(Cache {
            input_shape: input.shape().to_vec(),
            arg_max,
            out_h,
            out_w,
        });
        Ok(out)
    }

    /// Routes each output gradient to the arg-max position of its window.
    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let cache = self.cache.as_ref().ok_or_else(|| {
            LayerError::UninitializedState("Pooling backward called before forward".to_string())
        })?;
        let (batch, channels) = (cache.input_shape[0], cache.input_shape[1]);
        let expected = [batch, channels, cache.out_h, cache.out_w];
        if grad_output.shape() != expected {
            return Err(shape_mismatch(format!(
                "Pooling gradient {:?} does not match output {:?}",
                grad_output.shape(),
                expected
            )));
        }

        let window = self.pool_h * self.pool_w;
        let dout = grad_output.permute(&[0, 2, 3, 1])?;
        let mut dmax = vec![0.0f32; dout.len() * window];
        for ((slot, &g), &idx) in dmax
            .chunks_exact_mut(window)
            .zip(dout.data())
            .zip(&cache.arg_max)
        {
            slot[idx] = g;
        }

        let dcol = Tensor::new(dmax, vec![batch * cache.out_h * cache.out_w, channels * window])?;
        col2im(
            &dcol,
            &cache.input_shape,
            self.pool_h,
            self.pool_w,
            self.stride,
            self.pad,
        )
    }

    fn name(&self) -> &'static str {
        "Pooling"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_configuration() {
        assert!(matches!(
            Pooling::new(0, 2, 2, 0),
            Err(LayerError::InvalidConfiguration(_))
        ));
        assert!(Pooling::new(2, 2, 0, 0).is_err());
    }

    #[test]
    fn test_forward_two_channels() {
        let mut pool = Pooling::new(2, 2, 2, 0).unwrap();
        let mut data: Vec<f32> = (1..=16).map(|v| v as f32).collect();
        data.extend((1..=16).map(|v| -(v as f32)));
        let x = Tensor::new(data, vec![1, 2, 4, 4]).unwrap();

        let y = pool.forward(&x).unwrap();
        assert_eq!(y.shape(), &[1, 2, 2, 2]);
        assert_eq!(y.data(), &[6.0, 8.0, 14.0, 16.0, -1.0, -3.0, -9.0, -11.0]);
    }

    #[test]
    fn test_backward_routes_to_arg_max() {
        let mut pool = Pooling::new(2, 2, 2, 0).unwrap();
        let x = Tensor::new(vec![1.0, 3.0, 2.0, 0.0], vec![1, 1, 2, 2]).unwrap();
        pool.forward(&x).unwrap();
        assert_eq!(pool.arg_max().unwrap(), &[1]);

        let dx = pool.backward(&Tensor::filled(&[1, 1, 1, 1], 5.0)).unwrap();
        assert_eq!(dx.data(), &[0.0, 5.0, 0.0, 0.0]);
    }

    #[test]
    fn test_ties_pick_first_position() {
        let mut pool = Pooling::new(2, 2, 2, 0).unwrap();
        pool.forward(&Tensor::filled(&[1, 1, 2, 2], 7.0)).unwrap();
        let dx = pool.backward(&Tensor::filled(&[1, 1, 1, 1], 1.0)).unwrap();
        assert_eq!(dx.data(), &[1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_overlapping_windows_accumulate() {
        let mut pool = Pooling::new(2, 2, 1, 0).unwrap();
        // center element is the maximum of all four windows
        let mut data = vec![0.0f32; 9];
        data[4] = 10.0;
        pool.forward(&Tensor::new(data, vec![1, 1, 3, 3]).unwrap()).unwrap();

        let dx = pool.backward(&Tensor::filled(&[1, 1, 2, 2], 1.0)).unwrap();
        assert_eq!(dx.data()[4], 4.0);
        assert_eq!(dx.sum(), 4.0);
    }

    #[test]
    fn test_padded_output_size() {
        let mut pool = Pooling::new(2, 2, 2, 1).unwrap();
        let y = pool.forward(&Tensor::filled(&[1, 1, 4, 4], 1.0)).unwrap();
        assert_eq!(y.shape(), &[1, 1, 3, 3]);
    }

    #[test]
    fn test_overflowing_padding_is_an_error() {
        let mut pool = Pooling::new(2, 2, 1, usize::MAX).unwrap();
        assert!(matches!(
            pool.forward(&Tensor::zeros(&[1, 1, 4, 4])),
            Err(LayerError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_backward_shape_checked() {
        let mut pool = Pooling::new(2, 2, 2, 0).unwrap();
        assert!(matches!(
            pool.backward(&Tensor::zeros(&[1, 1, 1, 1])),
            Err(LayerError::UninitializedState(_))
        ));
        pool.forward(&Tensor::zeros(&[1, 1, 4, 4])).unwrap();
        assert!(matches!(
            pool.backward(&Tensor::zeros(&[1, 1, 4, 4])),
            Err(LayerError::ShapeMismatch(_))
        ));
    }
}
