//! Sliding-window unrolling for convolution and pooling
//!
//! `im2col` turns every receptive field of a zero-padded `(N, C, H, W)` input
//! into one row of a matrix so a convolution becomes a single matrix product.
//! `col2im` is its adjoint: it scatters a column matrix back into image
//! layout, summing the contributions of overlapping windows.
//!
//! Column layout: row `(n * out_h + oh) * out_w + ow` holds the window at
//! output position `(oh, ow)` of sample `n`; column `(c * filter_h + kh) *
//! filter_w + kw` holds input channel `c` at kernel offset `(kh, kw)`.
//!
//! Both transforms work one sample at a time, so samples are processed in
//! parallel with rayon.

use crate::error::{invalid_config, shape_mismatch, Result};
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Output length of a sliding window along one spatial axis:
/// `1 + (input + 2 * pad - filter) / stride`.
///
/// # Errors
///
/// - `InvalidConfiguration` when `stride` or `filter` is zero, or the padded
///   size does not fit in `usize`
/// - `ShapeMismatch` when the filter does not fit inside the padded input
pub fn conv_output_size(input: usize, filter: usize, stride: usize, pad: usize) -> Result<usize> {
    if stride == 0 {
        return Err(invalid_config("stride must be greater than 0"));
    }
    if filter == 0 {
        return Err(invalid_config("filter size must be greater than 0"));
    }
    let padded = pad
        .checked_mul(2)
        .and_then(|both| both.checked_add(input))
        .ok_or_else(|| invalid_config(format!("padding {} overflows input size {}", pad, input)))?;
    if filter > padded {
        return Err(shape_mismatch(format!(
            "filter size {} exceeds padded input size {}",
            filter, padded
        )));
    }
    Ok(1 + (padded - filter) / stride)
}

#[derive(Clone, Copy)]
struct Geometry {
    channels: usize,
    height: usize,
    width: usize,
    filter_h: usize,
    filter_w: usize,
    stride: usize,
    pad: usize,
    out_h: usize,
    out_w: usize,
}

impl Geometry {
    fn new(
        input_shape: &[usize],
        filter_h: usize,
        filter_w: usize,
        stride: usize,
        pad: usize,
    ) -> Result<(usize, Self)> {
        if input_shape.len() != 4 {
            return Err(shape_mismatch(format!(
                "expected a (N, C, H, W) input, got {:?}",
                input_shape
            )));
        }
        let (batch, channels, height, width) =
            (input_shape[0], input_shape[1], input_shape[2], input_shape[3]);
        let out_h = conv_output_size(height, filter_h, stride, pad)?;
        let out_w = conv_output_size(width, filter_w, stride, pad)?;
        [batch, out_h, out_w, channels, filter_h, filter_w]
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| {
                invalid_config(format!(
                    "column matrix for input {:?} with {}x{} windows is too large",
                    input_shape, filter_h, filter_w
                ))
            })?;
        Ok((
            batch,
            Self {
                channels,
                height,
                width,
                filter_h,
                filter_w,
                stride,
                pad,
                out_h,
                out_w,
            },
        ))
    }

    fn window_len(&self) -> usize {
        self.channels * self.filter_h * self.filter_w
    }

    fn image_len(&self) -> usize {
        self.channels * self.height * self.width
    }

    // Unpadded input coordinate for a window element, or None inside the padding.
    fn source(&self, out: usize, k: usize, limit: usize) -> Option<usize> {
        (out * self.stride + k)
            .checked_sub(self.pad)
            .filter(|&pos| pos < limit)
    }

    fn for_each_tap(&self, mut visit: impl FnMut(usize, usize)) {
        let window = self.window_len();
        for oh in 0..self.out_h {
            for ow in 0..self.out_w {
                let row = (oh * self.out_w + ow) * window;
                for c in 0..self.channels {
                    for kh in 0..self.filter_h {
                        let Some(ih) = self.source(oh, kh, self.height) else {
                            continue;
                        };
                        for kw in 0..self.filter_w {
                            let Some(iw) = self.source(ow, kw, self.width) else {
                                continue;
                            };
                            let col = (c * self.filter_h + kh) * self.filter_w + kw;
                            let pixel = (c * self.height + ih) * self.width + iw;
                            visit(row + col, pixel);
                        }
                    }
                }
            }
        }
    }
}

/// Unroll every filter-sized window of a `(N, C, H, W)` input into the rows of
/// a `(N * out_h * out_w, C * filter_h * filter_w)` matrix.
///
/// Windows overlapping the zero padding read zeros.
pub fn im2col(
    input: &Tensor,
    filter_h: usize,
    filter_w: usize,
    stride: usize,
    pad: usize,
) -> Result<Tensor> {
    let (batch, geometry) = Geometry::new(input.shape(), filter_h, filter_w, stride, pad)?;
    let rows_per_sample = geometry.out_h * geometry.out_w;
    let window = geometry.window_len();
    let sample_cols = rows_per_sample * window;

    let mut col = vec![0.0f32; batch * sample_cols];
    if sample_cols > 0 && geometry.image_len() > 0 {
        let source = input.data();
        col.par_chunks_mut(sample_cols)
            .zip(source.par_chunks(geometry.image_len()))
            .for_each(|(cols, image)| {
                geometry.for_each_tap(|dst, src| cols[dst] = image[src]);
            });
    }

    log::trace!(
        "im2col {:?} -> [{}, {}]",
        input.shape(),
        batch * rows_per_sample,
        window
    );
    Tensor::new(col, vec![batch * rows_per_sample, window])
}

/// Scatter a column matrix back into a zero-initialized `input_shape` tensor.
///
/// Overlapping windows accumulate, and contributions that fall into the
/// padding are dropped.
pub fn col2im(
    col: &Tensor,
    input_shape: &[usize],
    filter_h: usize,
    filter_w: usize,
    stride: usize,
    pad: usize,
) -> Result<Tensor> {
    let (batch, geometry) = Geometry::new(input_shape, filter_h, filter_w, stride, pad)?;
    let rows_per_sample = geometry.out_h * geometry.out_w;
    let window = geometry.window_len();
    let expected = [batch * rows_per_sample, window];
    if col.shape() != expected {
        return Err(shape_mismatch(format!(
            "col2im expects columns {:?} for input {:?}, got {:?}",
            expected,
            input_shape,
            col.shape()
        )));
    }

    let image_len = geometry.image_len();
    let sample_cols = rows_per_sample * window;
    let mut image = vec![0.0f32; batch * image_len];
    if sample_cols > 0 && image_len > 0 {
        image
            .par_chunks_mut(image_len)
            .zip(col.data().par_chunks(sample_cols))
            .for_each(|(pixels, cols)| {
                geometry.for_each_tap(|src, dst| pixels[dst] += cols[src]);
            });
    }

    Tensor::new(image, input_shape.to_vec())
}
