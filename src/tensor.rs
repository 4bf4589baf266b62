//! Dense tensor value type shared by every layer
//!
//! A `Tensor` is a flat, row-major `Vec<f32>` plus a shape. Layers exchange
//! rank-1 tensors (biases, per-feature statistics), rank-2 tensors
//! (batch × features) and rank-4 tensors (batch × channels × height × width).
//!
//! Only the handful of array operations the layers need are provided. Every
//! reshape or permutation produces a new, contiguous tensor with a checked
//! element count, so a cached tensor never aliases a caller's buffer.
//!
//! # Broadcasting
//!
//! Elementwise binary operations follow the usual right-aligned broadcasting
//! rule: two dimensions are compatible when they are equal or one of them is
//! 1. [`Tensor::sum_to_shape`] performs the reverse reduction needed when a
//! gradient has to flow back into a broadcast operand.
//!
//! # Example
//!
//! ```
//! use neural_layers::Tensor;
//!
//! let x = Tensor::from_rows(&[[1.0, 2.0], [3.0, 4.0]]).unwrap();
//! let w = Tensor::from_rows(&[[1.0, 0.0], [0.0, 1.0]]).unwrap();
//! let y = x.matmul(&w).unwrap();
//! assert_eq!(y, x);
//! ```

use crate::error::{shape_mismatch, LayerError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

// Multiply-accumulate count above which matmul splits rows across threads.
const PARALLEL_MATMUL_THRESHOLD: usize = 32_768;

/// Dense n-dimensional array of `f32` values in row-major order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
}

#[derive(Deserialize)]
struct RawTensor {
    data: Vec<f32>,
    shape: Vec<usize>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = LayerError;

    fn try_from(raw: RawTensor) -> Result<Self> {
        Tensor::new(raw.data, raw.shape)
    }
}

impl Tensor {
    /// Create a tensor from flat data and a shape.
    ///
    /// Fails with `ShapeMismatch` when the data length differs from the
    /// product of the shape dimensions.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(shape_mismatch(format!(
                "data length {} does not match shape {:?} (expected {})",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { data, shape })
    }

    /// Tensor of the given shape filled with zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::filled(shape, 0.0)
    }

    /// Tensor of the given shape filled with `value`.
    pub fn filled(shape: &[usize], value: f32) -> Self {
        let len = shape.iter().product();
        Self {
            data: vec![value; len],
            shape: shape.to_vec(),
        }
    }

    /// Rank-0 tensor holding a single value.
    pub fn scalar(value: f32) -> Self {
        Self {
            data: vec![value],
            shape: Vec::new(),
        }
    }

    /// Rank-1 tensor owning `data`.
    pub fn vector(data: Vec<f32>) -> Self {
        let len = data.len();
        Self {
            data,
            shape: vec![len],
        }
    }

    /// Rank-2 tensor built from equally sized rows.
    pub fn from_rows<R: AsRef<[f32]>>(rows: &[R]) -> Result<Self> {
        let cols = rows.first().map_or(0, |row| row.as_ref().len());
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != cols {
                return Err(shape_mismatch(format!(
                    "row {} has {} columns, expected {}",
                    i,
                    row.len(),
                    cols
                )));
            }
            data.extend_from_slice(row);
        }
        Self::new(data, vec![rows.len(), cols])
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Element at a multi-dimensional index, or `None` when out of bounds.
    pub fn get(&self, index: &[usize]) -> Option<f32> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut offset = 0;
        for (&i, &dim) in index.iter().zip(&self.shape) {
            if i >= dim {
                return None;
            }
            offset = offset * dim + i;
        }
        self.data.get(offset).copied()
    }

    /// Copy of this tensor with a new shape holding the same element count.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        self.clone().into_reshape(shape)
    }

    /// Consuming reshape that reuses the underlying buffer.
    pub fn into_reshape(self, shape: &[usize]) -> Result<Tensor> {
        let expected: usize = shape.iter().product();
        if expected != self.data.len() {
            return Err(shape_mismatch(format!(
                "cannot reshape {:?} ({} elements) into {:?}",
                self.shape,
                self.data.len(),
                shape
            )));
        }
        Ok(Tensor {
            data: self.data,
            shape: shape.to_vec(),
        })
    }

    /// Collapse every dimension after the first: `(N, ...) -> (N, rest)`.
    pub fn flatten_batch(&self) -> Result<Tensor> {
        if self.shape.is_empty() {
            return Err(shape_mismatch("cannot flatten a rank-0 tensor into a batch"));
        }
        let rest: usize = self.shape[1..].iter().product();
        self.reshape(&[self.shape[0], rest])
    }

    /// New contiguous tensor whose axis `i` is this tensor's axis `axes[i]`.
    pub fn permute(&self, axes: &[usize]) -> Result<Tensor> {
        let ndim = self.shape.len();
        let mut seen = vec![false; ndim];
        if axes.len() != ndim {
            return Err(shape_mismatch(format!(
                "permutation {:?} does not match rank of {:?}",
                axes, self.shape
            )));
        }
        for &axis in axes {
            if axis >= ndim || seen[axis] {
                return Err(shape_mismatch(format!(
                    "{:?} is not a permutation of the axes of {:?}",
                    axes, self.shape
                )));
            }
            seen[axis] = true;
        }

        let source_strides = contiguous_strides(&self.shape);
        let new_shape: Vec<usize> = axes.iter().map(|&a| self.shape[a]).collect();
        let strides: Vec<usize> = axes.iter().map(|&a| source_strides[a]).collect();

        let mut data = Vec::with_capacity(self.data.len());
        walk_broadcast(&new_shape, &strides, &vec![0; ndim], |i, _| {
            data.push(self.data[i]);
        });
        Tensor::new(data, new_shape)
    }

    /// Matrix transpose of a rank-2 tensor.
    pub fn transpose(&self) -> Result<Tensor> {
        if self.ndim() != 2 {
            return Err(shape_mismatch(format!(
                "transpose expects a rank-2 tensor, got {:?}",
                self.shape
            )));
        }
        self.permute(&[1, 0])
    }

    /// Matrix product of two rank-2 tensors.
    ///
    /// Rows of the output are computed independently; for large products they
    /// are distributed over the rayon thread pool.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        if self.ndim() != 2 || other.ndim() != 2 || self.shape[1] != other.shape[0] {
            return Err(shape_mismatch(format!(
                "matmul operands incompatible: {:?} @ {:?}",
                self.shape, other.shape
            )));
        }

        let (m, k, n) = (self.shape[0], self.shape[1], other.shape[1]);
        let mut result = vec![0.0f32; m * n];
        if n == 0 {
            return Tensor::new(result, vec![m, n]);
        }

        let lhs = &self.data;
        let rhs = &other.data;
        let row_kernel = |(i, out_row): (usize, &mut [f32])| {
            let a_row = &lhs[i * k..(i + 1) * k];
            for (l, &a) in a_row.iter().enumerate() {
                let b_row = &rhs[l * n..(l + 1) * n];
                // i-k-j order keeps the inner loop contiguous for auto-vectorization
                for (r, &b) in out_row.iter_mut().zip(b_row) {
                    *r += a * b;
                }
            }
        };

        if m * n * k >= PARALLEL_MATMUL_THRESHOLD {
            result.par_chunks_mut(n).enumerate().for_each(row_kernel);
        } else {
            result.chunks_mut(n).enumerate().for_each(row_kernel);
        }

        Tensor::new(result, vec![m, n])
    }

    /// Sum over the first axis: `(N, ...) -> (...)`.
    pub fn sum_axis0(&self) -> Result<Tensor> {
        if self.shape.is_empty() {
            return Err(shape_mismatch("sum_axis0 expects at least one axis"));
        }
        let rest_shape = &self.shape[1..];
        let rest: usize = rest_shape.iter().product();
        let mut sums = vec![0.0f32; rest];
        if rest > 0 {
            for row in self.data.chunks_exact(rest) {
                for (sum, &value) in sums.iter_mut().zip(row) {
                    *sum += value;
                }
            }
        }
        Tensor::new(sums, rest_shape.to_vec())
    }

    /// Sum of all elements.
    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    /// Apply `f` to every element.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            data: self.data.iter().map(|&v| f(v)).collect(),
            shape: self.shape.clone(),
        }
    }

    /// Combine two tensors of identical shape elementwise.
    pub fn zip_map(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
        if self.shape != other.shape {
            return Err(shape_mismatch(format!(
                "elementwise operands differ: {:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        Ok(Tensor {
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
            shape: self.shape.clone(),
        })
    }

    /// Combine two broadcast-compatible tensors elementwise.
    pub fn broadcast_zip(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
        if self.shape == other.shape {
            return self.zip_map(other, f);
        }
        let out_shape = broadcast_shape(&self.shape, &other.shape)?;
        let lhs_strides = broadcast_strides(&self.shape, &out_shape);
        let rhs_strides = broadcast_strides(&other.shape, &out_shape);

        let mut data = Vec::with_capacity(out_shape.iter().product());
        walk_broadcast(&out_shape, &lhs_strides, &rhs_strides, |i, j| {
            data.push(f(self.data[i], other.data[j]));
        });
        Tensor::new(data, out_shape)
    }

    /// Reduce a broadcast result back to `shape` by summing the expanded axes.
    ///
    /// `shape` must broadcast to this tensor's shape.
    pub fn sum_to_shape(&self, shape: &[usize]) -> Result<Tensor> {
        if shape == self.shape.as_slice() {
            return Ok(self.clone());
        }
        if broadcast_shape(shape, &self.shape)? != self.shape {
            return Err(shape_mismatch(format!(
                "{:?} does not broadcast to {:?}",
                shape, self.shape
            )));
        }
        let target_strides = broadcast_strides(shape, &self.shape);
        let own_strides = contiguous_strides(&self.shape);

        let mut reduced = Tensor::zeros(shape);
        walk_broadcast(&self.shape, &target_strides, &own_strides, |t, s| {
            reduced.data[t] += self.data[s];
        });
        Ok(reduced)
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.broadcast_zip(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.broadcast_zip(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.broadcast_zip(other, |a, b| a * b)
    }

    /// Multiply every element by `factor`.
    pub fn scale(&self, factor: f32) -> Tensor {
        self.map(|v| v * factor)
    }
}

/// Shape produced by broadcasting `a` against `b`.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let mut shape = vec![0; ndim];
    for axis in 0..ndim {
        let da = axis
            .checked_sub(ndim - a.len())
            .map_or(1, |i| a[i]);
        let db = axis
            .checked_sub(ndim - b.len())
            .map_or(1, |i| b[i]);
        shape[axis] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(shape_mismatch(format!(
                    "shapes {:?} and {:?} are not broadcast-compatible",
                    a, b
                )))
            }
        };
    }
    Ok(shape)
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

// Strides of `shape` viewed inside the broadcast shape `out`; expanded axes get stride 0.
fn broadcast_strides(shape: &[usize], out: &[usize]) -> Vec<usize> {
    let own = contiguous_strides(shape);
    let offset = out.len() - shape.len();
    (0..out.len())
        .map(|axis| match axis.checked_sub(offset) {
            Some(i) if shape[i] != 1 => own[i],
            _ => 0,
        })
        .collect()
}

// Visit every index of `shape` in row-major order, reporting the flat offsets
// into two operands described by their (possibly zero) strides.
fn walk_broadcast(
    shape: &[usize],
    strides_a: &[usize],
    strides_b: &[usize],
    mut visit: impl FnMut(usize, usize),
) {
    let total: usize = shape.iter().product();
    let mut index = vec![0usize; shape.len()];
    let (mut a, mut b) = (0usize, 0usize);
    for _ in 0..total {
        visit(a, b);
        for axis in (0..shape.len()).rev() {
            index[axis] += 1;
            a += strides_a[axis];
            b += strides_b[axis];
            if index[axis] < shape[axis] {
                break;
            }
            a -= strides_a[axis] * shape[axis];
            b -= strides_b[axis] * shape[axis];
            index[axis] = 0;
        }
    }
}
