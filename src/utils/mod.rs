//! Shared numeric kernels used by several layers
//!
//! - `activations`: sigmoid, numerically stable softmax, cross-entropy
//! - `im2col`: sliding-window unrolling shared by convolution and pooling

pub mod activations;
pub mod im2col;

pub use im2col::{col2im, conv_output_size, im2col};
