//! Neural network layer primitives with manual forward and backward passes
//!
//! Every layer is a self-contained unit: forward computes an output and caches
//! what backward needs, backward turns the gradient of the loss with respect to
//! the output into the gradient with respect to the input and stores parameter
//! gradients for an external optimizer. There is no computation graph.
//!
//! # Modules
//!
//! - `tensor`: dense row-major `f32` arrays
//! - `layers`: Layer trait and implementations (Affine, Convolution, BatchNorm, etc.)
//! - `utils`: activation kernels and im2col/col2im
//! - `architecture`: JSON architecture configuration and layer-stack building
//! - `error`: error types shared by the crate

pub mod architecture;
pub mod error;
pub mod layers;
pub mod tensor;
pub mod utils;

pub use error::{ConfigError, LayerError, Result};
pub use tensor::Tensor;
