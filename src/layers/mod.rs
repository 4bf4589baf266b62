//! Layer abstractions for neural networks
//!
//! This module provides the Layer trait and one implementation per layer kind.
//! Every layer caches what its backward pass needs during forward, so each
//! instance supports one forward/backward pair at a time.

mod r#trait;
pub mod activation;
pub mod affine;
pub mod arithmetic;
pub mod batchnorm;
pub mod convolution;
pub mod dropout;
pub mod pooling;
pub mod softmax_loss;

pub use activation::{Relu, Sigmoid};
pub use affine::Affine;
pub use arithmetic::{Add, Multiply};
pub use batchnorm::BatchNorm;
pub use convolution::Convolution;
pub use dropout::Dropout;
pub use pooling::Pooling;
pub use r#trait::{BinaryLayer, Layer, Param};
pub use softmax_loss::{SoftmaxWithLoss, Target};
