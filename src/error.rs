//! Error types for layer computations and architecture configuration
//!
//! Every failure a layer can hit is detected synchronously and returned to the
//! caller. Numeric edge cases (log of zero, division by a zero variance) are
//! guarded with fixed epsilons instead and never produce an error.

use std::io;

/// Errors raised by tensors, spatial transforms, and layers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LayerError {
    /// Operand shapes are incompatible with the requested operation.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Backward was called without a matching forward call.
    #[error("uninitialized state: {0}")]
    UninitializedState(String),

    /// A hyperparameter is outside its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LayerError>;

/// Errors raised while loading, validating, or building an architecture.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read architecture file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse architecture JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid architecture: {0}")]
    Invalid(String),

    #[error("failed to construct layer: {0}")]
    Layer(#[from] LayerError),
}

pub(crate) fn shape_mismatch(message: impl Into<String>) -> LayerError {
    LayerError::ShapeMismatch(message.into())
}

pub(crate) fn invalid_config(message: impl Into<String>) -> LayerError {
    LayerError::InvalidConfiguration(message.into())
}
