//! Architecture configuration structures
//!
//! This module describes a stack of layers in JSON, validates it, and builds the
//! corresponding `Vec<Box<dyn Layer>>` with reproducibly initialized
//! parameters. Running the stack (ordering forward and backward calls) stays
//! with the caller.

use crate::error::ConfigError;
use crate::layers::batchnorm::DEFAULT_MOMENTUM;
use crate::layers::dropout::DEFAULT_DROP_RATE;
use crate::layers::{Affine, BatchNorm, Convolution, Dropout, Layer, Pooling, Relu, Sigmoid};
use crate::utils::im2col::conv_output_size;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Seed used when the configuration does not name one.
pub const DEFAULT_SEED: u64 = 42;

/// Configuration for a single layer.
///
/// Different layer types use different fields:
///
/// - **affine**: `input_size`, `output_size`
/// - **convolution**: `in_channels`, `out_channels`, `kernel_size`, optional
///   `stride` (default 1), `padding` (default 0) and `input_height` /
///   `input_width` (used for size checks when the input is not otherwise known)
/// - **pooling**: `pool_size`, optional `stride` (default 1), `padding` (default 0)
/// - **batchnorm**: `size`, optional `momentum` (default 0.9)
/// - **dropout**: optional `drop_rate` (default 0.5), optional `size`
/// - **relu**, **sigmoid**: no fields
///
/// # Examples
///
/// ```json
/// {
///   "layer_type": "convolution",
///   "in_channels": 1,
///   "out_channels": 8,
///   "kernel_size": 3,
///   "padding": 1,
///   "input_height": 28,
///   "input_width": 28
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Type of layer (case-insensitive)
    pub layer_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_channels: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_channels: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_height: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_width: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,
    /// Window stride for convolution and pooling (default: 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stride: Option<usize>,
    /// Zero-padding for convolution and pooling (default: 0). Signed so that
    /// negative values are reported instead of failing to parse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding: Option<isize>,

    /// Number of features for BatchNorm (and optionally Dropout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub momentum: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_rate: Option<f32>,
}

impl LayerConfig {
    /// A config of the given type with every optional field unset.
    pub fn of_type(layer_type: &str) -> Self {
        Self {
            layer_type: layer_type.to_string(),
            ..Self::default()
        }
    }
}

/// Configuration for a whole layer stack.
///
/// # Example
///
/// ```json
/// {
///   "seed": 7,
///   "layers": [
///     { "layer_type": "affine", "input_size": 784, "output_size": 256 },
///     { "layer_type": "batchnorm", "size": 256, "momentum": 0.9 },
///     { "layer_type": "relu" },
///     { "layer_type": "dropout", "drop_rate": 0.2 },
///     { "layer_type": "affine", "input_size": 256, "output_size": 10 }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    /// Layers in forward order
    pub layers: Vec<LayerConfig>,
    /// Seed for weight initialization and dropout masks (default: 42)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Loads and validates an architecture configuration from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use neural_layers::architecture::load_architecture;
///
/// let arch = load_architecture("architectures/mlp.json").unwrap();
/// assert!(!arch.layers.is_empty());
/// ```
pub fn load_architecture<P: AsRef<Path>>(path: P) -> Result<ArchitectureConfig, ConfigError> {
    let contents = fs::read_to_string(path.as_ref())?;
    let config = parse_architecture(&contents)?;
    log::debug!(
        "Loaded architecture with {} layers from {}",
        config.layers.len(),
        path.as_ref().display()
    );
    Ok(config)
}

/// Parses and validates an architecture configuration from a JSON string.
pub fn parse_architecture(json: &str) -> Result<ArchitectureConfig, ConfigError> {
    let config: ArchitectureConfig = serde_json::from_str(json)?;
    validate_architecture(&config)?;
    Ok(config)
}

// Activation shape flowing between layers, as far as it is known.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Extent {
    Flat(usize),
    Spatial {
        channels: usize,
        height: usize,
        width: usize,
    },
}

impl Extent {
    fn features(self) -> usize {
        match self {
            Extent::Flat(n) => n,
            Extent::Spatial {
                channels,
                height,
                width,
            } => channels * height * width,
        }
    }
}

fn invalid(index: usize, message: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid(format!("Layer {}: {}", index, message))
}

fn require<T: Copy>(
    value: Option<T>,
    index: usize,
    kind: &str,
    field: &str,
) -> Result<T, ConfigError> {
    value.ok_or_else(|| invalid(index, format!("{} layer requires '{}'", kind, field)))
}

fn positive(value: usize, index: usize, field: &str) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(invalid(index, format!("{} must be greater than 0", field)));
    }
    Ok(value)
}

fn required_size(
    value: Option<usize>,
    index: usize,
    kind: &str,
    field: &str,
) -> Result<usize, ConfigError> {
    positive(require(value, index, kind, field)?, index, field)
}

fn padding(layer: &LayerConfig, index: usize) -> Result<usize, ConfigError> {
    let pad = layer.padding.unwrap_or(0);
    usize::try_from(pad)
        .map_err(|_| invalid(index, format!("padding must be non-negative, got {}", pad)))
}

fn stride(layer: &LayerConfig, index: usize) -> Result<usize, ConfigError> {
    positive(layer.stride.unwrap_or(1), index, "stride")
}

fn check_features(
    incoming: Option<Extent>,
    expected: usize,
    index: usize,
    field: &str,
) -> Result<(), ConfigError> {
    match incoming {
        Some(extent) if extent.features() != expected => Err(invalid(
            index,
            format!(
                "{} ({}) does not match the previous layer's output size ({})",
                field,
                expected,
                extent.features()
            ),
        )),
        _ => Ok(()),
    }
}

// Validate one layer and return the extent it produces.
fn validate_layer(
    layer: &LayerConfig,
    index: usize,
    incoming: Option<Extent>,
) -> Result<Option<Extent>, ConfigError> {
    match layer.layer_type.to_lowercase().as_str() {
        "affine" => {
            let input_size = required_size(layer.input_size, index, "Affine", "input_size")?;
            let output_size = required_size(layer.output_size, index, "Affine", "output_size")?;
            check_features(incoming, input_size, index, "input_size")?;
            Ok(Some(Extent::Flat(output_size)))
        }
        "convolution" => {
            let in_channels = required_size(layer.in_channels, index, "Convolution", "in_channels")?;
            let out_channels = required_size(layer.out_channels, index, "Convolution", "out_channels")?;
            let kernel = required_size(layer.kernel_size, index, "Convolution", "kernel_size")?;
            let stride = stride(layer, index)?;
            let pad = padding(layer, index)?;

            let spatial = match (incoming, layer.input_height, layer.input_width) {
                (
                    Some(Extent::Spatial {
                        channels,
                        height,
                        width,
                    }),
                    _,
                    _,
                ) => {
                    if channels != in_channels {
                        return Err(invalid(
                            index,
                            format!(
                                "in_channels ({}) does not match incoming channels ({})",
                                in_channels, channels
                            ),
                        ));
                    }
                    Some((height, width))
                }
                (incoming, Some(height), Some(width)) => {
                    check_features(incoming, in_channels * height * width, index, "input volume")?;
                    Some((height, width))
                }
                _ => None,
            };

            match spatial {
                Some((height, width)) => {
                    let out_h = conv_output_size(height, kernel, stride, pad)
                        .map_err(|e| invalid(index, e))?;
                    let out_w = conv_output_size(width, kernel, stride, pad)
                        .map_err(|e| invalid(index, e))?;
                    Ok(Some(Extent::Spatial {
                        channels: out_channels,
                        height: out_h,
                        width: out_w,
                    }))
                }
                None => Ok(None),
            }
        }
        "pooling" => {
            let pool = required_size(layer.pool_size, index, "Pooling", "pool_size")?;
            let stride = stride(layer, index)?;
            let pad = padding(layer, index)?;
            match incoming {
                Some(Extent::Spatial {
                    channels,
                    height,
                    width,
                }) => {
                    let out_h = conv_output_size(height, pool, stride, pad)
                        .map_err(|e| invalid(index, e))?;
                    let out_w = conv_output_size(width, pool, stride, pad)
                        .map_err(|e| invalid(index, e))?;
                    Ok(Some(Extent::Spatial {
                        channels,
                        height: out_h,
                        width: out_w,
                    }))
                }
                Some(Extent::Flat(_)) => Err(invalid(
                    index,
                    "Pooling needs a spatial (N, C, H, W) input",
                )),
                None => Ok(None),
            }
        }
        "batchnorm" => {
            let size = required_size(layer.size, index, "BatchNorm", "size")?;
            if let Some(momentum) = layer.momentum {
                if !(0.0..=1.0).contains(&momentum) {
                    return Err(invalid(index, "momentum must be in range [0.0, 1.0]"));
                }
            }
            check_features(incoming, size, index, "size")?;
            Ok(incoming.or(Some(Extent::Flat(size))))
        }
        "dropout" => {
            if let Some(drop_rate) = layer.drop_rate {
                if !(0.0..1.0).contains(&drop_rate) {
                    return Err(invalid(index, "drop_rate must be in range [0.0, 1.0)"));
                }
            }
            match layer.size {
                Some(size) => {
                    positive(size, index, "size")?;
                    check_features(incoming, size, index, "size")?;
                    Ok(incoming.or(Some(Extent::Flat(size))))
                }
                None => Ok(incoming),
            }
        }
        "relu" | "sigmoid" => Ok(incoming),
        _ => Err(invalid(
            index,
            format!(
                "Invalid layer type '{}'. Must be one of: affine, convolution, pooling, relu, sigmoid, dropout, batchnorm",
                layer.layer_type
            ),
        )),
    }
}

/// Validates an architecture configuration.
///
/// Checks that:
/// - Architecture has at least one layer
/// - Each layer has the required fields for its type
/// - Parameter values are within valid ranges
/// - Adjacent layers agree on feature counts wherever both are known
pub fn validate_architecture(config: &ArchitectureConfig) -> Result<(), ConfigError> {
    if config.layers.is_empty() {
        return Err(ConfigError::Invalid(
            "Architecture must have at least one layer".to_string(),
        ));
    }
    let mut extent = None;
    for (i, layer) in config.layers.iter().enumerate() {
        extent = validate_layer(layer, i, extent)?;
    }
    Ok(())
}

/// Builds the layer stack described by `config`.
///
/// Affine and convolution weights use Xavier initialization and zero biases;
/// BatchNorm starts with `gamma = 1`, `beta = 0`. All randomness, including
/// each Dropout layer's mask seed, is drawn from one `ChaCha8Rng` seeded with
/// `config.seed`, so the same config always builds the same stack.
///
/// # Examples
///
/// ```
/// use neural_layers::architecture::{build_layers, parse_architecture};
///
/// let config = parse_architecture(r#"{
///   "layers": [
///     { "layer_type": "affine", "input_size": 4, "output_size": 3 },
///     { "layer_type": "relu" },
///     { "layer_type": "affine", "input_size": 3, "output_size": 2 }
///   ]
/// }"#).unwrap();
/// let layers = build_layers(&config).unwrap();
/// assert_eq!(layers.len(), 3);
/// assert_eq!(layers[1].name(), "ReLU");
/// ```
pub fn build_layers(config: &ArchitectureConfig) -> Result<Vec<Box<dyn Layer>>, ConfigError> {
    validate_architecture(config)?;
    let seed = config.seed.unwrap_or(DEFAULT_SEED);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut layers: Vec<Box<dyn Layer>> = Vec::with_capacity(config.layers.len());

    for (i, layer) in config.layers.iter().enumerate() {
        let built: Box<dyn Layer> = match layer.layer_type.to_lowercase().as_str() {
            "affine" => Box::new(Affine::xavier(
                require(layer.input_size, i, "Affine", "input_size")?,
                require(layer.output_size, i, "Affine", "output_size")?,
                &mut rng,
            )?),
            "convolution" => {
                let kernel = require(layer.kernel_size, i, "Convolution", "kernel_size")?;
                Box::new(Convolution::xavier(
                    require(layer.in_channels, i, "Convolution", "in_channels")?,
                    require(layer.out_channels, i, "Convolution", "out_channels")?,
                    (kernel, kernel),
                    stride(layer, i)?,
                    padding(layer, i)?,
                    &mut rng,
                )?)
            }
            "pooling" => {
                let pool = require(layer.pool_size, i, "Pooling", "pool_size")?;
                Box::new(Pooling::new(pool, pool, stride(layer, i)?, padding(layer, i)?)?)
            }
            "batchnorm" => Box::new(
                BatchNorm::with_features(require(layer.size, i, "BatchNorm", "size")?)?
                    .with_momentum(layer.momentum.unwrap_or(DEFAULT_MOMENTUM))?,
            ),
            "dropout" => Box::new(Dropout::with_seed(
                layer.drop_rate.unwrap_or(DEFAULT_DROP_RATE),
                rng.gen(),
            )?),
            "relu" => Box::new(Relu::new()),
            "sigmoid" => Box::new(Sigmoid::new()),
            other => return Err(invalid(i, format!("Invalid layer type '{}'", other))),
        };
        layers.push(built);
    }

    let parameters: usize = layers.iter().map(|l| l.parameter_count()).sum();
    log::debug!(
        "Built {} layers ({} parameters) with seed {}",
        layers.len(),
        parameters,
        seed
    );
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn affine(input_size: usize, output_size: usize) -> LayerConfig {
        LayerConfig {
            input_size: Some(input_size),
            output_size: Some(output_size),
            ..LayerConfig::of_type("affine")
        }
    }

    fn config(layers: Vec<LayerConfig>) -> ArchitectureConfig {
        ArchitectureConfig { layers, seed: None }
    }

    #[test]
    fn test_validate_affine_layer() {
        assert!(validate_architecture(&config(vec![affine(784, 10)])).is_ok());
        let missing = LayerConfig {
            input_size: Some(4),
            ..LayerConfig::of_type("Affine")
        };
        let err = validate_architecture(&config(vec![missing])).unwrap_err();
        assert!(err.to_string().contains("output_size"));
    }

    #[test]
    fn test_validate_invalid_layer_type() {
        let err = validate_architecture(&config(vec![LayerConfig::of_type("lstm")])).unwrap_err();
        assert!(err.to_string().contains("Invalid layer type"));
    }

    #[test]
    fn test_validate_empty_architecture() {
        assert!(matches!(
            validate_architecture(&config(vec![])),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_ranges() {
        let dropout = LayerConfig {
            drop_rate: Some(1.0),
            ..LayerConfig::of_type("dropout")
        };
        assert!(validate_architecture(&config(vec![dropout])).is_err());

        let bn = LayerConfig {
            size: Some(4),
            momentum: Some(1.5),
            ..LayerConfig::of_type("batchnorm")
        };
        assert!(validate_architecture(&config(vec![bn])).is_err());

        let pool = LayerConfig {
            pool_size: Some(2),
            stride: Some(0),
            ..LayerConfig::of_type("pooling")
        };
        assert!(validate_architecture(&config(vec![pool])).is_err());
    }

    #[test]
    fn test_negative_padding_rejected() {
        let conv = LayerConfig {
            in_channels: Some(1),
            out_channels: Some(2),
            kernel_size: Some(3),
            padding: Some(-1),
            ..LayerConfig::of_type("convolution")
        };
        let err = validate_architecture(&config(vec![conv])).unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    fn test_connection_mismatch_through_shape_preserving_layers() {
        let layers = vec![
            affine(8, 6),
            LayerConfig::of_type("relu"),
            LayerConfig::of_type("dropout"),
            affine(5, 2),
        ];
        let err = validate_architecture(&config(layers)).unwrap_err();
        assert!(err.to_string().contains("Layer 3"));
    }

    #[test]
    fn test_conv_pool_affine_sizes_tracked() {
        let conv = LayerConfig {
            in_channels: Some(1),
            out_channels: Some(4),
            kernel_size: Some(3),
            padding: Some(1),
            input_height: Some(8),
            input_width: Some(8),
            ..LayerConfig::of_type("convolution")
        };
        let pool = LayerConfig {
            pool_size: Some(2),
            stride: Some(2),
            ..LayerConfig::of_type("pooling")
        };
        let ok = config(vec![conv.clone(), pool.clone(), affine(64, 10)]);
        assert!(validate_architecture(&ok).is_ok());
        assert!(validate_architecture(&config(vec![conv, pool, affine(63, 10)])).is_err());
    }

    #[test]
    fn test_build_layers_is_reproducible() {
        let arch = ArchitectureConfig {
            layers: vec![affine(6, 4), LayerConfig::of_type("sigmoid"), affine(4, 2)],
            seed: Some(3),
        };
        let mut a = build_layers(&arch).unwrap();
        let mut b = build_layers(&arch).unwrap();
        let wa: Vec<f32> = a[0].params()[0].value.data().to_vec();
        let wb: Vec<f32> = b[0].params()[0].value.data().to_vec();
        assert_eq!(wa, wb);
        assert_eq!(a[0].parameter_count(), 28);
    }

    #[test]
    fn test_config_serde_round_trip_skips_unset_fields() {
        let arch = config(vec![affine(2, 3)]);
        let json = serde_json::to_string(&arch).unwrap();
        assert!(!json.contains("drop_rate"));
        assert_eq!(parse_architecture(&json).unwrap(), arch);
    }
}
