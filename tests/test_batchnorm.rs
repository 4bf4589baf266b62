// Tests for batch normalization: batch statistics, running statistics, and
// the training / inference split.

use approx::assert_relative_eq;
use neural_layers::layers::batchnorm::{DEFAULT_MOMENTUM, EPSILON};
use neural_layers::layers::{BatchNorm, Layer};
use neural_layers::{LayerError, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn random_batch(rows: usize, cols: usize, seed: u64) -> Tensor {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let data = (0..rows * cols)
        .map(|_| rng.gen_range(-3.0f32..5.0))
        .collect();
    Tensor::new(data, vec![rows, cols]).unwrap()
}

fn column_stats(t: &Tensor) -> (Vec<f32>, Vec<f32>) {
    let (n, d) = (t.shape()[0], t.shape()[1]);
    let mut mean = vec![0.0f32; d];
    for row in t.data().chunks_exact(d) {
        for (m, &v) in mean.iter_mut().zip(row) {
            *m += v / n as f32;
        }
    }
    let mut var = vec![0.0f32; d];
    for row in t.data().chunks_exact(d) {
        for ((s, &v), &m) in var.iter_mut().zip(row).zip(&mean) {
            *s += (v - m) * (v - m) / n as f32;
        }
    }
    (mean, var)
}

// ============================================================================
// Training mode
// ============================================================================

mod training_tests {
    use super::*;

    #[test]
    fn test_output_statistics_follow_gamma_beta() {
        let gamma = Tensor::vector(vec![1.0, 2.0, 0.5]);
        let beta = Tensor::vector(vec![0.0, -1.0, 3.0]);
        let mut bn = BatchNorm::new(gamma.clone(), beta.clone()).unwrap();

        let y = bn.forward(&random_batch(64, 3, 1)).unwrap();
        let (mean, var) = column_stats(&y);
        for j in 0..3 {
            assert_relative_eq!(mean[j], beta.data()[j], epsilon = 1e-4);
            let g = gamma.data()[j];
            assert_relative_eq!(var[j], g * g, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_running_statistics_update() {
        let x = random_batch(16, 4, 2);
        let (mean, var) = column_stats(&x);
        let mut bn = BatchNorm::with_features(4).unwrap();
        assert!(bn.running_mean().is_none());

        bn.forward(&x).unwrap();
        let momentum = DEFAULT_MOMENTUM;
        for j in 0..4 {
            assert_relative_eq!(
                bn.running_mean().unwrap().data()[j],
                (1.0 - momentum) * mean[j],
                epsilon = 1e-5
            );
            assert_relative_eq!(
                bn.running_var().unwrap().data()[j],
                (1.0 - momentum) * var[j],
                epsilon = 1e-4
            );
        }

        // second step blends with the stored value
        bn.forward(&x).unwrap();
        for j in 0..4 {
            let expected = momentum * (1.0 - momentum) * mean[j] + (1.0 - momentum) * mean[j];
            assert_relative_eq!(
                bn.running_mean().unwrap().data()[j],
                expected,
                epsilon = 1e-5
            );
        }
    }

    #[test]
    fn test_custom_momentum() {
        let x = random_batch(8, 2, 3);
        let (mean, _) = column_stats(&x);
        let mut bn = BatchNorm::with_features(2)
            .unwrap()
            .with_momentum(0.5)
            .unwrap();
        bn.forward(&x).unwrap();
        for j in 0..2 {
            let running = bn.running_mean().unwrap().data()[j];
            assert_relative_eq!(running, 0.5 * mean[j], epsilon = 1e-5);
        }
        assert!(BatchNorm::with_features(2).unwrap().with_momentum(1.5).is_err());
    }

    #[test]
    fn test_rank4_input_normalizes_per_flattened_feature() {
        let x = random_batch(10, 2 * 3 * 3, 4).into_reshape(&[10, 2, 3, 3]).unwrap();
        let mut bn = BatchNorm::with_features(18).unwrap();
        let y = bn.forward(&x).unwrap();
        assert_eq!(y.shape(), &[10, 2, 3, 3]);

        let (mean, var) = column_stats(&y.reshape(&[10, 18]).unwrap());
        for j in 0..18 {
            assert_relative_eq!(mean[j], 0.0, epsilon = 1e-4);
            assert_relative_eq!(var[j], 1.0, epsilon = 1e-3);
        }

        let dx = bn.backward(&Tensor::filled(&[10, 2, 3, 3], 1.0)).unwrap();
        assert_eq!(dx.shape(), &[10, 2, 3, 3]);
        // a constant upstream gradient carries no information through centering
        for &v in dx.data() {
            assert_relative_eq!(v, 0.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_constant_feature_stays_finite() {
        let x = Tensor::from_rows(&[[1.0, 5.0], [2.0, 5.0], [3.0, 5.0]]).unwrap();
        let mut bn = BatchNorm::with_features(2).unwrap();
        let y = bn.forward(&x).unwrap();
        assert!(y.data().iter().all(|v| v.is_finite()));
        assert_eq!(y.data()[1], 0.0);
        let dx = bn.backward(&Tensor::filled(&[3, 2], 1.0)).unwrap();
        assert!(dx.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_feature_mismatch() {
        let mut bn = BatchNorm::with_features(3).unwrap();
        assert!(matches!(
            bn.forward(&Tensor::zeros(&[4, 2])),
            Err(LayerError::ShapeMismatch(_))
        ));
        assert!(matches!(
            bn.forward(&Tensor::zeros(&[4, 3, 1])),
            Err(LayerError::ShapeMismatch(_))
        ));
    }
}

// ============================================================================
// Inference mode
// ============================================================================

mod inference_tests {
    use super::*;

    #[test]
    fn test_inference_uses_running_statistics() {
        let mean = Tensor::vector(vec![1.0, -2.0]);
        let var = Tensor::vector(vec![4.0, 0.25]);
        let gamma = Tensor::vector(vec![2.0, 1.0]);
        let beta = Tensor::vector(vec![0.5, 0.0]);
        let mut bn = BatchNorm::new(gamma, beta)
            .unwrap()
            .with_running_stats(mean, var)
            .unwrap();
        bn.set_training(false);
        assert!(!bn.is_training());

        let y = bn.forward(&Tensor::from_rows(&[[3.0, -1.0]]).unwrap()).unwrap();
        let expected = 2.0 * 2.0 / (4.0 + EPSILON).sqrt() + 0.5;
        assert_relative_eq!(y.data()[0], expected, epsilon = 1e-5);
        assert_relative_eq!(y.data()[1], 1.0 / (0.25 + EPSILON).sqrt(), epsilon = 1e-5);
    }

    #[test]
    fn test_inference_does_not_touch_running_statistics() {
        let x = random_batch(6, 3, 5);
        let mut bn = BatchNorm::with_features(3).unwrap();
        bn.forward(&x).unwrap();
        let before = bn.running_mean().cloned();

        bn.set_training(false);
        bn.forward(&random_batch(6, 3, 6)).unwrap();
        assert_eq!(bn.running_mean().cloned(), before);
    }

    #[test]
    fn test_inference_without_statistics_uses_zeros() {
        let mut bn = BatchNorm::with_features(2).unwrap();
        bn.set_training(false);
        let x = Tensor::from_rows(&[[0.5, -0.5]]).unwrap();
        let y = bn.forward(&x).unwrap();
        assert_relative_eq!(y.data()[0], 0.5 / EPSILON.sqrt(), max_relative = 1e-4);
        assert_eq!(bn.running_mean().unwrap().data(), &[0.0, 0.0]);
        assert_eq!(bn.running_var().unwrap().data(), &[0.0, 0.0]);

        // the lazily created statistics are reused on the next call
        let again = bn.forward(&x).unwrap();
        assert_eq!(again, y);
    }

    #[test]
    fn test_backward_after_inference_is_rejected() {
        let mut bn = BatchNorm::with_features(2).unwrap();
        bn.forward(&random_batch(4, 2, 7)).unwrap();
        bn.set_training(false);
        bn.forward(&random_batch(4, 2, 8)).unwrap();
        assert!(matches!(
            bn.backward(&Tensor::zeros(&[4, 2])),
            Err(LayerError::UninitializedState(_))
        ));
    }
}
