// Tests for the fused softmax + cross-entropy loss layer.

use approx::assert_relative_eq;
use neural_layers::layers::{SoftmaxWithLoss, Target};
use neural_layers::utils::activations::softmax;
use neural_layers::{LayerError, Tensor};

fn one_hot(classes: &[usize], n: usize) -> Tensor {
    let mut data = vec![0.0f32; classes.len() * n];
    for (row, &class) in classes.iter().enumerate() {
        data[row * n + class] = 1.0;
    }
    Tensor::new(data, vec![classes.len(), n]).unwrap()
}

// ============================================================================
// Softmax
// ============================================================================

mod softmax_tests {
    use super::*;

    #[test]
    fn test_rows_sum_to_one() {
        let scores = Tensor::from_rows(&[[1.0, 2.0, 3.0], [-5.0, 0.0, 5.0]]).unwrap();
        let y = softmax(&scores).unwrap();
        for row in y.data().chunks(3) {
            assert_relative_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_shift_invariance_and_large_scores() {
        let base = Tensor::from_rows(&[[1.0, 2.0, 3.0]]).unwrap();
        let shifted = base.map(|v| v + 1000.0);
        let a = softmax(&base).unwrap();
        let b = softmax(&shifted).unwrap();
        assert!(b.data().iter().all(|v| v.is_finite()));
        for (&p, &q) in a.data().iter().zip(b.data()) {
            assert_relative_eq!(p, q, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rank1_is_single_row() {
        let y = softmax(&Tensor::vector(vec![0.0, 0.0])).unwrap();
        assert_eq!(y.shape(), &[2]);
        assert_eq!(y.data(), &[0.5, 0.5]);
    }
}

// ============================================================================
// Loss
// ============================================================================

mod loss_tests {
    use super::*;

    #[test]
    fn test_uniform_scores_give_log_classes() {
        let mut layer = SoftmaxWithLoss::new();
        let loss = layer
            .forward(&Tensor::zeros(&[4, 5]), &Target::ClassIndices(vec![0, 1, 2, 3]))
            .unwrap();
        assert_relative_eq!(loss, 5.0f32.ln(), epsilon = 1e-5);
        assert_eq!(layer.loss(), Some(loss));
    }

    #[test]
    fn test_loss_vanishes_with_margin() {
        let mut layer = SoftmaxWithLoss::new();
        let mut previous = f32::INFINITY;
        for &margin in &[0.0f32, 2.0, 5.0, 10.0, 30.0] {
            let scores = Tensor::from_rows(&[[margin, 0.0, 0.0]]).unwrap();
            let loss = layer.forward(&scores, &Target::ClassIndices(vec![0])).unwrap();
            assert!(loss < previous);
            previous = loss;
        }
        assert!(previous.abs() < 1e-5);
    }

    #[test]
    fn test_encodings_agree() {
        let scores = Tensor::from_rows(&[[0.3, -1.2, 2.0], [1.0, 1.5, -0.5]]).unwrap();
        let mut by_index = SoftmaxWithLoss::new();
        let mut by_one_hot = SoftmaxWithLoss::new();

        let l1 = by_index
            .forward(&scores, &Target::ClassIndices(vec![2, 0]))
            .unwrap();
        let l2 = by_one_hot
            .forward(&scores, &Target::OneHot(one_hot(&[2, 0], 3)))
            .unwrap();
        assert_relative_eq!(l1, l2, epsilon = 1e-6);

        let d1 = by_index.backward(1.0).unwrap();
        let d2 = by_one_hot.backward(1.0).unwrap();
        for (&a, &b) in d1.data().iter().zip(d2.data()) {
            assert_relative_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rank1_scores_are_a_batch_of_one() {
        let mut layer = SoftmaxWithLoss::new();
        let loss = layer
            .forward(&Tensor::vector(vec![0.0, 0.0]), &Target::ClassIndices(vec![1]))
            .unwrap();
        assert_relative_eq!(loss, 2.0f32.ln(), epsilon = 1e-5);
        assert_eq!(layer.probabilities().unwrap().shape(), &[1, 2]);
    }
}

// ============================================================================
// Gradient
// ============================================================================

mod gradient_tests {
    use super::*;

    #[test]
    fn test_gradient_is_probabilities_minus_target_over_batch() {
        let scores = Tensor::from_rows(&[[1.0, 2.0, 0.5], [0.0, -1.0, 1.0]]).unwrap();
        let mut layer = SoftmaxWithLoss::new();
        layer
            .forward(&scores, &Target::ClassIndices(vec![1, 2]))
            .unwrap();
        let y = layer.probabilities().unwrap().clone();
        let dx = layer.backward(1.0).unwrap();

        let t = one_hot(&[1, 2], 3);
        for ((&d, &p), &target) in dx.data().iter().zip(y.data()).zip(t.data()) {
            assert_relative_eq!(d, (p - target) / 2.0, epsilon = 1e-6);
        }
        for row in dx.data().chunks(3) {
            assert_relative_eq!(row.iter().sum::<f32>(), 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_upstream_gradient_scales_result() {
        let scores = Tensor::from_rows(&[[0.2, 0.8]]).unwrap();
        let mut layer = SoftmaxWithLoss::new();
        layer.forward(&scores, &Target::ClassIndices(vec![0])).unwrap();
        let unit = layer.backward(1.0).unwrap();
        let scaled = layer.backward(3.0).unwrap();
        for (&a, &b) in unit.data().iter().zip(scaled.data()) {
            assert_relative_eq!(b, 3.0 * a, epsilon = 1e-6);
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

mod error_tests {
    use super::*;

    #[test]
    fn test_backward_before_forward() {
        assert!(matches!(
            SoftmaxWithLoss::new().backward(1.0),
            Err(LayerError::UninitializedState(_))
        ));
    }

    #[test]
    fn test_invalid_targets() {
        let scores = Tensor::zeros(&[2, 3]);
        let mut layer = SoftmaxWithLoss::new();
        for target in [
            Target::ClassIndices(vec![0]),
            Target::ClassIndices(vec![0, 3]),
            Target::OneHot(Tensor::zeros(&[2, 4])),
        ] {
            assert!(
                matches!(layer.forward(&scores, &target), Err(LayerError::ShapeMismatch(_))),
                "{:?} accepted",
                target
            );
        }
    }

    #[test]
    fn test_rank3_scores_rejected() {
        let mut layer = SoftmaxWithLoss::new();
        assert!(layer
            .forward(&Tensor::zeros(&[1, 2, 3]), &Target::ClassIndices(vec![0]))
            .is_err());
    }
}
