//! Softmax cross-entropy and categorical accuracy over one-hot targets

use ndarray::{Array2, ArrayView2, Axis, Zip};

use super::activations::{argmax_last, softmax};
use crate::{NetError, Result};

const LOG_EPS: f32 = 1e-12;

/// Loss value and gradient with respect to the logits
#[derive(Clone, Debug)]
pub struct LossOutput {
    /// Mean cross-entropy over rows
    pub loss: f32,
    /// `(softmax(logits) - targets) / rows`
    pub grad: Array2<f32>,
    /// Softmax probabilities
    pub probabilities: Array2<f32>,
}

fn check(logits: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> Result<()> {
    if logits.dim() != targets.dim() {
        return Err(NetError::ShapeMismatch(format!(
            "logits {:?} vs targets {:?}",
            logits.dim(),
            targets.dim()
        )));
    }
    if logits.nrows() == 0 {
        return Err(NetError::EmptyDataset);
    }
    Ok(())
}

/// Mean softmax cross-entropy of `logits` (rows x classes) against one-hot `targets`
pub fn softmax_cross_entropy(logits: ArrayView2<f32>, targets: ArrayView2<f32>) -> Result<LossOutput> {
    check(&logits, &targets)?;
    let rows = logits.nrows() as f32;
    let probabilities = softmax(logits, Axis(1));

    let mut total = 0.0f32;
    Zip::from(&probabilities).and(&targets).for_each(|&p, &t| {
        if t != 0.0 {
            total -= t * (p + LOG_EPS).ln();
        }
    });

    let grad = (&probabilities - &targets) / rows;
    Ok(LossOutput {
        loss: total / rows,
        grad,
        probabilities,
    })
}

/// Fraction of rows whose argmax matches the target's argmax
pub fn categorical_accuracy(scores: ArrayView2<f32>, targets: ArrayView2<f32>) -> Result<f32> {
    check(&scores, &targets)?;
    let predicted = argmax_last(scores);
    let expected = argmax_last(targets);
    let hits = Zip::from(&predicted)
        .and(&expected)
        .fold(0usize, |acc, p, e| acc + usize::from(p == e));
    Ok(hits as f32 / scores.nrows() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_uniform_logits() {
        let logits = Array2::<f32>::zeros((2, 4));
        let targets = array![[1.0f32, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]];
        let out = softmax_cross_entropy(logits.view(), targets.view()).unwrap();
        assert_abs_diff_eq!(out.loss, 4.0f32.ln(), epsilon = 1e-5);
        assert_abs_diff_eq!(out.grad[[0, 0]], (0.25 - 1.0) / 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out.grad[[0, 1]], 0.25 / 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_gradient_rows_sum_to_zero() {
        let logits = array![[2.0f32, -1.0, 0.5], [0.0, 3.0, -2.0]];
        let targets = array![[0.0f32, 1.0, 0.0], [0.0, 1.0, 0.0]];
        let out = softmax_cross_entropy(logits.view(), targets.view()).unwrap();
        for row in out.grad.rows() {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_accuracy() {
        let scores = array![[0.9f32, 0.1], [0.2, 0.8], [0.6, 0.4], [0.3, 0.7]];
        let targets = array![[1.0f32, 0.0], [0.0, 1.0], [0.0, 1.0], [1.0, 0.0]];
        assert_eq!(categorical_accuracy(scores.view(), targets.view()).unwrap(), 0.5);
    }

    #[test]
    fn test_shape_errors() {
        let a = Array2::<f32>::zeros((2, 3));
        let b = Array2::<f32>::zeros((2, 2));
        assert!(softmax_cross_entropy(a.view(), b.view()).is_err());
        assert!(matches!(
            categorical_accuracy(Array2::<f32>::zeros((0, 2)).view(), Array2::<f32>::zeros((0, 2)).view()),
            Err(NetError::EmptyDataset)
        ));
    }
}
