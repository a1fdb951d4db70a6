//! Concrete networks speaking the [`NeuralNet`](crate::core::NeuralNet) convention

mod cnn;
mod encdec;
mod fc_densenet;

pub use cnn::{CnnConfig, CnnModel};
pub use encdec::{EncoderDecoder, EncoderDecoderConfig};
pub use fc_densenet::{FcDenseNet, FcDenseNetConfig};

use ndarray::{Array2, ArrayD, ArrayView2, Dimension};

use crate::core::BatchScore;
use crate::nn::{categorical_accuracy, softmax_cross_entropy};
use crate::{NetError, Result};

/// Collapse every axis but the last into rows
pub(crate) fn to_rows<D: Dimension>(array: ndarray::Array<f32, D>) -> Result<Array2<f32>> {
    let classes = array.shape().last().copied().ok_or_else(|| {
        NetError::ShapeMismatch("cannot take rows of a scalar".into())
    })?;
    let rows = if classes == 0 { 0 } else { array.len() / classes };
    Ok(array
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((rows, classes))?)
}

/// Cross-entropy, accuracy and logit gradient of row logits against `targets`
pub(crate) fn score_rows(logits: ArrayView2<f32>, targets: &ArrayD<f32>) -> Result<(BatchScore, Array2<f32>)> {
    let targets = to_rows(targets.clone())?;
    let out = softmax_cross_entropy(logits, targets.view())?;
    let accuracy = categorical_accuracy(out.probabilities.view(), targets.view())?;
    Ok((BatchScore::new(out.loss, accuracy), out.grad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, IxDyn};

    #[test]
    fn test_to_rows_flattens_leading_axes() {
        let a = Array3::<f32>::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 12 + j * 4 + k) as f32);
        let rows = to_rows(a).unwrap();
        assert_eq!(rows.dim(), (6, 4));
        assert_eq!(rows[[5, 3]], 23.0);
    }

    #[test]
    fn test_score_rows_perfect_logits() {
        let logits = ndarray::array![[10.0f32, -10.0], [-10.0, 10.0]];
        let targets = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let (score, grad) = score_rows(logits.view(), &targets).unwrap();
        assert_eq!(score.accuracy, 1.0);
        assert!(score.loss < 1e-6);
        assert_eq!(grad.dim(), (2, 2));
    }
}
