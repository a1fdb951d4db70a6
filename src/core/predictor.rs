//! Batched forward passes

use ndarray::{concatenate, ArrayD, Axis};

use super::batching::batch_ranges;
use super::example_set::ExampleSet;
use super::neural_net::NeuralNet;
use crate::{NetError, Result};

/// Runs a net forward over a dataset and returns the raw outputs.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeuralNetPredictor;

impl NeuralNetPredictor {
    /// Create a predictor
    pub fn new() -> Self {
        NeuralNetPredictor
    }

    /// Model outputs for every example, stacked along axis 0 in input order.
    ///
    /// Targets in `examples` are ignored.
    pub fn predict<N: NeuralNet>(
        &self,
        net: &mut N,
        examples: &N::Examples,
        batch_size: Option<usize>,
    ) -> Result<ArrayD<f32>> {
        let num_examples = examples.num_examples();
        if num_examples == 0 {
            return Err(NetError::EmptyDataset);
        }

        let indices: Vec<usize> = (0..num_examples).collect();
        let chunk = match batch_size {
            Some(0) => return Err(NetError::InvalidArgument("batch size must be positive".into())),
            Some(batch_size) if num_examples > batch_size => batch_size,
            _ => num_examples,
        };

        let mut outputs = Vec::new();
        for range in batch_ranges(num_examples, chunk)? {
            let batch = examples.select(&indices[range])?;
            let feed = net.feed_dict(&batch.into_inputs(), false)?;
            outputs.push(net.model_output(&feed)?);
        }

        if outputs.len() == 1 {
            return Ok(outputs.remove(0));
        }
        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }

    /// Alias of [`NeuralNetPredictor::predict`] used by inference runners
    pub fn infer<N: NeuralNet>(
        &self,
        net: &mut N,
        examples: &N::Examples,
        batch_size: Option<usize>,
    ) -> Result<ArrayD<f32>> {
        self.predict(net, examples, batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::evaluator::tests::{column, MeanNet};
    use crate::core::LabeledData;

    #[test]
    fn test_predict_concatenates_in_order() {
        let mut net = MeanNet::new();
        let data = LabeledData::unlabeled(column(&[1.0, 2.0, 3.0, 4.0, 5.0])).unwrap();

        let out = NeuralNetPredictor::new().predict(&mut net, &data, Some(2)).unwrap();
        assert_eq!(out.shape(), &[5, 1]);
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_predict_single_pass() {
        let mut net = MeanNet::new();
        let data = LabeledData::unlabeled(column(&[1.0, 2.0])).unwrap();
        let out = NeuralNetPredictor::new().infer(&mut net, &data, None).unwrap();
        assert_eq!(out.shape(), &[2, 1]);
    }

    #[test]
    fn test_predict_empty() {
        let mut net = MeanNet::new();
        let data = LabeledData::unlabeled(column(&[])).unwrap();
        assert!(NeuralNetPredictor::new().predict(&mut net, &data, Some(4)).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut net = MeanNet::new();
        let data = LabeledData::unlabeled(column(&[1.0, 2.0, 3.0])).unwrap();
        assert!(matches!(
            NeuralNetPredictor::new().predict(&mut net, &data, Some(0)),
            Err(NetError::InvalidArgument(_))
        ));
    }
}
