//! Batched evaluation with weighted loss/accuracy averaging

use log::debug;

use super::batching::{batch_ranges, BatchScore, WeightedMean};
use super::example_set::ExampleSet;
use super::neural_net::NeuralNet;
use crate::{NetError, Result};

/// Runs a net in non-training mode over a dataset and averages its scores.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeuralNetEvaluator;

impl NeuralNetEvaluator {
    /// Create an evaluator
    pub fn new() -> Self {
        NeuralNetEvaluator
    }

    /// Mean loss and accuracy of `net` over `examples`.
    ///
    /// With no batch size, or when everything fits in one batch, the net runs
    /// once on the whole set. Otherwise each contiguous batch is scored and the
    /// result is `sum(score_i * len_i) / N`.
    pub fn evaluate<N: NeuralNet>(
        &self,
        net: &mut N,
        examples: &N::Examples,
        batch_size: Option<usize>,
    ) -> Result<BatchScore> {
        let num_examples = examples.num_examples();
        if num_examples == 0 {
            return Err(NetError::EmptyDataset);
        }
        if !examples.has_targets() {
            return Err(NetError::InvalidArgument(
                "evaluation needs examples with targets".into(),
            ));
        }

        match batch_size {
            Some(0) => Err(NetError::InvalidArgument("batch size must be positive".into())),
            Some(batch_size) if num_examples > batch_size => {
                let indices: Vec<usize> = (0..num_examples).collect();
                let mut mean = WeightedMean::new();
                for range in batch_ranges(num_examples, batch_size)? {
                    let batch = examples.select(&indices[range])?;
                    if batch.is_empty() {
                        continue;
                    }
                    let feed = net.feed_dict(&batch, false)?;
                    let score = net.loss_and_accuracy(&feed)?;
                    debug!(
                        "eval batch of {}: loss={:.4} acc={:.4}",
                        batch.num_examples(),
                        score.loss,
                        score.accuracy
                    );
                    mean.add(score, batch.num_examples());
                }
                mean.finish(num_examples)
            }
            _ => {
                let feed = net.feed_dict(examples, false)?;
                net.loss_and_accuracy(&feed)
            }
        }
    }
}
