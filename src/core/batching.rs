//! Contiguous batch partitioning and weighted averaging

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{NetError, Result};

/// Loss and accuracy of one run
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchScore {
    /// Mean loss
    pub loss: f32,
    /// Mean accuracy
    pub accuracy: f32,
}

impl BatchScore {
    /// Create a score
    pub fn new(loss: f32, accuracy: f32) -> Self {
        BatchScore { loss, accuracy }
    }
}

/// Split `0..n` into `ceil(n / batch_size)` contiguous ranges.
///
/// Every range holds `batch_size` indices except possibly the last.
pub fn batch_ranges(n: usize, batch_size: usize) -> Result<impl Iterator<Item = Range<usize>>> {
    if batch_size == 0 {
        return Err(NetError::InvalidArgument("batch size must be positive".into()));
    }
    let steps = if n == 0 { 0 } else { (n - 1) / batch_size + 1 };
    Ok((0..steps).map(move |step| {
        let start = step * batch_size;
        start..(start + batch_size).min(n)
    }))
}

/// Accumulates `value * weight` and divides by a caller-supplied total.
#[derive(Clone, Debug, Default)]
pub struct WeightedMean {
    loss: f64,
    accuracy: f64,
    weight: usize,
}

impl WeightedMean {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a batch score weighted by the batch size
    pub fn add(&mut self, score: BatchScore, batch_len: usize) {
        self.loss += score.loss as f64 * batch_len as f64;
        self.accuracy += score.accuracy as f64 * batch_len as f64;
        self.weight += batch_len;
    }

    /// Total weight added so far
    pub fn weight(&self) -> usize {
        self.weight
    }

    /// Weighted sums divided by `total`
    pub fn finish(&self, total: usize) -> Result<BatchScore> {
        if total == 0 {
            return Err(NetError::EmptyDataset);
        }
        Ok(BatchScore {
            loss: (self.loss / total as f64) as f32,
            accuracy: (self.accuracy / total as f64) as f32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ranges_last_batch_shorter() {
        let ranges: Vec<_> = batch_ranges(10, 4).unwrap().collect();
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn test_ranges_exact_and_empty() {
        assert_eq!(batch_ranges(8, 4).unwrap().count(), 2);
        assert_eq!(batch_ranges(0, 4).unwrap().count(), 0);
        assert!(batch_ranges(5, 0).is_err());
    }

    #[test]
    fn test_weighted_mean() {
        let mut mean = WeightedMean::new();
        mean.add(BatchScore::new(1.0, 0.5), 4);
        mean.add(BatchScore::new(3.0, 1.0), 2);

        let score = mean.finish(6).unwrap();
        assert!((score.loss - 10.0 / 6.0).abs() < 1e-6);
        assert!((score.accuracy - 4.0 / 6.0).abs() < 1e-6);
        assert!(matches!(mean.finish(0), Err(NetError::EmptyDataset)));
    }

    proptest! {
        #[test]
        fn prop_ranges_partition(n in 0usize..500, batch in 1usize..64) {
            let ranges: Vec<_> = batch_ranges(n, batch).unwrap().collect();
            prop_assert_eq!(ranges.len(), (n + batch - 1) / batch);

            let mut next = 0;
            for (i, r) in ranges.iter().enumerate() {
                prop_assert_eq!(r.start, next);
                prop_assert!(!r.is_empty());
                if i + 1 < ranges.len() {
                    prop_assert_eq!(r.len(), batch);
                } else {
                    prop_assert!(r.len() <= batch);
                }
                next = r.end;
            }
            prop_assert_eq!(next, n);
        }

        #[test]
        fn prop_constant_scores_average_to_themselves(n in 1usize..300, batch in 1usize..50, v in 0.0f32..10.0) {
            let mut mean = WeightedMean::new();
            for r in batch_ranges(n, batch).unwrap() {
                mean.add(BatchScore::new(v, v), r.len());
            }
            prop_assert_eq!(mean.weight(), n);
            let score = mean.finish(n).unwrap();
            prop_assert!((score.loss - v).abs() < 1e-4);
        }
    }
}
