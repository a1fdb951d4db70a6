//! Example containers indexed along their leading axis

use ndarray::{ArrayD, Axis};

use crate::{NetError, Result};

/// A set of examples that can be counted and sub-selected by index.
pub trait ExampleSet: Sized {
    /// Number of examples (leading axis length)
    fn num_examples(&self) -> usize;

    /// Copy out the examples at `indices`, in that order
    fn select(&self, indices: &[usize]) -> Result<Self>;

    /// Whether targets are present, i.e. loss and accuracy can be computed
    fn has_targets(&self) -> bool;

    /// Drop the targets, keeping only what a forward pass reads
    fn into_inputs(self) -> Self;

    /// Check if empty
    fn is_empty(&self) -> bool {
        self.num_examples() == 0
    }
}

fn leading(array: &ArrayD<f32>) -> usize {
    array.shape().first().copied().unwrap_or(0)
}

fn check_leading(what: &str, expected: usize, array: &ArrayD<f32>) -> Result<()> {
    if array.ndim() == 0 || leading(array) != expected {
        return Err(NetError::ShapeMismatch(format!(
            "{} has shape {:?}, expected {} examples",
            what,
            array.shape(),
            expected
        )));
    }
    Ok(())
}

fn select_rows(array: &ArrayD<f32>, indices: &[usize]) -> Result<ArrayD<f32>> {
    let n = leading(array);
    if let Some(&bad) = indices.iter().find(|&&i| i >= n) {
        return Err(NetError::InvalidArgument(format!(
            "index {} out of range for {} examples",
            bad, n
        )));
    }
    Ok(array.select(Axis(0), indices))
}

/// Inputs with optional per-example labels.
#[derive(Clone, Debug)]
pub struct LabeledData {
    /// Inputs, examples along axis 0
    pub data: ArrayD<f32>,
    /// Targets, examples along axis 0
    pub labels: Option<ArrayD<f32>>,
}

impl LabeledData {
    /// Pair inputs with labels
    pub fn new(data: ArrayD<f32>, labels: ArrayD<f32>) -> Result<Self> {
        if data.ndim() == 0 {
            return Err(NetError::ShapeMismatch("data must have an example axis".into()));
        }
        check_leading("labels", leading(&data), &labels)?;
        Ok(LabeledData {
            data,
            labels: Some(labels),
        })
    }

    /// Inputs only, for prediction
    pub fn unlabeled(data: ArrayD<f32>) -> Result<Self> {
        if data.ndim() == 0 {
            return Err(NetError::ShapeMismatch("data must have an example axis".into()));
        }
        Ok(LabeledData { data, labels: None })
    }
}

impl ExampleSet for LabeledData {
    fn num_examples(&self) -> usize {
        leading(&self.data)
    }

    fn select(&self, indices: &[usize]) -> Result<Self> {
        Ok(LabeledData {
            data: select_rows(&self.data, indices)?,
            labels: self
                .labels
                .as_ref()
                .map(|labels| select_rows(labels, indices))
                .transpose()?,
        })
    }

    fn has_targets(&self) -> bool {
        self.labels.is_some()
    }

    fn into_inputs(self) -> Self {
        LabeledData {
            data: self.data,
            labels: None,
        }
    }
}

/// Encoder inputs with optional decoder inputs/outputs for seq2seq nets.
///
/// Targets count as present only when both decoder arrays are.
#[derive(Clone, Debug)]
pub struct SequencePairs {
    /// Encoder inputs, (examples, time, features)
    pub encoder_inputs: ArrayD<f32>,
    /// Teacher-forcing decoder inputs
    pub decoder_inputs: Option<ArrayD<f32>>,
    /// Expected decoder outputs
    pub decoder_outputs: Option<ArrayD<f32>>,
}

impl SequencePairs {
    /// Full triple for training and evaluation
    pub fn new(
        encoder_inputs: ArrayD<f32>,
        decoder_inputs: ArrayD<f32>,
        decoder_outputs: ArrayD<f32>,
    ) -> Result<Self> {
        let n = leading(&encoder_inputs);
        check_leading("encoder inputs", n, &encoder_inputs)?;
        check_leading("decoder inputs", n, &decoder_inputs)?;
        check_leading("decoder outputs", n, &decoder_outputs)?;
        Ok(SequencePairs {
            encoder_inputs,
            decoder_inputs: Some(decoder_inputs),
            decoder_outputs: Some(decoder_outputs),
        })
    }

    /// Encoder inputs only, for inference
    pub fn encoder_only(encoder_inputs: ArrayD<f32>) -> Result<Self> {
        check_leading("encoder inputs", leading(&encoder_inputs), &encoder_inputs)?;
        Ok(SequencePairs {
            encoder_inputs,
            decoder_inputs: None,
            decoder_outputs: None,
        })
    }
}

impl ExampleSet for SequencePairs {
    fn num_examples(&self) -> usize {
        leading(&self.encoder_inputs)
    }

    fn select(&self, indices: &[usize]) -> Result<Self> {
        let pick = |a: &Option<ArrayD<f32>>| a.as_ref().map(|a| select_rows(a, indices)).transpose();
        Ok(SequencePairs {
            encoder_inputs: select_rows(&self.encoder_inputs, indices)?,
            decoder_inputs: pick(&self.decoder_inputs)?,
            decoder_outputs: pick(&self.decoder_outputs)?,
        })
    }

    fn has_targets(&self) -> bool {
        self.decoder_inputs.is_some() && self.decoder_outputs.is_some()
    }

    fn into_inputs(self) -> Self {
        SequencePairs {
            encoder_inputs: self.encoder_inputs,
            decoder_inputs: None,
            decoder_outputs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    fn ramp(shape: &[usize]) -> ArrayD<f32> {
        let len = shape.iter().product::<usize>();
        Array::from_shape_vec(IxDyn(shape), (0..len).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn test_labeled_select_keeps_order() {
        let data = LabeledData::new(ramp(&[5, 2]), ramp(&[5, 1])).unwrap();
        let picked = data.select(&[4, 0]).unwrap();

        assert_eq!(picked.num_examples(), 2);
        assert_eq!(picked.data[[0, 0]], 8.0);
        assert_eq!(picked.data[[1, 1]], 1.0);
        assert_eq!(picked.labels.unwrap()[[0, 0]], 4.0);
    }

    #[test]
    fn test_labeled_rejects_mismatched_counts() {
        assert!(LabeledData::new(ramp(&[5, 2]), ramp(&[4, 1])).is_err());
    }

    #[test]
    fn test_select_out_of_range() {
        let data = LabeledData::unlabeled(ramp(&[3, 2])).unwrap();
        assert!(!data.has_targets());
        assert!(data.select(&[3]).is_err());
    }

    #[test]
    fn test_sequence_pairs_targets() {
        let full = SequencePairs::new(ramp(&[2, 3, 4]), ramp(&[2, 3, 4]), ramp(&[2, 3, 4])).unwrap();
        assert!(full.has_targets());

        assert!(!full.clone().into_inputs().has_targets());

        let encoder = SequencePairs::encoder_only(ramp(&[2, 3, 4])).unwrap();
        assert!(!encoder.has_targets());
        assert_eq!(encoder.select(&[1]).unwrap().num_examples(), 1);
    }
}
