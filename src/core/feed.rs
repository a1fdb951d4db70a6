//! Placeholders and feed dictionaries

use std::collections::HashMap;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::{NetError, Result};

/// Named, partially-shaped slot for an input tensor.
///
/// `None` dimensions accept any extent (usually the batch axis), fixed
/// dimensions must match exactly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placeholder {
    name: String,
    shape: Vec<Option<usize>>,
}

impl Placeholder {
    /// Create a placeholder
    pub fn new(name: &str, shape: &[Option<usize>]) -> Self {
        Placeholder {
            name: name.to_string(),
            shape: shape.to_vec(),
        }
    }

    /// Placeholder name, used as the feed key
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared shape
    pub fn shape(&self) -> &[Option<usize>] {
        &self.shape
    }

    /// Check that `value` is compatible with the declared shape
    pub fn check(&self, value: &ArrayD<f32>) -> Result<()> {
        if value.ndim() != self.shape.len() {
            return Err(NetError::ShapeMismatch(format!(
                "'{}' expects rank {}, got shape {:?}",
                self.name,
                self.shape.len(),
                value.shape()
            )));
        }
        for (axis, (&actual, expected)) in value.shape().iter().zip(&self.shape).enumerate() {
            if let Some(expected) = expected {
                if actual != *expected {
                    return Err(NetError::ShapeMismatch(format!(
                        "'{}' expects {} on axis {}, got shape {:?}",
                        self.name,
                        expected,
                        axis,
                        value.shape()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Values bound to placeholders for one run of the network.
#[derive(Clone, Debug, Default)]
pub struct FeedDict {
    values: HashMap<String, ArrayD<f32>>,
    is_training: bool,
}

impl FeedDict {
    /// Create an empty feed
    pub fn new(is_training: bool) -> Self {
        FeedDict {
            values: HashMap::new(),
            is_training,
        }
    }

    /// Bind `value` to `placeholder` after validating its shape
    pub fn feed(&mut self, placeholder: &Placeholder, value: ArrayD<f32>) -> Result<()> {
        placeholder.check(&value)?;
        self.values.insert(placeholder.name().to_string(), value);
        Ok(())
    }

    /// Builder form of [`FeedDict::feed`]
    pub fn with(mut self, placeholder: &Placeholder, value: ArrayD<f32>) -> Result<Self> {
        self.feed(placeholder, value)?;
        Ok(self)
    }

    /// Value bound to `placeholder`, if any
    pub fn get(&self, placeholder: &Placeholder) -> Option<&ArrayD<f32>> {
        self.values.get(placeholder.name())
    }

    /// Value bound to `placeholder`, or `MissingFeed`
    pub fn require(&self, placeholder: &Placeholder) -> Result<&ArrayD<f32>> {
        self.get(placeholder)
            .ok_or_else(|| NetError::MissingFeed(placeholder.name().to_string()))
    }

    /// Whether `placeholder` has a value
    pub fn contains(&self, placeholder: &Placeholder) -> bool {
        self.values.contains_key(placeholder.name())
    }

    /// Training flag (dropout and similar layers read it)
    pub fn is_training(&self) -> bool {
        self.is_training
    }

    /// Number of bound placeholders
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_placeholder_accepts_any_batch() {
        let ph = Placeholder::new("x", &[None, Some(3)]);
        assert!(ph.check(&ArrayD::zeros(IxDyn(&[7, 3]))).is_ok());
        assert!(ph.check(&ArrayD::zeros(IxDyn(&[1, 3]))).is_ok());
    }

    #[test]
    fn test_placeholder_rejects_bad_shapes() {
        let ph = Placeholder::new("x", &[None, Some(3)]);
        assert!(matches!(
            ph.check(&ArrayD::zeros(IxDyn(&[7, 4]))),
            Err(NetError::ShapeMismatch(_))
        ));
        assert!(ph.check(&ArrayD::zeros(IxDyn(&[7, 3, 1]))).is_err());
    }

    #[test]
    fn test_feed_and_require() {
        let x = Placeholder::new("x", &[None, Some(2)]);
        let t = Placeholder::new("t", &[None, Some(2)]);
        let feed = FeedDict::new(false)
            .with(&x, ArrayD::zeros(IxDyn(&[4, 2])))
            .unwrap();

        assert_eq!(feed.len(), 1);
        assert!(feed.contains(&x));
        assert!(!feed.is_training());
        assert!(matches!(feed.require(&t), Err(NetError::MissingFeed(name)) if name == "t"));
    }
}
