//! Toy seq2seq task: learn to reverse character strings

use ndarray::{s, Array3, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::train_test_split;
use crate::core::SequencePairs;
use crate::nn::argmax_last;
use crate::{NetError, Result};

/// Generation parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverseFunctionConfig {
    /// Alphabet the strings are drawn from
    pub characters: String,
    /// Longest string; shorter ones are padded
    pub max_token_len: usize,
    /// Number of generated strings
    pub num_examples: usize,
    /// Fraction held out for validation
    pub test_fraction: f32,
    /// Generation and split seed
    pub seed: u64,
}

impl Default for ReverseFunctionConfig {
    fn default() -> Self {
        ReverseFunctionConfig {
            characters: "abcd".to_string(),
            max_token_len: 8,
            num_examples: 1000,
            test_fraction: 0.2,
            seed: 42,
        }
    }
}

impl ReverseFunctionConfig {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.characters.is_empty() {
            return Err("Alphabet must not be empty".to_string());
        }
        if self.max_token_len == 0 {
            return Err("Maximum token length must be positive".to_string());
        }
        if self.num_examples == 0 {
            return Err("Number of examples must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.test_fraction) {
            return Err("Test fraction must be in [0, 1)".to_string());
        }
        Ok(())
    }
}

/// One-hot codec between strings and `(n, max_token_len, vocab_size)` arrays.
///
/// Symbol 0 is padding; the characters follow in alphabet order.
#[derive(Clone, Debug)]
pub struct ReverseFunctionDataset {
    characters: Vec<char>,
    max_token_len: usize,
}

impl ReverseFunctionDataset {
    /// Codec over `characters`
    pub fn new(characters: &str, max_token_len: usize) -> Result<Self> {
        let characters: Vec<char> = characters.chars().collect();
        if characters.is_empty() || max_token_len == 0 {
            return Err(NetError::InvalidArgument(
                "need a non-empty alphabet and a positive token length".into(),
            ));
        }
        Ok(ReverseFunctionDataset {
            characters,
            max_token_len,
        })
    }

    /// One-hot width: the alphabet plus padding
    pub fn vocab_size(&self) -> usize {
        self.characters.len() + 1
    }

    /// Padded sequence length
    pub fn max_token_len(&self) -> usize {
        self.max_token_len
    }

    fn symbol(&self, c: char) -> Result<usize> {
        self.characters
            .iter()
            .position(|&x| x == c)
            .map(|i| i + 1)
            .ok_or_else(|| NetError::InvalidArgument(format!("character '{}' is not in the alphabet", c)))
    }

    /// Strings to padded one-hot sequences
    pub fn to_numeric_data<S: AsRef<str>>(&self, strs: &[S]) -> Result<Array3<f32>> {
        let mut data = Array3::<f32>::zeros((strs.len(), self.max_token_len, self.vocab_size()));
        for (i, s) in strs.iter().enumerate() {
            let s = s.as_ref();
            let len = s.chars().count();
            if len > self.max_token_len {
                return Err(NetError::InvalidArgument(format!(
                    "'{}' is longer than {} characters",
                    s, self.max_token_len
                )));
            }
            for (t, c) in s.chars().enumerate() {
                data[[i, t, self.symbol(c)?]] = 1.0;
            }
            for t in len..self.max_token_len {
                data[[i, t, 0]] = 1.0;
            }
        }
        Ok(data)
    }

    /// Most probable symbol per step back to strings, dropping padding
    pub fn to_char_strings(&self, probabilities: ArrayView3<f32>) -> Vec<String> {
        probabilities
            .axis_iter(Axis(0))
            .map(|seq| {
                argmax_last(seq)
                    .iter()
                    .filter(|&&symbol| symbol > 0)
                    .filter_map(|&symbol| self.characters.get(symbol - 1))
                    .collect()
            })
            .collect()
    }

    /// Random strings with lengths uniform in `1..=max_token_len`
    pub fn random_strings(&self, num_examples: usize, rng: &mut impl Rng) -> Vec<String> {
        (0..num_examples)
            .map(|_| {
                let len = rng.gen_range(1..=self.max_token_len);
                (0..len)
                    .map(|_| self.characters[rng.gen_range(0..self.characters.len())])
                    .collect()
            })
            .collect()
    }

    /// Encoder inputs, teacher-forcing decoder inputs and reversed targets.
    ///
    /// Decoder inputs are the targets shifted one step right behind an
    /// all-zero start symbol.
    pub fn to_sequence_pairs<S: AsRef<str>>(&self, strs: &[S]) -> Result<SequencePairs> {
        let reversed: Vec<String> = strs.iter().map(|s| s.as_ref().chars().rev().collect()).collect();
        let encoder_inputs = self.to_numeric_data(strs)?;
        let decoder_outputs = self.to_numeric_data(&reversed)?;

        let mut decoder_inputs = Array3::<f32>::zeros(decoder_outputs.dim());
        decoder_inputs
            .slice_mut(s![.., 1.., ..])
            .assign(&decoder_outputs.slice(s![.., ..-1, ..]));

        SequencePairs::new(
            encoder_inputs.into_dyn(),
            decoder_inputs.into_dyn(),
            decoder_outputs.into_dyn(),
        )
    }

    /// Generate strings and split them into `(train, validation)` pairs
    pub fn generate_dataset(&self, config: &ReverseFunctionConfig) -> Result<(SequencePairs, SequencePairs)> {
        config.validate().map_err(NetError::InvalidArgument)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let strs = self.random_strings(config.num_examples, &mut rng);
        let pairs = self.to_sequence_pairs(&strs)?;
        train_test_split(&pairs, config.test_fraction, config.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExampleSet;

    fn dataset() -> ReverseFunctionDataset {
        ReverseFunctionDataset::new("abcd", 4).unwrap()
    }

    #[test]
    fn test_numeric_roundtrip_drops_padding() {
        let ds = dataset();
        let data = ds.to_numeric_data(&["abc", "d"]).unwrap();
        assert_eq!(data.dim(), (2, 4, 5));
        assert_eq!(data[[0, 2, 3]], 1.0);
        assert_eq!(data[[1, 1, 0]], 1.0);
        assert_eq!(ds.to_char_strings(data.view()), vec!["abc".to_string(), "d".to_string()]);
    }

    #[test]
    fn test_rejects_unknown_or_long_strings() {
        let ds = dataset();
        assert!(ds.to_numeric_data(&["abx"]).is_err());
        assert!(ds.to_numeric_data(&["abcda"]).is_err());
    }

    #[test]
    fn test_sequence_pairs_are_reversed_and_shifted() {
        let ds = dataset();
        let pairs = ds.to_sequence_pairs(&["abc"]).unwrap();
        let outputs = pairs.decoder_outputs.as_ref().unwrap();
        let inputs = pairs.decoder_inputs.as_ref().unwrap();

        // Targets read "cba" then padding.
        assert_eq!(outputs[[0, 0, 3]], 1.0);
        assert_eq!(outputs[[0, 2, 1]], 1.0);
        assert_eq!(outputs[[0, 3, 0]], 1.0);
        // Start symbol is all zeros, then the targets follow.
        assert!(inputs.slice(s![0, 0, ..]).iter().all(|&v| v == 0.0));
        assert_eq!(inputs[[0, 1, 3]], 1.0);
    }

    #[test]
    fn test_generate_dataset_split() {
        let ds = dataset();
        let config = ReverseFunctionConfig {
            max_token_len: 4,
            num_examples: 50,
            ..ReverseFunctionConfig::default()
        };
        let (train, val) = ds.generate_dataset(&config).unwrap();
        assert_eq!(train.num_examples(), 40);
        assert_eq!(val.num_examples(), 10);
        assert!(train.has_targets());
    }
}
