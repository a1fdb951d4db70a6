//! Run configuration shared by the runner subcommands

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::training::{TrainingConfig, TrainingMode};
use crate::data::{PatchConfig, ReverseFunctionConfig};
use crate::models::{CnnConfig, EncoderDecoderConfig, FcDenseNetConfig};
use crate::{NetError, Result};

/// Everything a runner needs: directories, loop settings and per-model
/// hyper-parameters. Unset fields take their defaults when loaded from JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Prefix of the run directories
    pub name: String,
    /// Start, resume or reuse a saved model
    pub mode: TrainingMode,
    /// Dataset location; runners fall back to generated data when unset
    pub data_dir: Option<PathBuf>,
    /// Examples generated when `data_dir` is unset
    pub synthetic_examples: usize,
    /// Root of model and inference directories
    pub result_dir: PathBuf,
    /// Root of summary directories
    pub log_dir: PathBuf,
    /// Reuse the directories of an earlier run with this timestamp suffix
    pub run_suffix: Option<String>,
    /// Share of the data held out for validation
    pub validation_split: f32,
    /// Evaluation and prediction batch size; whole set at once when unset
    pub eval_batch_size: Option<usize>,
    /// Checkpoints retained on disk
    pub max_to_keep: usize,
    /// Training loop
    pub training: TrainingConfig,
    /// MNIST classifier
    pub cnn: CnnConfig,
    /// Sequence-to-sequence model
    pub encoder_decoder: EncoderDecoderConfig,
    /// Dense-prediction model
    pub fc_densenet: FcDenseNetConfig,
    /// Reverse-function data
    pub reverse: ReverseFunctionConfig,
    /// Image patching
    pub patches: PatchConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            name: "run".to_string(),
            mode: TrainingMode::StartTraining,
            data_dir: None,
            synthetic_examples: 1000,
            result_dir: PathBuf::from("result"),
            log_dir: PathBuf::from("log"),
            run_suffix: None,
            validation_split: 0.2,
            eval_batch_size: Some(256),
            max_to_keep: 5,
            training: TrainingConfig::default(),
            cnn: CnnConfig::default(),
            encoder_decoder: EncoderDecoderConfig::default(),
            fc_densenet: FcDenseNetConfig::default(),
            reverse: ReverseFunctionConfig::default(),
            patches: PatchConfig::default(),
        }
    }
}

impl RunConfig {
    /// Settings of the reverse-function example: small batches, many epochs
    pub fn for_reverse_function() -> Self {
        RunConfig {
            name: "reverse_function_encdec".to_string(),
            training: TrainingConfig {
                batch_size: 4,
                num_epochs: 150,
                ..TrainingConfig::default()
            },
            eval_batch_size: Some(4),
            ..RunConfig::default()
        }
    }

    /// Settings of the MNIST example
    pub fn for_mnist() -> Self {
        RunConfig {
            name: "mnist_cnn".to_string(),
            training: TrainingConfig {
                batch_size: 128,
                num_epochs: 20,
                ..TrainingConfig::default()
            },
            ..RunConfig::default()
        }
    }

    /// Settings of the plant segmentation example
    pub fn for_fc_densenet() -> Self {
        RunConfig {
            name: "fc-densenet".to_string(),
            training: TrainingConfig {
                batch_size: 12,
                num_epochs: 50,
                ..TrainingConfig::default()
            },
            eval_batch_size: Some(12),
            ..RunConfig::default()
        }
    }

    /// Load from a JSON file and validate
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: RunConfig = crate::utils::load_json(path)?;
        config.validate().map_err(NetError::InvalidArgument)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.is_empty() {
            return Err("Run name must not be empty".to_string());
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err("Validation split must be in [0, 1)".to_string());
        }
        if self.data_dir.is_none() && self.synthetic_examples == 0 {
            return Err("Need a data directory or synthetic examples".to_string());
        }
        if self.eval_batch_size == Some(0) {
            return Err("Evaluation batch size must be positive".to_string());
        }
        if self.max_to_keep == 0 {
            return Err("At least one checkpoint must be kept".to_string());
        }

        self.training.validate()?;
        self.cnn.validate()?;
        self.encoder_decoder.validate()?;
        self.fc_densenet.validate()?;
        self.reverse.validate()?;
        self.patches.validate()?;
        Ok(())
    }
}
