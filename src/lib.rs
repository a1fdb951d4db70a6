//! # nn-runner: a common calling convention for neural network experiments
//!
//! Models own their placeholders and build a [`FeedDict`](core::FeedDict) from
//! raw arrays. Trainers, evaluators and predictors only speak that convention,
//! so a runner can swap a CNN for an encoder-decoder without touching the loop.
//!
//! ## Features
//!
//! - **Core convention**: placeholders, feed dictionaries, model phases
//! - **Batched loops**: training, weighted-average evaluation, prediction
//! - **Layers**: dense, convolution, pooling, RNN and attention with backprop
//! - **Models**: MNIST CNN, seq2seq encoder-decoder, FC-DenseNet
//! - **Data**: MNIST IDX files, reverse-function strings, image patches
//! - **Runners**: train/resume/use-saved scripts behind the `nn-runner` CLI

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Feed convention, trainer, evaluator, predictor and checkpoints
pub mod core;

/// Layers, losses and optimizers
pub mod nn;

/// Concrete network architectures
pub mod models;

/// Dataset readers and generators
pub mod data;

/// Utility functions and helpers
pub mod utils;

/// End-to-end MNIST, reverse-function and segmentation runs
pub mod runners;

// Re-export commonly used types
pub use core::{
    BatchScore, FeedDict, LabeledData, ModelPhase, NeuralNet, NeuralNetEvaluator,
    NeuralNetPredictor, NeuralNetTrainer, Placeholder, SequencePairs,
};

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Array shape does not match what a placeholder or layer expects
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A placeholder the computation depends on was not fed
    #[error("Placeholder '{0}' was not fed")]
    MissingFeed(String),

    /// The requested tensor is not defined for the phase the model was built in
    #[error("Model {0} is not available: build the model in a phase that defines it")]
    NotBuilt(&'static str),

    /// A batched loop was asked to run over zero examples
    #[error("Dataset is empty")]
    EmptyDataset,

    /// Invalid argument or configuration value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Checkpoint missing or inconsistent with the model
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Image decoding or encoding error
    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),

    /// Figure rendering error
    #[error("Plot error: {0}")]
    Plot(String),

    /// ndarray reshape/dimensionality error
    #[error("Array error: {0}")]
    ArrayError(#[from] ndarray::ShapeError),
}

/// Result type for the library
pub type Result<T> = std::result::Result<T, NetError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        core::{
            BatchScore, ExampleSet, FeedDict, LabeledData, ModelPhase, NeuralNet,
            NeuralNetEvaluator, NeuralNetPredictor, NeuralNetTrainer, Placeholder, RunConfig,
            Saver, SequencePairs, TrainingHistory, TrainingMode,
        },
        models::{CnnModel, EncoderDecoder, FcDenseNet},
        nn::{Adam, Optimizer, Sgd},
        NetError, Result,
    };
}
