//! The calling convention shared by every network, and the loops built on it

mod batching;
mod checkpoint;
mod evaluator;
mod example_set;
mod feed;
mod model_config;
mod neural_net;
mod predictor;
mod training;

pub use batching::{batch_ranges, BatchScore, WeightedMean};
pub use checkpoint::{latest_accuracy, latest_checkpoint, restore_latest, CheckpointFile, Saver};
pub use evaluator::NeuralNetEvaluator;
pub use example_set::{ExampleSet, LabeledData, SequencePairs};
pub use feed::{FeedDict, Placeholder};
pub use model_config::RunConfig;
pub use neural_net::{ModelPhase, NeuralNet, PhaseState, StateDict};
pub use predictor::NeuralNetPredictor;
pub use training::{
    EpochSummary, NeuralNetTrainer, SummaryWriter, TrainingConfig, TrainingHistory, TrainingMode,
};
