//! The `NeuralNet` calling convention shared by every model

use std::collections::BTreeMap;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use super::batching::BatchScore;
use super::example_set::ExampleSet;
use super::feed::FeedDict;
use crate::nn::Optimizer;
use crate::{NetError, Result};

/// Named parameter tensors, the unit of checkpointing
pub type StateDict = BTreeMap<String, ArrayD<f32>>;

/// What a model was built for.
///
/// `model_output` exists in every phase; loss and accuracy only in training
/// and evaluation; parameter updates only in training.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelPhase {
    /// Forward, loss, accuracy and parameter updates
    Training,
    /// Forward, loss and accuracy
    Evaluation,
    /// Forward only
    Inference,
}

impl ModelPhase {
    /// Whether loss and accuracy are defined
    pub fn has_targets(self) -> bool {
        !matches!(self, ModelPhase::Inference)
    }
}

/// Tracks the phase a model was built in and guards access to its outputs.
#[derive(Clone, Debug, Default)]
pub struct PhaseState {
    phase: Option<ModelPhase>,
}

impl PhaseState {
    /// Record the build phase
    pub fn set(&mut self, phase: ModelPhase) {
        self.phase = Some(phase);
    }

    /// Build phase, if built
    pub fn get(&self) -> Option<ModelPhase> {
        self.phase
    }

    /// Fails unless the model was built at all
    pub fn require_built(&self, what: &'static str) -> Result<ModelPhase> {
        self.phase.ok_or(NetError::NotBuilt(what))
    }

    /// Fails unless loss/accuracy are defined
    pub fn require_targets(&self, what: &'static str) -> Result<ModelPhase> {
        match self.phase {
            Some(phase) if phase.has_targets() => Ok(phase),
            _ => Err(NetError::NotBuilt(what)),
        }
    }

    /// Fails unless built for training
    pub fn require_training(&self) -> Result<()> {
        match self.phase {
            Some(ModelPhase::Training) => Ok(()),
            _ => Err(NetError::NotBuilt("train_op")),
        }
    }
}

/// A network together with its placeholders.
///
/// Implementors build their graph for one [`ModelPhase`], turn raw examples
/// into a [`FeedDict`], and evaluate outputs, loss and accuracy on a feed.
pub trait NeuralNet {
    /// Raw data this net is fed from
    type Examples: ExampleSet;

    /// Build the model for `phase`
    fn build(&mut self, phase: ModelPhase) -> Result<()>;

    /// Phase the model was built in, if any
    fn phase(&self) -> Option<ModelPhase>;

    /// Build for training
    fn create_training_model(&mut self) -> Result<()> {
        self.build(ModelPhase::Training)
    }

    /// Build for evaluation
    fn create_evaluation_model(&mut self) -> Result<()> {
        self.build(ModelPhase::Evaluation)
    }

    /// Build for inference
    fn create_inference_model(&mut self) -> Result<()> {
        self.build(ModelPhase::Inference)
    }

    /// Map examples onto placeholders. Targets are fed only when present.
    fn feed_dict(&self, examples: &Self::Examples, is_training: bool) -> Result<FeedDict>;

    /// Forward pass
    fn model_output(&mut self, feed: &FeedDict) -> Result<ArrayD<f32>>;

    /// Loss and accuracy from a single forward pass
    fn loss_and_accuracy(&mut self, feed: &FeedDict) -> Result<BatchScore>;

    /// Mean loss over the fed batch
    fn loss(&mut self, feed: &FeedDict) -> Result<f32> {
        Ok(self.loss_and_accuracy(feed)?.loss)
    }

    /// Mean accuracy over the fed batch
    fn accuracy(&mut self, feed: &FeedDict) -> Result<f32> {
        Ok(self.loss_and_accuracy(feed)?.accuracy)
    }

    /// Forward, backward and one optimizer step; returns the batch score
    fn train_step(&mut self, feed: &FeedDict, optimizer: &mut dyn Optimizer) -> Result<BatchScore>;

    /// Snapshot of all trainable parameters
    fn state_dict(&self) -> StateDict;

    /// Restore parameters written by [`NeuralNet::state_dict`]
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_guards() {
        let mut state = PhaseState::default();
        assert!(matches!(state.require_built("model_output"), Err(NetError::NotBuilt("model_output"))));
        assert!(state.require_targets("loss").is_err());

        state.set(ModelPhase::Inference);
        assert!(state.require_built("model_output").is_ok());
        assert!(matches!(state.require_targets("accuracy"), Err(NetError::NotBuilt("accuracy"))));
        assert!(state.require_training().is_err());

        state.set(ModelPhase::Evaluation);
        assert!(state.require_targets("loss").is_ok());
        assert!(state.require_training().is_err());

        state.set(ModelPhase::Training);
        assert!(state.require_training().is_ok());
    }
}
