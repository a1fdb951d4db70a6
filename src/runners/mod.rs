//! End-to-end runs: build, train, checkpoint, evaluate and infer
//!
//! Every runner follows the same script. A training net is built (and
//! restored when resuming), trained with checkpoints, and then separate
//! evaluation and inference nets are built and restored from the latest
//! checkpoint, mirroring one graph per phase.

mod densenet;
mod mnist;
mod reverse;

use log::{info, warn};

use crate::core::{
    latest_accuracy, restore_latest, BatchScore, ExampleSet, NeuralNet, NeuralNetEvaluator,
    NeuralNetTrainer, RunConfig, Saver, SummaryWriter, TrainingHistory, TrainingMode,
};
use crate::utils::timing::Timer;
use crate::utils::{display_train_history, save_train_history, RunDirs};
use crate::{NetError, Result};

pub use densenet::run_fc_densenet;
pub use mnist::run_mnist;
pub use reverse::run_reverse_function;

/// Outcome of a run
#[derive(Clone, Debug)]
pub struct RunReport {
    /// Directories the run wrote to
    pub dirs: RunDirs,
    /// Curves, when the run trained
    pub history: Option<TrainingHistory>,
    /// Score of the restored model on the validation data
    pub evaluation: BatchScore,
    /// Human-readable inference results
    pub inferences: Vec<String>,
}

fn prepare_dirs(config: &RunConfig) -> Result<RunDirs> {
    config.validate().map_err(NetError::InvalidArgument)?;
    let dirs = RunDirs::new(
        &config.result_dir,
        &config.log_dir,
        &config.name,
        config.run_suffix.as_deref(),
    );
    dirs.create()?;
    info!("model directory: {}", dirs.model.display());
    Ok(dirs)
}

/// Train (when the mode asks for it), then evaluate a freshly restored net.
///
/// Returns the history and the evaluation score.
fn train_and_evaluate<N, F>(
    make: &F,
    config: &RunConfig,
    dirs: &RunDirs,
    train: &N::Examples,
    val: &N::Examples,
) -> Result<(Option<TrainingHistory>, BatchScore)>
where
    N: NeuralNet,
    F: Fn() -> Result<N>,
{
    let history = if config.mode.trains() {
        info!("{} training", config.mode);
        let mut net = make()?;
        let initial_epoch = config.mode.prepare(&mut net, &dirs.model)?;
        let mut saver = Saver::with_max_to_keep(&dirs.model, config.max_to_keep)?;
        let summary = SummaryWriter::create(dirs.train_summary.join("summary.jsonl"))?;
        let best_accuracy = match config.mode {
            TrainingMode::ResumeTraining => latest_accuracy(&dirs.model)?,
            _ => None,
        };
        let mut trainer = NeuralNetTrainer::new(config.training.clone())?
            .with_initial_epoch(initial_epoch)
            .with_best_accuracy(best_accuracy)
            .with_summary_writer(summary);

        let history = trainer.train(&mut net, train, Some(val), Some(&mut saver))?;
        display_train_history(&history);
        save_train_history(&history, &dirs.inference)?;
        Some(history)
    } else {
        info!("using the saved model in {}", dirs.model.display());
        None
    };

    let mut net = make()?;
    net.create_evaluation_model()?;
    restore_latest(&mut net, &dirs.model)?;

    let examples = if val.is_empty() {
        warn!("no validation data; evaluating on the training set");
        train
    } else {
        val
    };
    let timer = Timer::new("evaluation");
    let score = NeuralNetEvaluator::new().evaluate(&mut net, examples, config.eval_batch_size)?;
    timer.report();
    info!("evaluation: loss = {:.4}, accuracy = {:.4}", score.loss, score.accuracy);
    Ok((history, score))
}

/// A net built for inference and restored from the latest checkpoint
fn inference_net<N, F>(make: &F, dirs: &RunDirs) -> Result<N>
where
    N: NeuralNet,
    F: Fn() -> Result<N>,
{
    let mut net = make()?;
    net.create_inference_model()?;
    restore_latest(&mut net, &dirs.model)?;
    Ok(net)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::TrainingConfig;
    use std::path::Path;

    /// Small, fast settings rooted at `root`
    pub(crate) fn tiny_config(root: &Path, name: &str) -> RunConfig {
        RunConfig {
            name: name.to_string(),
            result_dir: root.join("result"),
            log_dir: root.join("log"),
            run_suffix: Some("test".to_string()),
            synthetic_examples: 40,
            eval_batch_size: Some(8),
            max_to_keep: 2,
            training: TrainingConfig {
                batch_size: 8,
                num_epochs: 2,
                ..TrainingConfig::default()
            },
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_prepare_dirs_rejects_bad_config() {
        let root = tempfile::TempDir::new().unwrap();
        let mut config = tiny_config(root.path(), "bad");
        config.max_to_keep = 0;
        assert!(prepare_dirs(&config).is_err());

        config.max_to_keep = 1;
        let dirs = prepare_dirs(&config).unwrap();
        assert!(dirs.model.ends_with("bad_model_test"));
        assert!(dirs.train_summary.is_dir());
    }
}
