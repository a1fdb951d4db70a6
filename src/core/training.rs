//! Training loop, history and run modes

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::batching::{batch_ranges, WeightedMean};
use super::checkpoint::{restore_latest, Saver};
use super::evaluator::NeuralNetEvaluator;
use super::example_set::ExampleSet;
use super::neural_net::{ModelPhase, NeuralNet};
use crate::nn::{LrSchedule, Optimizer, OptimizerKind};
use crate::{NetError, Result};

/// Training configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Examples per training step
    pub batch_size: usize,
    /// Epoch index to stop before (resumed runs count from their initial epoch)
    pub num_epochs: usize,
    /// Reshuffle the training set every epoch
    pub shuffle: bool,
    /// Seed for shuffling
    pub seed: u64,
    /// Initial learning rate
    pub learning_rate: f32,
    /// Per-epoch learning rate schedule
    pub schedule: LrSchedule,
    /// Optimizer choice
    pub optimizer: OptimizerKind,
    /// Stop after this many epochs without validation loss improvement
    pub early_stopping_patience: Option<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            batch_size: 128,
            num_epochs: 10,
            shuffle: true,
            seed: 42,
            learning_rate: 1e-3,
            schedule: LrSchedule::Constant,
            optimizer: OptimizerKind::Adam,
            early_stopping_patience: None,
        }
    }
}

impl TrainingConfig {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.batch_size == 0 {
            return Err("Batch size must be positive".to_string());
        }
        if self.num_epochs == 0 {
            return Err("Number of epochs must be positive".to_string());
        }
        if self.learning_rate <= 0.0 {
            return Err("Learning rate must be positive".to_string());
        }
        self.schedule.validate()
    }
}

/// Per-epoch curves, in the layout of a Keras `History`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Training loss per epoch
    pub loss: Vec<f32>,
    /// Training accuracy per epoch
    pub acc: Vec<f32>,
    /// Validation loss per epoch
    pub val_loss: Vec<f32>,
    /// Validation accuracy per epoch
    pub val_acc: Vec<f32>,
    /// Best validation loss seen
    pub best_val_loss: Option<f32>,
    /// Epoch (0-based, relative to this history) of the best validation loss
    pub best_epoch: usize,
    /// Wall-clock training time
    pub total_time: Duration,
}

impl TrainingHistory {
    /// Create an empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded epochs
    pub fn epochs(&self) -> usize {
        self.loss.len()
    }

    /// Record one epoch
    pub fn update_epoch(&mut self, loss: f32, acc: f32, validation: Option<(f32, f32)>) {
        self.loss.push(loss);
        self.acc.push(acc);
        if let Some((val_loss, val_acc)) = validation {
            self.val_loss.push(val_loss);
            self.val_acc.push(val_acc);
            if self.best_val_loss.map_or(true, |best| val_loss < best) {
                self.best_val_loss = Some(val_loss);
                self.best_epoch = self.loss.len() - 1;
            }
        }
    }

    /// Whether `patience` epochs passed since the best validation loss
    pub fn should_stop_early(&self, patience: usize) -> bool {
        self.best_val_loss.is_some() && self.epochs() > self.best_epoch + patience
    }

    /// Human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Best validation loss: {} at epoch {}\nTotal training time: {:.2}s\nFinal train loss: {:.4} (acc {:.4})\nFinal val loss: {:.4} (acc {:.4})",
            self.best_val_loss.map_or("n/a".to_string(), |l| format!("{:.4}", l)),
            self.best_epoch + 1,
            self.total_time.as_secs_f32(),
            self.loss.last().unwrap_or(&0.0),
            self.acc.last().unwrap_or(&0.0),
            self.val_loss.last().unwrap_or(&0.0),
            self.val_acc.last().unwrap_or(&0.0)
        )
    }
}

/// One line of the per-epoch summary log
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// 1-based epoch number
    pub epoch: usize,
    /// Training loss
    pub loss: f32,
    /// Training accuracy
    pub acc: f32,
    /// Validation loss, if validated
    pub val_loss: Option<f32>,
    /// Validation accuracy, if validated
    pub val_acc: Option<f32>,
    /// Learning rate used
    pub learning_rate: f32,
    /// Seconds spent in the epoch
    pub elapsed_secs: f32,
}

/// Appends [`EpochSummary`] records as JSON lines.
pub struct SummaryWriter {
    out: BufWriter<File>,
}

impl SummaryWriter {
    /// Create (truncate) `path`
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(SummaryWriter {
            out: BufWriter::new(File::create(path)?),
        })
    }

    /// Write one record and flush
    pub fn write(&mut self, summary: &EpochSummary) -> Result<()> {
        serde_json::to_writer(&mut self.out, summary)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

impl fmt::Debug for SummaryWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SummaryWriter").finish_non_exhaustive()
    }
}

/// How a runner starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    /// Train from freshly initialized weights
    StartTraining,
    /// Restore the latest checkpoint and keep training
    ResumeTraining,
    /// Restore the latest checkpoint and only evaluate / predict
    UseSavedModel,
}

impl TrainingMode {
    /// Build `net` for this mode, restoring from `checkpoint_dir` when needed.
    ///
    /// Returns the epoch training should continue from.
    pub fn prepare<N: NeuralNet>(self, net: &mut N, checkpoint_dir: impl AsRef<Path>) -> Result<usize> {
        match self {
            TrainingMode::StartTraining => {
                net.create_training_model()?;
                Ok(0)
            }
            TrainingMode::ResumeTraining => {
                net.create_training_model()?;
                let epoch = restore_latest(net, checkpoint_dir)?;
                info!("resuming from epoch {}", epoch);
                Ok(epoch)
            }
            TrainingMode::UseSavedModel => {
                net.create_evaluation_model()?;
                restore_latest(net, checkpoint_dir)
            }
        }
    }

    /// Whether the mode runs the training loop
    pub fn trains(self) -> bool {
        !matches!(self, TrainingMode::UseSavedModel)
    }
}

impl FromStr for TrainingMode {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "start" | "start_training" => Ok(TrainingMode::StartTraining),
            "resume" | "resume_training" => Ok(TrainingMode::ResumeTraining),
            "use_saved" | "use_saved_model" => Ok(TrainingMode::UseSavedModel),
            other => Err(NetError::InvalidArgument(format!("unknown training mode '{}'", other))),
        }
    }
}

impl fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainingMode::StartTraining => "start",
            TrainingMode::ResumeTraining => "resume",
            TrainingMode::UseSavedModel => "use-saved",
        };
        f.write_str(name)
    }
}

/// Drives `train_step` over shuffled batches and validates each epoch.
pub struct NeuralNetTrainer {
    config: TrainingConfig,
    optimizer: Box<dyn Optimizer>,
    initial_epoch: usize,
    best_accuracy: Option<f32>,
    summary: Option<SummaryWriter>,
}

impl fmt::Debug for NeuralNetTrainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeuralNetTrainer")
            .field("config", &self.config)
            .field("initial_epoch", &self.initial_epoch)
            .field("best_accuracy", &self.best_accuracy)
            .finish_non_exhaustive()
    }
}

impl NeuralNetTrainer {
    /// Trainer with the optimizer named in `config`
    pub fn new(config: TrainingConfig) -> Result<Self> {
        config.validate().map_err(NetError::InvalidArgument)?;
        let optimizer = config.optimizer.build(config.learning_rate);
        Ok(NeuralNetTrainer {
            config,
            optimizer,
            initial_epoch: 0,
            best_accuracy: None,
            summary: None,
        })
    }

    /// Replace the optimizer
    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Start counting epochs from `epoch`, e.g. after restoring a checkpoint
    pub fn with_initial_epoch(mut self, epoch: usize) -> Self {
        self.initial_epoch = epoch;
        self
    }

    /// Only checkpoint epochs that beat `accuracy`, e.g. the one recorded
    /// with the checkpoint a resumed run starts from
    pub fn with_best_accuracy(mut self, accuracy: Option<f32>) -> Self {
        self.best_accuracy = accuracy;
        self
    }

    /// Write per-epoch summaries
    pub fn with_summary_writer(mut self, writer: SummaryWriter) -> Self {
        self.summary = Some(writer);
        self
    }

    /// Configuration
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Train `net` (built for training) on `train`, validating on `val`.
    ///
    /// When a saver is given, a checkpoint is written whenever validation
    /// accuracy (training accuracy without validation data) improves.
    pub fn train<N: NeuralNet>(
        &mut self,
        net: &mut N,
        train: &N::Examples,
        val: Option<&N::Examples>,
        mut saver: Option<&mut Saver>,
    ) -> Result<TrainingHistory> {
        if net.phase() != Some(ModelPhase::Training) {
            return Err(NetError::NotBuilt("train_op"));
        }
        let num_examples = train.num_examples();
        if num_examples == 0 {
            return Err(NetError::EmptyDataset);
        }
        if !train.has_targets() {
            return Err(NetError::InvalidArgument("training needs examples with targets".into()));
        }

        info!(
            "training on {} examples{} for epochs {}..{}",
            num_examples,
            val.map_or(String::new(), |v| format!(", validating on {}", v.num_examples())),
            self.initial_epoch + 1,
            self.config.num_epochs
        );

        let evaluator = NeuralNetEvaluator::new();
        let mut history = TrainingHistory::new();
        let mut best_acc = self.best_accuracy.unwrap_or(f32::NEG_INFINITY);
        let start = Instant::now();

        for epoch in self.initial_epoch..self.config.num_epochs {
            let epoch_start = Instant::now();
            let lr = self.config.schedule.learning_rate(epoch, self.config.learning_rate);
            self.optimizer.set_learning_rate(lr);

            let mut indices: Vec<usize> = (0..num_examples).collect();
            if self.config.shuffle {
                let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
                indices.shuffle(&mut rng);
            }

            let mut mean = WeightedMean::new();
            for range in batch_ranges(num_examples, self.config.batch_size)? {
                let batch = train.select(&indices[range])?;
                let feed = net.feed_dict(&batch, true)?;
                let score = net.train_step(&feed, self.optimizer.as_mut())?;
                mean.add(score, batch.num_examples());
            }
            let score = mean.finish(num_examples)?;

            let validation = match val {
                Some(val) if !val.is_empty() => {
                    let s = evaluator.evaluate(net, val, Some(self.config.batch_size))?;
                    Some((s.loss, s.accuracy))
                }
                _ => None,
            };
            history.update_epoch(score.loss, score.accuracy, validation);

            match validation {
                Some((val_loss, val_acc)) => info!(
                    "Epoch {}/{}: loss={:.4} acc={:.4} val_loss={:.4} val_acc={:.4} lr={:.2e}",
                    epoch + 1,
                    self.config.num_epochs,
                    score.loss,
                    score.accuracy,
                    val_loss,
                    val_acc,
                    lr
                ),
                None => info!(
                    "Epoch {}/{}: loss={:.4} acc={:.4} lr={:.2e}",
                    epoch + 1,
                    self.config.num_epochs,
                    score.loss,
                    score.accuracy,
                    lr
                ),
            }

            let monitored = validation.map_or(score.accuracy, |(_, acc)| acc);
            if monitored > best_acc {
                best_acc = monitored;
                if let Some(saver) = saver.as_deref_mut() {
                    saver.save_with_accuracy(&*net, epoch + 1, Some(monitored))?;
                }
            }

            if let Some(writer) = self.summary.as_mut() {
                let record = EpochSummary {
                    epoch: epoch + 1,
                    loss: score.loss,
                    acc: score.accuracy,
                    val_loss: validation.map(|v| v.0),
                    val_acc: validation.map(|v| v.1),
                    learning_rate: lr,
                    elapsed_secs: epoch_start.elapsed().as_secs_f32(),
                };
                if let Err(e) = writer.write(&record) {
                    warn!("could not write epoch summary: {}", e);
                }
            }

            if let Some(patience) = self.config.early_stopping_patience {
                if history.should_stop_early(patience) {
                    info!("Early stopping at epoch {}", epoch + 1);
                    break;
                }
            }
        }

        history.total_time = start.elapsed();
        info!("Training complete\n{}", history.summary());
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::evaluator::tests::{column, MeanNet};
    use crate::core::{latest_accuracy, latest_checkpoint, BatchScore, FeedDict, LabeledData, StateDict};
    use ndarray::{ArrayD, IxDyn};
    use tempfile::TempDir;

    /// Fits a single weight `w` to minimise `mean((w - x)^2)`.
    struct MeanFit {
        mean: MeanNet,
        w: f32,
        phase: Option<ModelPhase>,
        batch_sizes: Vec<usize>,
    }

    impl MeanFit {
        fn new() -> Self {
            MeanFit {
                mean: MeanNet::new(),
                w: 0.0,
                phase: None,
                batch_sizes: Vec::new(),
            }
        }

        fn score(&self, feed: &FeedDict) -> Result<BatchScore> {
            let x = feed.require(&self.mean.input)?;
            let loss = x.iter().map(|v| (self.w - v).powi(2)).sum::<f32>() / x.len() as f32;
            Ok(BatchScore::new(loss, 1.0 / (1.0 + loss)))
        }
    }

    impl NeuralNet for MeanFit {
        type Examples = LabeledData;

        fn build(&mut self, phase: ModelPhase) -> Result<()> {
            self.phase = Some(phase);
            Ok(())
        }

        fn phase(&self) -> Option<ModelPhase> {
            self.phase
        }

        fn feed_dict(&self, examples: &LabeledData, is_training: bool) -> Result<FeedDict> {
            self.mean.feed_dict(examples, is_training)
        }

        fn model_output(&mut self, feed: &FeedDict) -> Result<ArrayD<f32>> {
            let n = feed.require(&self.mean.input)?.shape()[0];
            Ok(ArrayD::from_elem(IxDyn(&[n, 1]), self.w))
        }

        fn loss_and_accuracy(&mut self, feed: &FeedDict) -> Result<BatchScore> {
            self.score(feed)
        }

        fn train_step(&mut self, feed: &FeedDict, optimizer: &mut dyn Optimizer) -> Result<BatchScore> {
            let score = self.score(feed)?;
            let x = feed.require(&self.mean.input)?;
            self.batch_sizes.push(x.len());
            let grad = x.iter().map(|v| 2.0 * (self.w - v)).sum::<f32>() / x.len() as f32;
            let mut w = ArrayD::from_elem(IxDyn(&[1]), self.w);
            optimizer.update("w", w.view_mut(), ArrayD::from_elem(IxDyn(&[1]), grad).view());
            self.w = w[[0]];
            Ok(score)
        }

        fn state_dict(&self) -> StateDict {
            let mut state = StateDict::new();
            state.insert("w".into(), ArrayD::from_elem(IxDyn(&[1]), self.w));
            state
        }

        fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
            self.w = state.get("w").map(|w| w[[0]]).unwrap_or(0.0);
            Ok(())
        }
    }

    fn data(values: &[f32]) -> LabeledData {
        LabeledData::new(column(values), column(values)).unwrap()
    }

    fn sgd_config(num_epochs: usize, batch_size: usize) -> TrainingConfig {
        TrainingConfig {
            batch_size,
            num_epochs,
            learning_rate: 0.1,
            optimizer: OptimizerKind::Sgd { momentum: 0.0 },
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_requires_training_phase() {
        let mut net = MeanFit::new();
        let mut trainer = NeuralNetTrainer::new(sgd_config(1, 2)).unwrap();
        assert!(matches!(
            trainer.train(&mut net, &data(&[1.0]), None, None),
            Err(NetError::NotBuilt("train_op"))
        ));
    }

    #[test]
    fn test_converges_and_records_history() {
        let mut net = MeanFit::new();
        net.create_training_model().unwrap();
        let train = data(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let val = data(&[3.0, 3.0]);

        let mut trainer = NeuralNetTrainer::new(sgd_config(30, 2)).unwrap();
        let history = trainer.train(&mut net, &train, Some(&val), None).unwrap();

        assert_eq!(history.epochs(), 30);
        assert_eq!(history.val_acc.len(), 30);
        assert!((net.w - 3.0).abs() < 1.0, "w = {}", net.w);
        assert!(history.val_loss.last().unwrap() < &history.val_loss[0]);
        // 5 examples in batches of 2: 2, 2, 1 per epoch.
        assert_eq!(&net.batch_sizes[..3], &[2, 2, 1]);
    }

    #[test]
    fn test_checkpoints_on_improvement_and_resume() {
        let dir = TempDir::new().unwrap();
        let mut saver = Saver::new(dir.path()).unwrap();
        let mut net = MeanFit::new();
        net.create_training_model().unwrap();
        let train = data(&[2.0, 2.0]);

        let mut trainer = NeuralNetTrainer::new(sgd_config(3, 2)).unwrap();
        trainer.train(&mut net, &train, Some(&train), Some(&mut saver)).unwrap();
        let latest = latest_checkpoint(dir.path()).unwrap().unwrap();
        assert!(latest.ends_with("model.ckpt-3.json"));

        let mut resumed = MeanFit::new();
        let epoch = TrainingMode::ResumeTraining.prepare(&mut resumed, dir.path()).unwrap();
        assert_eq!(epoch, 3);
        assert!((resumed.w - net.w).abs() < 1e-6);

        let mut trainer = NeuralNetTrainer::new(sgd_config(5, 2)).unwrap().with_initial_epoch(epoch);
        let history = trainer.train(&mut resumed, &train, None, None).unwrap();
        assert_eq!(history.epochs(), 2);
    }

    #[test]
    fn test_resume_keeps_better_checkpoint() {
        let dir = TempDir::new().unwrap();
        let train = data(&[2.0, 2.0]);
        let mut saver = Saver::new(dir.path()).unwrap();
        let mut fitted = MeanFit::new();
        fitted.w = 2.0;
        saver.save_with_accuracy(&fitted, 3, Some(1.0)).unwrap();

        let mut resumed = MeanFit::new();
        let epoch = TrainingMode::ResumeTraining.prepare(&mut resumed, dir.path()).unwrap();
        resumed.w = 0.0;
        let mut trainer = NeuralNetTrainer::new(sgd_config(4, 2))
            .unwrap()
            .with_initial_epoch(epoch)
            .with_best_accuracy(latest_accuracy(dir.path()).unwrap());
        trainer.train(&mut resumed, &train, None, Some(&mut saver)).unwrap();

        let latest = latest_checkpoint(dir.path()).unwrap().unwrap();
        assert!(latest.ends_with("model.ckpt-3.json"));
        assert_eq!(latest_accuracy(dir.path()).unwrap(), Some(1.0));
    }

    #[test]
    fn test_invalid_schedule_rejected() {
        let config = TrainingConfig {
            schedule: LrSchedule::DropBased {
                drop_rate: 0.5,
                epoch_drop: 0.0,
            },
            ..TrainingConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(NeuralNetTrainer::new(config).is_err());
    }

    #[test]
    fn test_early_stopping() {
        let mut history = TrainingHistory::new();
        history.update_epoch(1.0, 0.5, Some((0.9, 0.5)));
        history.update_epoch(0.8, 0.6, Some((0.7, 0.6)));
        history.update_epoch(0.6, 0.7, Some((0.8, 0.6)));
        assert_eq!(history.best_epoch, 1);
        assert!(history.should_stop_early(1));
        assert!(!history.should_stop_early(2));
        history.update_epoch(0.5, 0.7, Some((0.75, 0.6)));
        assert!(history.should_stop_early(2));
    }

    #[test]
    fn test_summary_writer_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("summary.jsonl");
        let mut net = MeanFit::new();
        net.create_training_model().unwrap();

        let mut trainer = NeuralNetTrainer::new(sgd_config(2, 4))
            .unwrap()
            .with_summary_writer(SummaryWriter::create(&path).unwrap());
        trainer.train(&mut net, &data(&[1.0, 3.0]), None, None).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let records: Vec<EpochSummary> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].epoch, 2);
        assert!(records[0].val_loss.is_none());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("resume".parse::<TrainingMode>().unwrap(), TrainingMode::ResumeTraining);
        assert_eq!("use-saved".parse::<TrainingMode>().unwrap(), TrainingMode::UseSavedModel);
        assert_eq!("START_TRAINING".parse::<TrainingMode>().unwrap(), TrainingMode::StartTraining);
        assert!("later".parse::<TrainingMode>().is_err());
        assert!(!TrainingMode::UseSavedModel.trains());
    }
}
