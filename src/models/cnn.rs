//! Two-stage convolutional classifier for small grayscale images (MNIST)

use ndarray::{Array2, Array4, ArrayD, ArrayView4, Ix4};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::score_rows;
use crate::core::{
    BatchScore, FeedDict, LabeledData, ModelPhase, NeuralNet, PhaseState, Placeholder, StateDict,
};
use crate::nn::{
    softmax, Conv2d, Dense, Dropout, MaxPool2d, Optimizer, Padding, Parameterized, Relu,
};
use crate::{NetError, Result};

/// CNN hyper-parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CnnConfig {
    /// Input height
    pub image_height: usize,
    /// Input width
    pub image_width: usize,
    /// Input channels
    pub channels: usize,
    /// Output classes
    pub num_classes: usize,
    /// Filters of the first convolution
    pub conv1_filters: usize,
    /// Filters of the second convolution
    pub conv2_filters: usize,
    /// Square kernel size of both convolutions
    pub kernel_size: usize,
    /// Width of the hidden dense layer
    pub hidden_units: usize,
    /// Dropout before the classifier, applied only in training feeds
    pub dropout: f32,
    /// Seed for initialization and dropout
    pub seed: u64,
}

impl Default for CnnConfig {
    fn default() -> Self {
        CnnConfig {
            image_height: 28,
            image_width: 28,
            channels: 1,
            num_classes: 10,
            conv1_filters: 32,
            conv2_filters: 64,
            kernel_size: 5,
            hidden_units: 256,
            dropout: 0.5,
            seed: 42,
        }
    }
}

impl CnnConfig {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.image_height == 0 || self.image_width == 0 || self.channels == 0 {
            return Err("Image dimensions must be positive".to_string());
        }
        if self.num_classes < 2 {
            return Err("Need at least two classes".to_string());
        }
        if self.conv1_filters == 0 || self.conv2_filters == 0 || self.hidden_units == 0 {
            return Err("Layer widths must be positive".to_string());
        }
        if self.kernel_size == 0 {
            return Err("Kernel size must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err("Dropout must be in [0, 1)".to_string());
        }
        Ok(())
    }
}

/// `conv-relu-pool` twice, then `dense-relu-dropout-dense`.
///
/// Feeds `(batch, height, width, channels)` images and one-hot labels;
/// `model_output` is the class probability matrix.
#[derive(Clone, Debug)]
pub struct CnnModel {
    config: CnnConfig,
    phase: PhaseState,
    input: Placeholder,
    labels: Placeholder,
    conv1: Conv2d,
    relu1: Relu,
    pool1: MaxPool2d,
    conv2: Conv2d,
    relu2: Relu,
    pool2: MaxPool2d,
    flat_dim: (usize, usize, usize),
    fc1: Dense,
    relu3: Relu,
    dropout: Dropout,
    fc2: Dense,
}

impl CnnModel {
    /// Create an unbuilt model with freshly initialized weights
    pub fn new(config: CnnConfig) -> Result<Self> {
        config.validate().map_err(NetError::InvalidArgument)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let k = config.kernel_size;

        let conv1 = Conv2d::new("conv1", config.channels, config.conv1_filters, k, 1, Padding::Same, &mut rng);
        let pool1 = MaxPool2d::new(2);
        let (h1, w1) = pool1.output_hw(config.image_height, config.image_width);
        let conv2 = Conv2d::new("conv2", config.conv1_filters, config.conv2_filters, k, 1, Padding::Same, &mut rng);
        let pool2 = MaxPool2d::new(2);
        let (h2, w2) = pool2.output_hw(h1, w1);
        let flat = h2 * w2 * config.conv2_filters;

        Ok(CnnModel {
            input: Placeholder::new(
                "input",
                &[None, Some(config.image_height), Some(config.image_width), Some(config.channels)],
            ),
            labels: Placeholder::new("labels", &[None, Some(config.num_classes)]),
            phase: PhaseState::default(),
            conv1,
            relu1: Relu::new(),
            pool1,
            conv2,
            relu2: Relu::new(),
            pool2,
            flat_dim: (h2, w2, config.conv2_filters),
            fc1: Dense::new("fc1", flat, config.hidden_units, &mut rng),
            relu3: Relu::new(),
            dropout: Dropout::new(config.dropout, config.seed.wrapping_add(1))?,
            fc2: Dense::new("fc2", config.hidden_units, config.num_classes, &mut rng),
            config,
        })
    }

    /// Hyper-parameters
    pub fn config(&self) -> &CnnConfig {
        &self.config
    }

    /// Image placeholder
    pub fn input(&self) -> &Placeholder {
        &self.input
    }

    /// One-hot label placeholder
    pub fn labels(&self) -> &Placeholder {
        &self.labels
    }

    fn images(&self, feed: &FeedDict) -> Result<Array4<f32>> {
        Ok(feed.require(&self.input)?.clone().into_dimensionality::<Ix4>()?)
    }

    fn forward(&mut self, x: ArrayView4<f32>, training: bool) -> Result<Array2<f32>> {
        let n = x.dim().0;
        let h = self.conv1.forward(x)?;
        let h = self.pool1.forward(self.relu1.forward(h.view()).view());
        let h = self.conv2.forward(h.view())?;
        let h = self.pool2.forward(self.relu2.forward(h.view()).view());
        let (fh, fw, fc) = self.flat_dim;
        let flat = h.into_shape_with_order((n, fh * fw * fc))?;
        let h = self.fc1.forward(flat.view())?;
        let h = self.relu3.forward(h.view());
        let h = self.dropout.forward(h.view(), training);
        self.fc2.forward(h.view())
    }

    fn backward(&mut self, grad_logits: Array2<f32>) -> Result<()> {
        let n = grad_logits.nrows();
        let g = self.fc2.backward(grad_logits.view())?;
        let g = self.dropout.backward(g.view())?;
        let g = self.relu3.backward(g.view())?;
        let g = self.fc1.backward(g.view())?;
        let (fh, fw, fc) = self.flat_dim;
        let g = g.into_shape_with_order((n, fh, fw, fc))?;
        let g = self.pool2.backward(g.view())?;
        let g = self.relu2.backward(g.view())?;
        let g = self.conv2.backward(g.view())?;
        let g = self.pool1.backward(g.view())?;
        let g = self.relu1.backward(g.view())?;
        self.conv1.backward(g.view())?;
        Ok(())
    }
}

impl Parameterized for CnnModel {
    fn zero_grad(&mut self) {
        self.conv1.zero_grad();
        self.conv2.zero_grad();
        self.fc1.zero_grad();
        self.fc2.zero_grad();
    }

    fn apply_gradients(&mut self, optimizer: &mut dyn Optimizer) {
        self.conv1.apply_gradients(optimizer);
        self.conv2.apply_gradients(optimizer);
        self.fc1.apply_gradients(optimizer);
        self.fc2.apply_gradients(optimizer);
    }

    fn save_state(&self, state: &mut StateDict) {
        self.conv1.save_state(state);
        self.conv2.save_state(state);
        self.fc1.save_state(state);
        self.fc2.save_state(state);
    }

    fn load_state(&mut self, state: &StateDict) -> Result<()> {
        self.conv1.load_state(state)?;
        self.conv2.load_state(state)?;
        self.fc1.load_state(state)?;
        self.fc2.load_state(state)
    }

    fn parameter_count(&self) -> usize {
        self.conv1.parameter_count()
            + self.conv2.parameter_count()
            + self.fc1.parameter_count()
            + self.fc2.parameter_count()
    }
}

impl NeuralNet for CnnModel {
    type Examples = LabeledData;

    fn build(&mut self, phase: ModelPhase) -> Result<()> {
        self.phase.set(phase);
        Ok(())
    }

    fn phase(&self) -> Option<ModelPhase> {
        self.phase.get()
    }

    fn feed_dict(&self, examples: &LabeledData, is_training: bool) -> Result<FeedDict> {
        let mut feed = FeedDict::new(is_training);
        feed.feed(&self.input, examples.data.clone())?;
        if let Some(labels) = &examples.labels {
            feed.feed(&self.labels, labels.clone())?;
        }
        Ok(feed)
    }

    fn model_output(&mut self, feed: &FeedDict) -> Result<ArrayD<f32>> {
        self.phase.require_built("model_output")?;
        let x = self.images(feed)?;
        let logits = self.forward(x.view(), false)?;
        Ok(softmax(logits.view(), ndarray::Axis(1)).into_dyn())
    }

    fn loss_and_accuracy(&mut self, feed: &FeedDict) -> Result<BatchScore> {
        self.phase.require_targets("loss")?;
        let x = self.images(feed)?;
        let targets = feed.require(&self.labels)?.clone();
        let logits = self.forward(x.view(), false)?;
        Ok(score_rows(logits.view(), &targets)?.0)
    }

    fn train_step(&mut self, feed: &FeedDict, optimizer: &mut dyn Optimizer) -> Result<BatchScore> {
        self.phase.require_training()?;
        let x = self.images(feed)?;
        let targets = feed.require(&self.labels)?.clone();
        self.zero_grad();
        let logits = self.forward(x.view(), feed.is_training())?;
        let (score, grad) = score_rows(logits.view(), &targets)?;
        self.backward(grad)?;
        self.apply_gradients(optimizer);
        Ok(score)
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        self.save_state(&mut state);
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        self.load_state(state)
    }
}
