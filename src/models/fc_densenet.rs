//! Fully convolutional DenseNet for per-pixel classification
//!
//! One resolution level: a dense block on the full-size stem features, a
//! transition down, a bottleneck dense block, a transition up whose output is
//! concatenated with the skip features, a final dense block and a 1x1
//! classifier. Dense blocks concatenate every layer's output onto its input.

use ndarray::{concatenate, s, Array4, ArrayD, ArrayView4, Axis, Ix4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{score_rows, to_rows};
use crate::core::{
    BatchScore, FeedDict, LabeledData, ModelPhase, NeuralNet, PhaseState, Placeholder, StateDict,
};
use crate::nn::{softmax, Conv2d, MaxPool2d, Optimizer, Padding, Parameterized, Relu, Upsample2d};
use crate::{NetError, Result};

/// FC-DenseNet hyper-parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FcDenseNetConfig {
    /// Input image channels
    pub in_channels: usize,
    /// Output classes per pixel
    pub num_classes: usize,
    /// Filters of the stem convolution
    pub first_filters: usize,
    /// Channels each dense layer adds
    pub growth_rate: usize,
    /// Layers per dense block
    pub layers_per_block: usize,
    /// Seed for initialization
    pub seed: u64,
}

impl Default for FcDenseNetConfig {
    fn default() -> Self {
        FcDenseNetConfig {
            in_channels: 3,
            num_classes: 2,
            first_filters: 16,
            growth_rate: 8,
            layers_per_block: 3,
            seed: 42,
        }
    }
}

impl FcDenseNetConfig {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.in_channels == 0 || self.first_filters == 0 || self.growth_rate == 0 {
            return Err("Channel counts must be positive".to_string());
        }
        if self.num_classes < 2 {
            return Err("Need at least two classes".to_string());
        }
        if self.layers_per_block == 0 {
            return Err("Dense blocks need at least one layer".to_string());
        }
        Ok(())
    }
}

fn split_channels(x: &Array4<f32>, widths: &[usize]) -> Vec<Array4<f32>> {
    let mut offset = 0;
    widths
        .iter()
        .map(|&w| {
            let part = x.slice(s![.., .., .., offset..offset + w]).to_owned();
            offset += w;
            part
        })
        .collect()
}

fn concat_channels(parts: &[Array4<f32>]) -> Result<Array4<f32>> {
    let views: Vec<ArrayView4<f32>> = parts.iter().map(|p| p.view()).collect();
    Ok(concatenate(Axis(3), &views)?)
}

#[derive(Clone, Debug)]
struct DenseLayer {
    relu: Relu,
    conv: Conv2d,
}

impl DenseLayer {
    fn forward(&mut self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let h = self.relu.forward(x);
        self.conv.forward(h.view())
    }

    fn backward(&mut self, grad: ArrayView4<f32>) -> Result<Array4<f32>> {
        let g = self.conv.backward(grad)?;
        self.relu.backward(g.view())
    }
}

/// Stack of dense layers; each reads the concatenation of everything before it.
#[derive(Clone, Debug)]
struct DenseBlock {
    layers: Vec<DenseLayer>,
    in_channels: usize,
    growth_rate: usize,
    keep_input: bool,
}

impl DenseBlock {
    fn new<R: Rng>(name: &str, in_channels: usize, config: &FcDenseNetConfig, keep_input: bool, rng: &mut R) -> Self {
        let layers = (0..config.layers_per_block)
            .map(|i| DenseLayer {
                relu: Relu::new(),
                conv: Conv2d::new(
                    &format!("{}.{}", name, i),
                    in_channels + i * config.growth_rate,
                    config.growth_rate,
                    3,
                    1,
                    Padding::Same,
                    rng,
                ),
            })
            .collect();
        DenseBlock {
            layers,
            in_channels,
            growth_rate: config.growth_rate,
            keep_input,
        }
    }

    fn out_channels(&self) -> usize {
        let grown = self.layers.len() * self.growth_rate;
        if self.keep_input {
            self.in_channels + grown
        } else {
            grown
        }
    }

    fn widths(&self) -> Vec<usize> {
        std::iter::once(self.in_channels)
            .chain(std::iter::repeat(self.growth_rate).take(self.layers.len()))
            .collect()
    }

    fn forward(&mut self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut features = vec![x.to_owned()];
        for layer in self.layers.iter_mut() {
            let input = concat_channels(&features)?;
            features.push(layer.forward(input.view())?);
        }
        if self.keep_input {
            concat_channels(&features)
        } else {
            concat_channels(&features[1..])
        }
    }

    /// Returns the gradient with respect to the block input
    fn backward(&mut self, grad: &Array4<f32>) -> Result<Array4<f32>> {
        let widths = self.widths();
        let mut grads = if self.keep_input {
            split_channels(grad, &widths)
        } else {
            let (n, h, w, _) = grad.dim();
            let mut parts = vec![Array4::zeros((n, h, w, self.in_channels))];
            parts.extend(split_channels(grad, &widths[1..]));
            parts
        };
        for (i, layer) in self.layers.iter_mut().enumerate().rev() {
            let grad_input = layer.backward(grads[i + 1].view())?;
            for (target, part) in grads.iter_mut().zip(split_channels(&grad_input, &widths[..=i])) {
                *target += &part;
            }
        }
        Ok(grads.swap_remove(0))
    }
}

impl Parameterized for DenseBlock {
    fn zero_grad(&mut self) {
        self.layers.iter_mut().for_each(|l| l.conv.zero_grad());
    }

    fn apply_gradients(&mut self, optimizer: &mut dyn Optimizer) {
        for layer in self.layers.iter_mut() {
            layer.conv.apply_gradients(optimizer);
        }
    }

    fn save_state(&self, state: &mut StateDict) {
        self.layers.iter().for_each(|l| l.conv.save_state(state));
    }

    fn load_state(&mut self, state: &StateDict) -> Result<()> {
        self.layers.iter_mut().try_for_each(|l| l.conv.load_state(state))
    }

    fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.conv.parameter_count()).sum()
    }
}

/// Dense-prediction network over `(batch, height, width, channels)` images.
///
/// Height and width must be even. `model_output` is the per-pixel class
/// probability map `(batch, height, width, classes)`.
#[derive(Clone, Debug)]
pub struct FcDenseNet {
    config: FcDenseNetConfig,
    phase: PhaseState,
    input: Placeholder,
    labels: Placeholder,
    stem: Conv2d,
    down: DenseBlock,
    down_relu: Relu,
    down_conv: Conv2d,
    pool: MaxPool2d,
    bottleneck: DenseBlock,
    upsample: Upsample2d,
    up_conv: Conv2d,
    up: DenseBlock,
    classifier: Conv2d,
}

impl FcDenseNet {
    /// Create an unbuilt model
    pub fn new(config: FcDenseNetConfig) -> Result<Self> {
        config.validate().map_err(NetError::InvalidArgument)?;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let stem = Conv2d::new("stem", config.in_channels, config.first_filters, 3, 1, Padding::Same, &mut rng);
        let down = DenseBlock::new("down", config.first_filters, &config, true, &mut rng);
        let skip = down.out_channels();
        let down_conv = Conv2d::new("transition_down", skip, skip, 1, 1, Padding::Same, &mut rng);
        let bottleneck = DenseBlock::new("bottleneck", skip, &config, false, &mut rng);
        let grown = bottleneck.out_channels();
        let up_conv = Conv2d::new("transition_up", grown, grown, 3, 1, Padding::Same, &mut rng);
        let up = DenseBlock::new("up", grown + skip, &config, true, &mut rng);
        let classifier = Conv2d::new("classifier", up.out_channels(), config.num_classes, 1, 1, Padding::Same, &mut rng);

        Ok(FcDenseNet {
            input: Placeholder::new("input", &[None, None, None, Some(config.in_channels)]),
            labels: Placeholder::new("labels", &[None, None, None, Some(config.num_classes)]),
            phase: PhaseState::default(),
            stem,
            down,
            down_relu: Relu::new(),
            down_conv,
            pool: MaxPool2d::new(2),
            bottleneck,
            upsample: Upsample2d::new(2),
            up_conv,
            up,
            classifier,
            config,
        })
    }

    /// Hyper-parameters
    pub fn config(&self) -> &FcDenseNetConfig {
        &self.config
    }

    /// Image placeholder
    pub fn input(&self) -> &Placeholder {
        &self.input
    }

    /// One-hot label map placeholder
    pub fn labels(&self) -> &Placeholder {
        &self.labels
    }

    fn images(&self, feed: &FeedDict) -> Result<Array4<f32>> {
        let x = feed.require(&self.input)?.clone().into_dimensionality::<Ix4>()?;
        let (_, h, w, _) = x.dim();
        if h % 2 != 0 || w % 2 != 0 || h == 0 || w == 0 {
            return Err(NetError::ShapeMismatch(format!(
                "image size {}x{} must be even and non-empty",
                h, w
            )));
        }
        Ok(x)
    }

    fn forward(&mut self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let stem = self.stem.forward(x)?;
        let skip = self.down.forward(stem.view())?;
        let t = self.down_relu.forward(skip.view());
        let t = self.down_conv.forward(t.view())?;
        let t = self.pool.forward(t.view());
        let b = self.bottleneck.forward(t.view())?;
        let u = self.up_conv.forward(self.upsample.forward(b.view()).view())?;
        let merged = concat_channels(&[u, skip])?;
        let y = self.up.forward(merged.view())?;
        self.classifier.forward(y.view())
    }

    fn backward(&mut self, grad_logits: &Array4<f32>) -> Result<()> {
        let g = self.classifier.backward(grad_logits.view())?;
        let g = self.up.backward(&g)?;
        let grown = self.bottleneck.out_channels();
        let grad_up = g.slice(s![.., .., .., ..grown]);
        let grad_skip = g.slice(s![.., .., .., grown..]);

        let g = self.up_conv.backward(grad_up.view())?;
        let g = self.upsample.backward(g.view())?;
        let g = self.bottleneck.backward(&g)?;
        let g = self.pool.backward(g.view())?;
        let g = self.down_conv.backward(g.view())?;
        let g = self.down_relu.backward(g.view())?;
        let g = self.down.backward(&(g + &grad_skip))?;
        self.stem.backward(g.view())?;
        Ok(())
    }
}

impl Parameterized for FcDenseNet {
    fn zero_grad(&mut self) {
        self.stem.zero_grad();
        self.down.zero_grad();
        self.down_conv.zero_grad();
        self.bottleneck.zero_grad();
        self.up_conv.zero_grad();
        self.up.zero_grad();
        self.classifier.zero_grad();
    }

    fn apply_gradients(&mut self, optimizer: &mut dyn Optimizer) {
        self.stem.apply_gradients(optimizer);
        self.down.apply_gradients(optimizer);
        self.down_conv.apply_gradients(optimizer);
        self.bottleneck.apply_gradients(optimizer);
        self.up_conv.apply_gradients(optimizer);
        self.up.apply_gradients(optimizer);
        self.classifier.apply_gradients(optimizer);
    }

    fn save_state(&self, state: &mut StateDict) {
        self.stem.save_state(state);
        self.down.save_state(state);
        self.down_conv.save_state(state);
        self.bottleneck.save_state(state);
        self.up_conv.save_state(state);
        self.up.save_state(state);
        self.classifier.save_state(state);
    }

    fn load_state(&mut self, state: &StateDict) -> Result<()> {
        self.stem.load_state(state)?;
        self.down.load_state(state)?;
        self.down_conv.load_state(state)?;
        self.bottleneck.load_state(state)?;
        self.up_conv.load_state(state)?;
        self.up.load_state(state)?;
        self.classifier.load_state(state)
    }

    fn parameter_count(&self) -> usize {
        self.stem.parameter_count()
            + self.down.parameter_count()
            + self.down_conv.parameter_count()
            + self.bottleneck.parameter_count()
            + self.up_conv.parameter_count()
            + self.up.parameter_count()
            + self.classifier.parameter_count()
    }
}

impl NeuralNet for FcDenseNet {
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
        let logits = self.forward(x.view())?;
        Ok(softmax(logits.view(), Axis(3)).into_dyn())
    }

    fn loss_and_accuracy(&mut self, feed: &FeedDict) -> Result<BatchScore> {
        self.phase.require_targets("loss")?;
        let x = self.images(feed)?;
        let targets = feed.require(&self.labels)?.clone();
        let logits = self.forward(x.view())?;
        Ok(score_rows(to_rows(logits)?.view(), &targets)?.0)
    }

    fn train_step(&mut self, feed: &FeedDict, optimizer: &mut dyn Optimizer) -> Result<BatchScore> {
        self.phase.require_training()?;
        let x = self.images(feed)?;
        let targets = feed.require(&self.labels)?.clone();

        self.zero_grad();
        let logits = self.forward(x.view())?;
        let dim = logits.raw_dim();
        let (score, grad) = score_rows(to_rows(logits)?.view(), &targets)?;
        self.backward(&grad.into_shape_with_order(dim)?)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Adam;
    use ndarray::{Array, IxDyn};

    fn tiny() -> FcDenseNetConfig {
        FcDenseNetConfig {
            in_channels: 1,
            num_classes: 2,
            first_filters: 4,
            growth_rate: 3,
            layers_per_block: 2,
            seed: 3,
        }
    }

    /// Foreground wherever the pixel is bright.
    fn blobs() -> LabeledData {
        let data = Array::from_shape_fn(IxDyn(&[2, 4, 4, 1]), |idx| {
            if (idx[1] + idx[2] + idx[0]) % 3 == 0 {
                1.0
            } else {
                0.0
            }
        });
        let labels = Array::from_shape_fn(IxDyn(&[2, 4, 4, 2]), |idx| {
            let fg = (idx[1] + idx[2] + idx[0]) % 3 == 0;
            if (idx[3] == 1) == fg {
                1.0
            } else {
                0.0
            }
        });
        LabeledData::new(data, labels).unwrap()
    }

    #[test]
    fn test_channel_bookkeeping() {
        let net = FcDenseNet::new(tiny()).unwrap();
        assert_eq!(net.down.out_channels(), 4 + 2 * 3);
        assert_eq!(net.bottleneck.out_channels(), 6);
        assert_eq!(net.up.out_channels(), 6 + 10 + 6);
        assert!(net.parameter_count() > 0);
    }

    #[test]
    fn test_output_is_per_pixel_distribution() {
        let mut net = FcDenseNet::new(tiny()).unwrap();
        net.create_inference_model().unwrap();
        let feed = net.feed_dict(&blobs(), false).unwrap();
        let out = net.model_output(&feed).unwrap();
        assert_eq!(out.shape(), &[2, 4, 4, 2]);
        for lane in out.lanes(Axis(3)) {
            assert!((lane.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_odd_sizes_rejected() {
        let mut net = FcDenseNet::new(tiny()).unwrap();
        net.create_inference_model().unwrap();
        let odd = LabeledData::unlabeled(Array::zeros(IxDyn(&[1, 3, 4, 1]))).unwrap();
        let feed = net.feed_dict(&odd, false).unwrap();
        assert!(matches!(net.model_output(&feed), Err(NetError::ShapeMismatch(_))));
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut net = FcDenseNet::new(tiny()).unwrap();
        net.create_training_model().unwrap();
        let feed = net.feed_dict(&blobs(), true).unwrap();
        let mut opt = Adam::with_learning_rate(0.01);

        let before = net.loss(&feed).unwrap();
        for _ in 0..25 {
            net.train_step(&feed, &mut opt).unwrap();
        }
        let after = net.loss(&feed).unwrap();
        assert!(after < before, "{} -> {}", before, after);
    }

    #[test]
    fn test_dense_block_gradient_matches_numeric() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut block = DenseBlock::new("b", 2, &tiny(), false, &mut rng);
        let x = Array4::from_shape_fn((1, 3, 3, 2), |(_, i, j, c)| ((i * 3 + j + c) % 4) as f32 * 0.3 - 0.4);

        let y = block.forward(x.view()).unwrap();
        let gx = block.backward(&Array4::ones(y.raw_dim())).unwrap();

        let eps = 1e-3;
        let mut bumped = x.clone();
        bumped[[0, 1, 1, 0]] += eps;
        let plus = block.forward(bumped.view()).unwrap().sum();
        bumped[[0, 1, 1, 0]] -= 2.0 * eps;
        let minus = block.forward(bumped.view()).unwrap().sum();
        let numeric = (plus - minus) / (2.0 * eps);
        assert!((numeric - gx[[0, 1, 1, 0]]).abs() < 2e-2, "{} vs {}", numeric, gx[[0, 1, 1, 0]]);
    }
}
