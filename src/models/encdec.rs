//! RNN encoder-decoder for sequence-to-sequence tasks
//!
//! Training and evaluation use teacher forcing: the decoder reads the fed
//! decoder inputs. Without decoder inputs the decoder runs greedily, starting
//! from an all-zero GO vector and feeding back its own argmax one-hot.

use ndarray::{concatenate, s, Array2, Array3, ArrayD, ArrayView1, ArrayView3, Axis, Ix3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::{score_rows, to_rows};
use crate::core::{
    BatchScore, FeedDict, ModelPhase, NeuralNet, PhaseState, Placeholder, SequencePairs, StateDict,
};
use crate::nn::{argmax_last, softmax, Dense, DotAttention, Optimizer, Parameterized, Rnn};
use crate::{NetError, Result};

/// Encoder-decoder hyper-parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderDecoderConfig {
    /// One-hot width of input and output symbols
    pub vocab_size: usize,
    /// Hidden units per encoder direction
    pub hidden_size: usize,
    /// Steps produced by greedy decoding
    pub output_length: usize,
    /// Run a second encoder over the reversed input
    pub bidirectional: bool,
    /// Attend over encoder states at every decoder step
    pub attention: bool,
    /// Seed for initialization
    pub seed: u64,
}

impl Default for EncoderDecoderConfig {
    fn default() -> Self {
        EncoderDecoderConfig {
            vocab_size: 5,
            hidden_size: 32,
            output_length: 8,
            bidirectional: true,
            attention: true,
            seed: 42,
        }
    }
}

impl EncoderDecoderConfig {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.vocab_size < 2 {
            return Err("Vocabulary needs at least two symbols".to_string());
        }
        if self.hidden_size == 0 {
            return Err("Hidden size must be positive".to_string());
        }
        if self.output_length == 0 {
            return Err("Output length must be positive".to_string());
        }
        Ok(())
    }

    fn decoder_size(&self) -> usize {
        if self.bidirectional {
            2 * self.hidden_size
        } else {
            self.hidden_size
        }
    }
}

struct Encoded {
    memory: Array3<f32>,
    final_state: Array2<f32>,
}

/// Sequence-to-sequence network over one-hot symbol sequences.
///
/// `model_output` is `(batch, steps, vocab)` symbol probabilities.
#[derive(Clone, Debug)]
pub struct EncoderDecoder {
    config: EncoderDecoderConfig,
    phase: PhaseState,
    encoder_inputs: Placeholder,
    decoder_inputs: Placeholder,
    decoder_outputs: Placeholder,
    encoder_fw: Rnn,
    encoder_bw: Option<Rnn>,
    decoder: Rnn,
    attention: Option<DotAttention>,
    projection: Dense,
}

fn reverse_time(x: ArrayView3<f32>) -> Array3<f32> {
    x.slice(s![.., ..;-1, ..]).to_owned()
}

impl EncoderDecoder {
    /// Create an unbuilt model
    pub fn new(config: EncoderDecoderConfig) -> Result<Self> {
        config.validate().map_err(NetError::InvalidArgument)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let v = config.vocab_size;
        let h = config.hidden_size;
        let hd = config.decoder_size();

        let encoder_fw = Rnn::new("encoder_fw", v, h, &mut rng);
        let encoder_bw = config
            .bidirectional
            .then(|| Rnn::new("encoder_bw", v, h, &mut rng));
        let decoder = Rnn::new("decoder", v, hd, &mut rng);
        let features = if config.attention { 2 * hd } else { hd };
        let projection = Dense::new("projection", features, v, &mut rng);

        Ok(EncoderDecoder {
            encoder_inputs: Placeholder::new("encoder_inputs", &[None, None, Some(v)]),
            decoder_inputs: Placeholder::new("decoder_inputs", &[None, None, Some(v)]),
            decoder_outputs: Placeholder::new("decoder_outputs", &[None, None, Some(v)]),
            phase: PhaseState::default(),
            encoder_fw,
            encoder_bw,
            decoder,
            attention: config.attention.then(DotAttention::new),
            projection,
            config,
        })
    }

    /// Hyper-parameters
    pub fn config(&self) -> &EncoderDecoderConfig {
        &self.config
    }

    /// Encoder input placeholder
    pub fn encoder_inputs(&self) -> &Placeholder {
        &self.encoder_inputs
    }

    /// Teacher-forcing input placeholder
    pub fn decoder_inputs(&self) -> &Placeholder {
        &self.decoder_inputs
    }

    /// Target placeholder
    pub fn decoder_outputs(&self) -> &Placeholder {
        &self.decoder_outputs
    }

    fn sequence(&self, feed: &FeedDict, placeholder: &Placeholder) -> Result<Array3<f32>> {
        Ok(feed.require(placeholder)?.clone().into_dimensionality::<Ix3>()?)
    }

    fn encode(&mut self, x: ArrayView3<f32>) -> Result<Encoded> {
        let steps = x.dim().1;
        if steps == 0 {
            return Err(NetError::ShapeMismatch("encoder input has no time steps".into()));
        }
        let fw = self.encoder_fw.forward(x, None)?;
        let fw_last = fw.slice(s![.., steps - 1, ..]).to_owned();
        match self.encoder_bw.as_mut() {
            None => Ok(Encoded {
                memory: fw,
                final_state: fw_last,
            }),
            Some(bw_rnn) => {
                let bw_rev = bw_rnn.forward(reverse_time(x).view(), None)?;
                let bw_last = bw_rev.slice(s![.., steps - 1, ..]);
                let bw = reverse_time(bw_rev.view());
                Ok(Encoded {
                    memory: concatenate(Axis(2), &[fw.view(), bw.view()])?,
                    final_state: concatenate(Axis(1), &[fw_last.view(), bw_last])?,
                })
            }
        }
    }

    fn project(&mut self, features: Array3<f32>) -> Result<Array3<f32>> {
        let (n, steps, _) = features.dim();
        let rows = to_rows(features)?;
        let logits = self.projection.forward(rows.view())?;
        Ok(logits.into_shape_with_order((n, steps, self.config.vocab_size))?)
    }

    /// Teacher-forced logits `(batch, steps, vocab)`, caching for backward
    fn forward(&mut self, x: ArrayView3<f32>, decoder_inputs: ArrayView3<f32>) -> Result<Array3<f32>> {
        let encoded = self.encode(x)?;
        let states = self
            .decoder
            .forward(decoder_inputs, Some(encoded.final_state.view()))?;
        let features = match self.attention.as_mut() {
            Some(attention) => {
                let context = attention.forward(states.view(), encoded.memory.view())?;
                concatenate(Axis(2), &[states.view(), context.view()])?
            }
            None => states,
        };
        self.project(features)
    }

    /// `shape` is `(batch, decoder steps, encoder steps)`
    fn backward(&mut self, grad_logits: Array2<f32>, shape: (usize, usize, usize)) -> Result<()> {
        let (n, steps, encoder_steps) = shape;
        let hd = self.config.decoder_size();
        let h = self.config.hidden_size;

        let grad_features = self.projection.backward(grad_logits.view())?;
        let width = grad_features.ncols();
        let grad_features = grad_features.into_shape_with_order((n, steps, width))?;

        let (grad_states, grad_memory) = match self.attention.as_ref() {
            Some(attention) => {
                let grads = attention.backward(grad_features.slice(s![.., .., hd..]))?;
                (&grad_features.slice(s![.., .., ..hd]) + &grads.queries, grads.memory)
            }
            None => (grad_features, Array3::zeros((n, encoder_steps, hd))),
        };

        let grad_initial = self.decoder.backward(grad_states.view())?.initial_state;
        let last = encoder_steps - 1;

        let mut grad_fw = grad_memory.slice(s![.., .., ..h]).to_owned();
        {
            let mut tail = grad_fw.slice_mut(s![.., last, ..]);
            tail += &grad_initial.slice(s![.., ..h]);
        }
        self.encoder_fw.backward(grad_fw.view())?;

        if let Some(bw_rnn) = self.encoder_bw.as_mut() {
            let mut grad_bw = reverse_time(grad_memory.slice(s![.., .., h..]));
            {
                let mut tail = grad_bw.slice_mut(s![.., last, ..]);
                tail += &grad_initial.slice(s![.., h..]);
            }
            bw_rnn.backward(grad_bw.view())?;
        }
        Ok(())
    }

    /// Greedy decoding of `output_length` steps; returns probabilities
    fn decode_greedy(&mut self, x: ArrayView3<f32>) -> Result<Array3<f32>> {
        let encoded = self.encode(x)?;
        let n = x.dim().0;
        let v = self.config.vocab_size;
        let steps = self.config.output_length;

        let mut outputs = Array3::<f32>::zeros((n, steps, v));
        let mut input = Array2::<f32>::zeros((n, v));
        let mut state = encoded.final_state;
        for t in 0..steps {
            state = self.decoder.step(input.view(), state.view())?;
            let features = match self.attention.as_ref() {
                Some(attention) => {
                    let query = state.view().insert_axis(Axis(1));
                    let (_, context) = attention.apply(query, encoded.memory.view())?;
                    concatenate(Axis(1), &[state.view(), context.index_axis(Axis(1), 0)])?
                }
                None => state.clone(),
            };
            let probs = softmax(self.projection.apply(features.view())?.view(), Axis(1));
            input = one_hot_rows(argmax_last(probs.view()).view(), v);
            outputs.slice_mut(s![.., t, ..]).assign(&probs);
        }
        Ok(outputs)
    }
}

fn one_hot_rows(indices: ArrayView1<usize>, width: usize) -> Array2<f32> {
    let mut out = Array2::zeros((indices.len(), width));
    for (row, &i) in indices.iter().enumerate() {
        out[[row, i]] = 1.0;
    }
    out
}

impl Parameterized for EncoderDecoder {
    fn zero_grad(&mut self) {
        self.encoder_fw.zero_grad();
        if let Some(bw) = self.encoder_bw.as_mut() {
            bw.zero_grad();
        }
        self.decoder.zero_grad();
        self.projection.zero_grad();
    }

    fn apply_gradients(&mut self, optimizer: &mut dyn Optimizer) {
        self.encoder_fw.apply_gradients(optimizer);
        if let Some(bw) = self.encoder_bw.as_mut() {
            bw.apply_gradients(optimizer);
        }
        self.decoder.apply_gradients(optimizer);
        self.projection.apply_gradients(optimizer);
    }

    fn save_state(&self, state: &mut StateDict) {
        self.encoder_fw.save_state(state);
        if let Some(bw) = self.encoder_bw.as_ref() {
            bw.save_state(state);
        }
        self.decoder.save_state(state);
        self.projection.save_state(state);
    }

    fn load_state(&mut self, state: &StateDict) -> Result<()> {
        self.encoder_fw.load_state(state)?;
        if let Some(bw) = self.encoder_bw.as_mut() {
            bw.load_state(state)?;
        }
        self.decoder.load_state(state)?;
        self.projection.load_state(state)
    }

    fn parameter_count(&self) -> usize {
        self.encoder_fw.parameter_count()
            + self.encoder_bw.as_ref().map_or(0, |bw| bw.parameter_count())
            + self.decoder.parameter_count()
            + self.projection.parameter_count()
    }
}

impl NeuralNet for EncoderDecoder {
    type Examples = SequencePairs;

    fn build(&mut self, phase: ModelPhase) -> Result<()> {
        self.phase.set(phase);
        Ok(())
    }

    fn phase(&self) -> Option<ModelPhase> {
        self.phase.get()
    }

    fn feed_dict(&self, examples: &SequencePairs, is_training: bool) -> Result<FeedDict> {
        let mut feed = FeedDict::new(is_training);
        feed.feed(&self.encoder_inputs, examples.encoder_inputs.clone())?;
        if let (Some(inputs), Some(outputs)) = (&examples.decoder_inputs, &examples.decoder_outputs) {
            feed.feed(&self.decoder_inputs, inputs.clone())?;
            feed.feed(&self.decoder_outputs, outputs.clone())?;
        }
        Ok(feed)
    }

    fn model_output(&mut self, feed: &FeedDict) -> Result<ArrayD<f32>> {
        self.phase.require_built("model_output")?;
        let x = self.sequence(feed, &self.encoder_inputs)?;
        if feed.contains(&self.decoder_inputs) {
            let decoder_inputs = self.sequence(feed, &self.decoder_inputs)?;
            let logits = self.forward(x.view(), decoder_inputs.view())?;
            return Ok(softmax(logits.view(), Axis(2)).into_dyn());
        }
        Ok(self.decode_greedy(x.view())?.into_dyn())
    }

    fn loss_and_accuracy(&mut self, feed: &FeedDict) -> Result<BatchScore> {
        self.phase.require_targets("loss")?;
        let x = self.sequence(feed, &self.encoder_inputs)?;
        let decoder_inputs = self.sequence(feed, &self.decoder_inputs)?;
        let targets = feed.require(&self.decoder_outputs)?.clone();
        let logits = self.forward(x.view(), decoder_inputs.view())?;
        Ok(score_rows(to_rows(logits)?.view(), &targets)?.0)
    }

    fn train_step(&mut self, feed: &FeedDict, optimizer: &mut dyn Optimizer) -> Result<BatchScore> {
        self.phase.require_training()?;
        let x = self.sequence(feed, &self.encoder_inputs)?;
        let decoder_inputs = self.sequence(feed, &self.decoder_inputs)?;
        let targets = feed.require(&self.decoder_outputs)?.clone();

        self.zero_grad();
        let logits = self.forward(x.view(), decoder_inputs.view())?;
        let (n, steps, _) = logits.dim();
        let (score, grad) = score_rows(to_rows(logits)?.view(), &targets)?;
        self.backward(grad, (n, steps, x.dim().1))?;
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
