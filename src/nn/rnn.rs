//! Elman recurrent layer: `h_t = tanh(x_t W_x + h_{t-1} W_h + b)`

use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};
use rand::Rng;

use super::optim::Optimizer;
use super::param::{Param, Parameterized};
use crate::core::StateDict;
use crate::{NetError, Result};

#[derive(Clone, Debug)]
struct RnnCache {
    inputs: Array3<f32>,
    // (batch, steps + 1, hidden); index 0 is the initial state
    states: Array3<f32>,
}

/// Gradients flowing out of [`Rnn::backward`]
#[derive(Clone, Debug)]
pub struct RnnGrads {
    /// `dL/dx`, shaped like the input sequence
    pub inputs: Array3<f32>,
    /// `dL/dh_0`
    pub initial_state: Array2<f32>,
}

/// A single-direction tanh RNN over `(batch, steps, features)` sequences.
#[derive(Clone, Debug)]
pub struct Rnn {
    name: String,
    input_weights: Param<ndarray::Ix2>,
    recurrent_weights: Param<ndarray::Ix2>,
    bias: Param<ndarray::Ix1>,
    cache: Option<RnnCache>,
}

impl Rnn {
    /// Create a layer with `hidden_size` units
    pub fn new<R: Rng>(name: &str, input_size: usize, hidden_size: usize, rng: &mut R) -> Self {
        let limit_x = (6.0f32 / (input_size + hidden_size) as f32).sqrt();
        let limit_h = (3.0f32 / hidden_size as f32).sqrt();
        Rnn {
            name: name.to_string(),
            input_weights: Param::new(Array2::from_shape_fn((input_size, hidden_size), |_| {
                rng.gen_range(-limit_x..=limit_x)
            })),
            recurrent_weights: Param::new(Array2::from_shape_fn((hidden_size, hidden_size), |_| {
                rng.gen_range(-limit_h..=limit_h)
            })),
            bias: Param::new(Array1::zeros(hidden_size)),
            cache: None,
        }
    }

    /// Input feature count
    pub fn input_size(&self) -> usize {
        self.input_weights.value.nrows()
    }

    /// Hidden state width
    pub fn hidden_size(&self) -> usize {
        self.recurrent_weights.value.nrows()
    }

    /// One step without caching, for greedy decoding
    pub fn step(&self, x: ArrayView2<f32>, h: ArrayView2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.input_size() || h.ncols() != self.hidden_size() || x.nrows() != h.nrows() {
            return Err(NetError::ShapeMismatch(format!(
                "{} step: input {:?}, state {:?}",
                self.name,
                x.dim(),
                h.dim()
            )));
        }
        let pre = x.dot(&self.input_weights.value) + h.dot(&self.recurrent_weights.value) + &self.bias.value;
        Ok(pre.mapv(f32::tanh))
    }

    /// Run the whole sequence, caching activations. Returns every hidden state.
    pub fn forward(&mut self, x: ArrayView3<f32>, initial: Option<ArrayView2<f32>>) -> Result<Array3<f32>> {
        let (n, steps, features) = x.dim();
        if features != self.input_size() {
            return Err(NetError::ShapeMismatch(format!(
                "{} expects {} features, got {}",
                self.name,
                self.input_size(),
                features
            )));
        }
        let hidden = self.hidden_size();
        let mut states = Array3::<f32>::zeros((n, steps + 1, hidden));
        if let Some(h0) = initial {
            if h0.dim() != (n, hidden) {
                return Err(NetError::ShapeMismatch(format!(
                    "{} initial state {:?}, expected {:?}",
                    self.name,
                    h0.dim(),
                    (n, hidden)
                )));
            }
            states.slice_mut(s![.., 0, ..]).assign(&h0);
        }
        for t in 0..steps {
            let h = self.step(x.slice(s![.., t, ..]), states.slice(s![.., t, ..]))?;
            states.slice_mut(s![.., t + 1, ..]).assign(&h);
        }
        let outputs = states.slice(s![.., 1.., ..]).to_owned();
        self.cache = Some(RnnCache {
            inputs: x.to_owned(),
            states,
        });
        Ok(outputs)
    }

    /// Backpropagate through time from the gradient of every output state
    pub fn backward(&mut self, grad_outputs: ArrayView3<f32>) -> Result<RnnGrads> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| NetError::InvalidArgument(format!("{}: backward before forward", self.name)))?;
        let (n, steps, _) = cache.inputs.dim();
        let hidden = self.hidden_size();
        if grad_outputs.dim() != (n, steps, hidden) {
            return Err(NetError::ShapeMismatch(format!(
                "{} produced {:?}, got gradient {:?}",
                self.name,
                (n, steps, hidden),
                grad_outputs.dim()
            )));
        }

        let mut grad_inputs = Array3::<f32>::zeros(cache.inputs.raw_dim());
        let mut carry = Array2::<f32>::zeros((n, hidden));
        for t in (0..steps).rev() {
            let h = cache.states.slice(s![.., t + 1, ..]);
            let h_prev = cache.states.slice(s![.., t, ..]);
            let dh = &grad_outputs.slice(s![.., t, ..]) + &carry;
            let da = dh * &h.mapv(|v| 1.0 - v * v);

            let x_t = cache.inputs.slice(s![.., t, ..]);
            self.input_weights.grad += &x_t.t().dot(&da);
            self.recurrent_weights.grad += &h_prev.t().dot(&da);
            self.bias.grad += &da.sum_axis(Axis(0));

            grad_inputs
                .slice_mut(s![.., t, ..])
                .assign(&da.dot(&self.input_weights.value.t()));
            carry = da.dot(&self.recurrent_weights.value.t());
        }
        Ok(RnnGrads {
            inputs: grad_inputs,
            initial_state: carry,
        })
    }
}

impl Parameterized for Rnn {
    fn zero_grad(&mut self) {
        self.input_weights.zero_grad();
        self.recurrent_weights.zero_grad();
        self.bias.zero_grad();
    }

    fn apply_gradients(&mut self, optimizer: &mut dyn Optimizer) {
        self.input_weights.step(&format!("{}.input_weights", self.name), optimizer);
        self.recurrent_weights
            .step(&format!("{}.recurrent_weights", self.name), optimizer);
        self.bias.step(&format!("{}.bias", self.name), optimizer);
    }

    fn save_state(&self, state: &mut StateDict) {
        self.input_weights.save(&format!("{}.input_weights", self.name), state);
        self.recurrent_weights
            .save(&format!("{}.recurrent_weights", self.name), state);
        self.bias.save(&format!("{}.bias", self.name), state);
    }

    fn load_state(&mut self, state: &StateDict) -> Result<()> {
        self.input_weights.load(&format!("{}.input_weights", self.name), state)?;
        self.recurrent_weights
            .load(&format!("{}.recurrent_weights", self.name), state)?;
        self.bias.load(&format!("{}.bias", self.name), state)
    }

    fn parameter_count(&self) -> usize {
        self.input_weights.len() + self.recurrent_weights.len() + self.bias.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sequence() -> Array3<f32> {
        Array3::from_shape_fn((2, 4, 3), |(b, t, f)| ((b + 2 * t + 3 * f) % 5) as f32 * 0.2 - 0.4)
    }

    #[test]
    fn test_forward_matches_step() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut rnn = Rnn::new("rnn", 3, 5, &mut rng);
        let x = sequence();
        let out = rnn.forward(x.view(), None).unwrap();
        assert_eq!(out.dim(), (2, 4, 5));

        let mut h = Array2::<f32>::zeros((2, 5));
        for t in 0..4 {
            h = rnn.step(x.slice(s![.., t, ..]), h.view()).unwrap();
        }
        let last = out.slice(s![.., 3, ..]);
        assert!(last.iter().zip(h.iter()).all(|(a, b)| (a - b).abs() < 1e-6));
    }

    #[test]
    fn test_bptt_numeric_gradient() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut rnn = Rnn::new("rnn", 3, 4, &mut rng);
        let x = sequence();
        let h0 = Array2::from_elem((2, 4), 0.1f32);

        let out = rnn.forward(x.view(), Some(h0.view())).unwrap();
        let grads = rnn.backward(Array3::ones(out.raw_dim()).view()).unwrap();
        let analytic = rnn.recurrent_weights.grad[[1, 2]];

        let loss = |rnn: &mut Rnn| rnn.forward(x.view(), Some(h0.view())).unwrap().sum();
        let eps = 1e-2;
        rnn.recurrent_weights.value[[1, 2]] += eps;
        let plus = loss(&mut rnn);
        rnn.recurrent_weights.value[[1, 2]] -= 2.0 * eps;
        let minus = loss(&mut rnn);
        let numeric = (plus - minus) / (2.0 * eps);
        assert!((numeric - analytic).abs() < 1e-2, "{} vs {}", numeric, analytic);

        assert_eq!(grads.inputs.dim(), (2, 4, 3));
        assert_eq!(grads.initial_state.dim(), (2, 4));
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut rnn = Rnn::new("rnn", 3, 4, &mut rng);
        assert!(rnn.forward(Array3::zeros((1, 2, 2)).view(), None).is_err());
        assert!(rnn.backward(Array3::zeros((1, 2, 4)).view()).is_err());
        let x = Array3::zeros((1, 2, 3));
        assert!(rnn.forward(x.view(), Some(Array2::zeros((2, 4)).view())).is_err());
    }
}
