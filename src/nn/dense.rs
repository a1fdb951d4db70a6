//! Fully connected layer: `y = x W + b`

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;

use super::optim::Optimizer;
use super::param::{Param, Parameterized};
use crate::core::StateDict;
use crate::{NetError, Result};

/// Dense layer with Xavier-uniform weights and zero bias.
#[derive(Clone, Debug)]
pub struct Dense {
    name: String,
    weights: Param<ndarray::Ix2>,
    bias: Param<ndarray::Ix1>,
    input: Option<Array2<f32>>,
}

impl Dense {
    /// Create a layer mapping `input_size` features to `output_size`
    pub fn new<R: Rng>(name: &str, input_size: usize, output_size: usize, rng: &mut R) -> Self {
        let limit = (6.0f32 / (input_size + output_size) as f32).sqrt();
        let weights = Array2::from_shape_fn((input_size, output_size), |_| rng.gen_range(-limit..=limit));
        Dense {
            name: name.to_string(),
            weights: Param::new(weights),
            bias: Param::new(Array1::zeros(output_size)),
            input: None,
        }
    }

    /// Input feature count
    pub fn input_size(&self) -> usize {
        self.weights.value.nrows()
    }

    /// Output feature count
    pub fn output_size(&self) -> usize {
        self.weights.value.ncols()
    }

    fn check_input(&self, x: &ArrayView2<f32>) -> Result<()> {
        if x.ncols() != self.input_size() {
            return Err(NetError::ShapeMismatch(format!(
                "{} expects {} input features, got {}",
                self.name,
                self.input_size(),
                x.ncols()
            )));
        }
        Ok(())
    }

    /// Forward without caching, for inference loops
    pub fn apply(&self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_input(&x)?;
        Ok(x.dot(&self.weights.value) + &self.bias.value)
    }

    /// Forward, caching the input for [`Dense::backward`]
    pub fn forward(&mut self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let y = self.apply(x)?;
        self.input = Some(x.to_owned());
        Ok(y)
    }

    /// Accumulate parameter gradients and return `dL/dx`
    pub fn backward(&mut self, grad_output: ArrayView2<f32>) -> Result<Array2<f32>> {
        let x = self
            .input
            .as_ref()
            .ok_or_else(|| NetError::InvalidArgument(format!("{}: backward before forward", self.name)))?;
        self.weights.grad += &x.t().dot(&grad_output);
        self.bias.grad += &grad_output.sum_axis(Axis(0));
        Ok(grad_output.dot(&self.weights.value.t()))
    }
}

impl Parameterized for Dense {
    fn zero_grad(&mut self) {
        self.weights.zero_grad();
        self.bias.zero_grad();
    }

    fn apply_gradients(&mut self, optimizer: &mut dyn Optimizer) {
        self.weights.step(&format!("{}.weights", self.name), optimizer);
        self.bias.step(&format!("{}.bias", self.name), optimizer);
    }

    fn save_state(&self, state: &mut StateDict) {
        self.weights.save(&format!("{}.weights", self.name), state);
        self.bias.save(&format!("{}.bias", self.name), state);
    }

    fn load_state(&mut self, state: &StateDict) -> Result<()> {
        self.weights.load(&format!("{}.weights", self.name), state)?;
        self.bias.load(&format!("{}.bias", self.name), state)
    }

    fn parameter_count(&self) -> usize {
        self.weights.len() + self.bias.len()
    }
}
