//! Trainable parameters with gradient accumulators

use ndarray::{Array, Dimension};

use super::optim::Optimizer;
use crate::core::StateDict;
use crate::{NetError, Result};

/// A parameter tensor and the gradient accumulated for it since the last step.
#[derive(Clone, Debug)]
pub struct Param<D: Dimension> {
    /// Current value
    pub value: Array<f32, D>,
    /// Accumulated gradient, same shape as `value`
    pub grad: Array<f32, D>,
}

impl<D: Dimension> Param<D> {
    /// Wrap an initial value with a zero gradient
    pub fn new(value: Array<f32, D>) -> Self {
        let grad = Array::zeros(value.raw_dim());
        Param { value, grad }
    }

    /// Clear the gradient
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// Apply one optimizer update from the accumulated gradient
    pub fn step(&mut self, name: &str, optimizer: &mut dyn Optimizer) {
        optimizer.update(name, self.value.view_mut().into_dyn(), self.grad.view().into_dyn());
    }

    /// Write the value into `state` under `name`
    pub fn save(&self, name: &str, state: &mut StateDict) {
        state.insert(name.to_string(), self.value.clone().into_dyn());
    }

    /// Read the value from `state`; the stored shape must match
    pub fn load(&mut self, name: &str, state: &StateDict) -> Result<()> {
        let stored = state
            .get(name)
            .ok_or_else(|| NetError::Checkpoint(format!("missing parameter '{}'", name)))?;
        if stored.shape() != self.value.shape() {
            return Err(NetError::ShapeMismatch(format!(
                "parameter '{}' stored as {:?}, model expects {:?}",
                name,
                stored.shape(),
                self.value.shape()
            )));
        }
        self.value = stored.clone().into_dimensionality::<D>()?;
        Ok(())
    }

    /// Number of scalars
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Anything owning [`Param`]s: layers and whole models.
pub trait Parameterized {
    /// Clear every gradient
    fn zero_grad(&mut self);

    /// Step every parameter with `optimizer`
    fn apply_gradients(&mut self, optimizer: &mut dyn Optimizer);

    /// Write every parameter into `state`
    fn save_state(&self, state: &mut StateDict);

    /// Restore every parameter from `state`
    fn load_state(&mut self, state: &StateDict) -> Result<()>;

    /// Total number of trainable scalars
    fn parameter_count(&self) -> usize;
}
