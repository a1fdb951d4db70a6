//! Optimizers: plain/momentum SGD and Adam
//!
//! Parameters are addressed by name so stateful optimizers can keep one set
//! of moment estimates per tensor.

use std::collections::HashMap;

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use serde::{Deserialize, Serialize};

/// Update rule applied to each named parameter after a backward pass.
pub trait Optimizer {
    /// Update `params` in place from `grads`
    fn update(&mut self, name: &str, params: ArrayViewMutD<f32>, grads: ArrayViewD<f32>);

    /// Clear internal state (moments, step counters)
    fn reset(&mut self);

    /// Base learning rate
    fn learning_rate(&self) -> f32;

    /// Change the base learning rate, e.g. from a schedule
    fn set_learning_rate(&mut self, lr: f32);
}

/// Stochastic gradient descent with optional momentum.
///
/// `v = momentum * v - lr * g; w += v`
#[derive(Clone, Debug)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    velocity: HashMap<String, ArrayD<f32>>,
}

impl Sgd {
    /// Plain SGD
    pub fn new(learning_rate: f32) -> Self {
        Self::with_momentum(learning_rate, 0.0)
    }

    /// SGD with momentum
    pub fn with_momentum(learning_rate: f32, momentum: f32) -> Self {
        Sgd {
            learning_rate,
            momentum,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn update(&mut self, name: &str, mut params: ArrayViewMutD<f32>, grads: ArrayViewD<f32>) {
        let lr = self.learning_rate;
        if self.momentum == 0.0 {
            Zip::from(&mut params).and(&grads).for_each(|p, &g| *p -= lr * g);
            return;
        }

        let momentum = self.momentum;
        let velocity = self
            .velocity
            .entry(name.to_string())
            .or_insert_with(|| ArrayD::zeros(params.raw_dim()));
        Zip::from(&mut params)
            .and(velocity)
            .and(&grads)
            .for_each(|p, v, &g| {
                *v = momentum * *v - lr * g;
                *p += *v;
            });
    }

    fn reset(&mut self) {
        self.velocity.clear();
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}

#[derive(Clone, Debug)]
struct Moments {
    m: ArrayD<f32>,
    v: ArrayD<f32>,
    t: i32,
}

/// Adam with bias-corrected first and second moments.
#[derive(Clone, Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    moments: HashMap<String, Moments>,
}

impl Adam {
    /// Adam with explicit hyper-parameters
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Adam {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            moments: HashMap::new(),
        }
    }

    /// Adam with beta1 = 0.9, beta2 = 0.999, epsilon = 1e-8
    pub fn with_learning_rate(learning_rate: f32) -> Self {
        Self::new(learning_rate, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn update(&mut self, name: &str, mut params: ArrayViewMutD<f32>, grads: ArrayViewD<f32>) {
        let (lr, b1, b2, eps) = (self.learning_rate, self.beta1, self.beta2, self.epsilon);
        let state = self.moments.entry(name.to_string()).or_insert_with(|| Moments {
            m: ArrayD::zeros(params.raw_dim()),
            v: ArrayD::zeros(params.raw_dim()),
            t: 0,
        });
        state.t += 1;
        let correction1 = 1.0 - b1.powi(state.t);
        let correction2 = 1.0 - b2.powi(state.t);

        Zip::from(&mut params)
            .and(&mut state.m)
            .and(&mut state.v)
            .and(&grads)
            .for_each(|p, m, v, &g| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / correction1;
                let v_hat = *v / correction2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
    }

    fn reset(&mut self) {
        self.moments.clear();
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}

/// Serializable optimizer choice for configs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerKind {
    /// SGD with momentum (0 for plain SGD)
    Sgd {
        /// Momentum coefficient
        momentum: f32,
    },
    /// Adam with default betas
    Adam,
}

impl OptimizerKind {
    /// Instantiate with `learning_rate`
    pub fn build(&self, learning_rate: f32) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::Sgd { momentum } => Box::new(Sgd::with_momentum(learning_rate, *momentum)),
            OptimizerKind::Adam => Box::new(Adam::with_learning_rate(learning_rate)),
        }
    }
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::Adam
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, ArrayD, IxDyn};

    #[test]
    fn test_sgd_update() {
        let mut opt = Sgd::new(0.1);
        let mut w = arr1(&[1.0f32, 2.0, 3.0]).into_dyn();
        let g = arr1(&[0.1f32, 0.2, 0.3]).into_dyn();
        opt.update("w", w.view_mut(), g.view());
        assert_abs_diff_eq!(w[[0]], 0.99, epsilon = 1e-6);
        assert_abs_diff_eq!(w[[2]], 2.97, epsilon = 1e-6);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut opt = Sgd::with_momentum(0.1, 0.9);
        let mut w = ArrayD::from_elem(IxDyn(&[1]), 0.0f32);
        let g = ArrayD::from_elem(IxDyn(&[1]), 1.0f32);

        opt.update("w", w.view_mut(), g.view());
        assert_abs_diff_eq!(w[[0]], -0.1, epsilon = 1e-6);
        opt.update("w", w.view_mut(), g.view());
        // v = 0.9 * -0.1 - 0.1 = -0.19
        assert_abs_diff_eq!(w[[0]], -0.29, epsilon = 1e-6);
    }

    #[test]
    fn test_adam_first_step_is_lr_sized() {
        let mut opt = Adam::with_learning_rate(0.01);
        let mut w = ArrayD::from_elem(IxDyn(&[2]), 1.0f32);
        let g = arr1(&[5.0f32, -0.001]).into_dyn();
        opt.update("w", w.view_mut(), g.view());

        // Bias correction makes the first step ~lr * sign(g).
        assert_abs_diff_eq!(w[[0]], 0.99, epsilon = 1e-4);
        assert_abs_diff_eq!(w[[1]], 1.01, epsilon = 1e-4);
    }

    #[test]
    fn test_adam_state_is_per_parameter() {
        let mut opt = Adam::with_learning_rate(0.1);
        let mut a = ArrayD::from_elem(IxDyn(&[1]), 0.0f32);
        let mut b = ArrayD::from_elem(IxDyn(&[1]), 0.0f32);
        let g = ArrayD::from_elem(IxDyn(&[1]), 1.0f32);

        opt.update("a", a.view_mut(), g.view());
        opt.update("a", a.view_mut(), g.view());
        opt.update("b", b.view_mut(), g.view());
        assert_abs_diff_eq!(b[[0]], -0.1, epsilon = 1e-4);

        opt.reset();
        opt.set_learning_rate(0.5);
        assert_eq!(opt.learning_rate(), 0.5);
    }

    #[test]
    fn test_optimizer_kind_from_json() {
        let kind: OptimizerKind = serde_json::from_str(r#"{"type":"sgd","momentum":0.9}"#).unwrap();
        assert_eq!(kind, OptimizerKind::Sgd { momentum: 0.9 });
        assert_eq!(kind.build(0.05).learning_rate(), 0.05);
    }
}
