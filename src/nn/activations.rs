//! Element-wise activations and dropout

use ndarray::{Array, ArrayView, Axis, Dimension, RemoveAxis, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{NetError, Result};

/// Rectified linear unit, caching its mask between forward and backward.
#[derive(Clone, Debug, Default)]
pub struct Relu {
    mask: Option<Array<bool, ndarray::IxDyn>>,
}

impl Relu {
    /// Create a ReLU
    pub fn new() -> Self {
        Self::default()
    }

    /// `max(x, 0)`, caching where `x > 0`
    pub fn forward<D: Dimension>(&mut self, x: ArrayView<f32, D>) -> Array<f32, D> {
        self.mask = Some(x.map(|&v| v > 0.0).into_dyn());
        x.map(|&v| v.max(0.0))
    }

    /// Gradient passes where the input was positive
    pub fn backward<D: Dimension>(&self, grad_output: ArrayView<f32, D>) -> Result<Array<f32, D>> {
        let mask = self
            .mask
            .as_ref()
            .ok_or_else(|| NetError::InvalidArgument("relu: backward before forward".into()))?;
        if mask.shape() != grad_output.shape() {
            return Err(NetError::ShapeMismatch(format!(
                "relu cached {:?}, got gradient {:?}",
                mask.shape(),
                grad_output.shape()
            )));
        }
        let mut grad = grad_output.to_owned();
        Zip::from(&mut grad)
            .and(mask.view().into_dimensionality::<D>()?)
            .for_each(|g, &keep| {
                if !keep {
                    *g = 0.0;
                }
            });
        Ok(grad)
    }
}

/// Inverted dropout: active only when the feed is in training mode.
#[derive(Clone, Debug)]
pub struct Dropout {
    rate: f32,
    rng: StdRng,
    scale: Option<Array<f32, ndarray::IxDyn>>,
}

impl Dropout {
    /// Drop each unit with probability `rate`
    pub fn new(rate: f32, seed: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(NetError::InvalidArgument(format!(
                "dropout rate must be in [0, 1), got {}",
                rate
            )));
        }
        Ok(Dropout {
            rate,
            rng: StdRng::seed_from_u64(seed),
            scale: None,
        })
    }

    /// Drop probability
    pub fn rate(&self) -> f32 {
        self.rate
    }

    /// Identity outside training; otherwise zero units and rescale survivors
    pub fn forward<D: Dimension>(&mut self, x: ArrayView<f32, D>, training: bool) -> Array<f32, D> {
        if !training || self.rate == 0.0 {
            self.scale = None;
            return x.to_owned();
        }
        let keep = 1.0 - self.rate;
        let rate = self.rate;
        let rng = &mut self.rng;
        let scale = x.map(|_| if rng.gen::<f32>() < rate { 0.0 } else { 1.0 / keep });
        let y = &x * &scale;
        self.scale = Some(scale.into_dyn());
        y
    }

    /// Apply the same mask to the gradient
    pub fn backward<D: Dimension>(&self, grad_output: ArrayView<f32, D>) -> Result<Array<f32, D>> {
        match &self.scale {
            None => Ok(grad_output.to_owned()),
            Some(scale) => {
                let scale = scale.view().into_dimensionality::<D>()?;
                Ok(&grad_output * &scale)
            }
        }
    }
}

/// Numerically stable softmax along `axis`
pub fn softmax<D: Dimension + RemoveAxis>(x: ArrayView<f32, D>, axis: Axis) -> Array<f32, D> {
    let mut out = x.to_owned();
    for mut lane in out.lanes_mut(axis) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    out
}

/// Index of the largest value in each lane along the last axis
pub fn argmax_last<D: Dimension + RemoveAxis>(x: ArrayView<f32, D>) -> Array<usize, D::Smaller> {
    let last = Axis(x.ndim() - 1);
    x.map_axis(last, |lane| {
        lane.iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
            .0
    })
}
