//! Max pooling and nearest-neighbour upsampling over NHWC tensors

use ndarray::{Array4, ArrayView4};

use crate::{NetError, Result};

/// Non-overlapping max pooling with a square window.
///
/// Output size is `ceil(in / size)`; windows at the border are clipped.
#[derive(Clone, Debug)]
pub struct MaxPool2d {
    size: usize,
    argmax: Option<(Array4<(usize, usize)>, (usize, usize, usize, usize))>,
}

impl MaxPool2d {
    /// Pool with a `size` x `size` window and equal stride
    pub fn new(size: usize) -> Self {
        MaxPool2d {
            size: size.max(1),
            argmax: None,
        }
    }

    /// Output spatial size
    pub fn output_hw(&self, height: usize, width: usize) -> (usize, usize) {
        ((height + self.size - 1) / self.size, (width + self.size - 1) / self.size)
    }

    fn pool(&self, x: &ArrayView4<f32>) -> (Array4<f32>, Array4<(usize, usize)>) {
        let (n, h, w, c) = x.dim();
        let (oh, ow) = self.output_hw(h, w);
        let mut out = Array4::<f32>::zeros((n, oh, ow, c));
        let mut idx = Array4::<(usize, usize)>::from_elem((n, oh, ow, c), (0, 0));
        for ((b, oy, ox, ch), value) in out.indexed_iter_mut() {
            let mut best = f32::NEG_INFINITY;
            let mut at = (oy * self.size, ox * self.size);
            for iy in oy * self.size..((oy + 1) * self.size).min(h) {
                for ix in ox * self.size..((ox + 1) * self.size).min(w) {
                    let v = x[[b, iy, ix, ch]];
                    if v > best {
                        best = v;
                        at = (iy, ix);
                    }
                }
            }
            *value = best;
            idx[[b, oy, ox, ch]] = at;
        }
        (out, idx)
    }

    /// Forward without caching
    pub fn apply(&self, x: ArrayView4<f32>) -> Array4<f32> {
        self.pool(&x).0
    }

    /// Forward, remembering which input won each window
    pub fn forward(&mut self, x: ArrayView4<f32>) -> Array4<f32> {
        let (out, idx) = self.pool(&x);
        self.argmax = Some((idx, x.dim()));
        out
    }

    /// Route each gradient to the winning input position
    pub fn backward(&self, grad_output: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (idx, input_dim) = self
            .argmax
            .as_ref()
            .ok_or_else(|| NetError::InvalidArgument("max_pool: backward before forward".into()))?;
        if idx.dim() != grad_output.dim() {
            return Err(NetError::ShapeMismatch(format!(
                "max_pool produced {:?}, got gradient {:?}",
                idx.dim(),
                grad_output.dim()
            )));
        }
        let mut grad = Array4::<f32>::zeros(*input_dim);
        for ((b, oy, ox, ch), &(iy, ix)) in idx.indexed_iter() {
            grad[[b, iy, ix, ch]] += grad_output[[b, oy, ox, ch]];
        }
        Ok(grad)
    }
}

/// Nearest-neighbour upsampling by an integer factor.
#[derive(Clone, Copy, Debug)]
pub struct Upsample2d {
    factor: usize,
}

impl Upsample2d {
    /// Repeat every pixel `factor` x `factor` times
    pub fn new(factor: usize) -> Self {
        Upsample2d { factor: factor.max(1) }
    }

    /// Upsample
    pub fn forward(&self, x: ArrayView4<f32>) -> Array4<f32> {
        let (n, h, w, c) = x.dim();
        let f = self.factor;
        Array4::from_shape_fn((n, h * f, w * f, c), |(b, y, xx, ch)| x[[b, y / f, xx / f, ch]])
    }

    /// Sum the gradient over each replicated block
    pub fn backward(&self, grad_output: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (n, h, w, c) = grad_output.dim();
        let f = self.factor;
        if h % f != 0 || w % f != 0 {
            return Err(NetError::ShapeMismatch(format!(
                "upsample gradient {}x{} is not a multiple of {}",
                h, w, f
            )));
        }
        let mut grad = Array4::<f32>::zeros((n, h / f, w / f, c));
        for ((b, y, x, ch), &g) in grad_output.indexed_iter() {
            grad[[b, y / f, x / f, ch]] += g;
        }
        Ok(grad)
    }
}
