//! 2D convolution over NHWC tensors (im2col + matmul)

use ndarray::{s, Array1, Array2, Array4, ArrayView4, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::optim::Optimizer;
use super::param::{Param, Parameterized};
use crate::core::StateDict;
use crate::{NetError, Result};

/// Spatial padding mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// Output size `ceil(in / stride)`, zero padding split top/left first
    Same,
    /// No padding, output size `(in - k) / stride + 1`
    Valid,
}

impl Padding {
    /// Output extent and leading pad for one axis
    fn resolve(self, input: usize, kernel: usize, stride: usize) -> Result<(usize, usize)> {
        match self {
            Padding::Same => {
                let out = (input + stride - 1) / stride;
                let needed = ((out - 1) * stride + kernel).saturating_sub(input);
                Ok((out, needed / 2))
            }
            Padding::Valid => {
                if input < kernel {
                    return Err(NetError::ShapeMismatch(format!(
                        "valid convolution needs input >= kernel ({} < {})",
                        input, kernel
                    )));
                }
                Ok(((input - kernel) / stride + 1, 0))
            }
        }
    }
}

#[derive(Clone, Debug)]
struct ConvCache {
    cols: Array2<f32>,
    input_dim: (usize, usize, usize, usize),
    out_hw: (usize, usize),
    pad: (usize, usize),
}

/// Convolution with kernels stored as `(kh, kw, in_channels, out_channels)`.
#[derive(Clone, Debug)]
pub struct Conv2d {
    name: String,
    kernel: (usize, usize),
    stride: usize,
    padding: Padding,
    weights: Param<ndarray::Ix4>,
    bias: Param<ndarray::Ix1>,
    cache: Option<ConvCache>,
}

impl Conv2d {
    /// Create a square-kernel convolution with Xavier-uniform weights
    pub fn new<R: Rng>(
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
        rng: &mut R,
    ) -> Self {
        let fan_in = (in_channels * kernel_size * kernel_size) as f32;
        let fan_out = (out_channels * kernel_size * kernel_size) as f32;
        let limit = (6.0 / (fan_in + fan_out)).sqrt();
        let weights = Array4::from_shape_fn(
            (kernel_size, kernel_size, in_channels, out_channels),
            |_| rng.gen_range(-limit..=limit),
        );
        Conv2d {
            name: name.to_string(),
            kernel: (kernel_size, kernel_size),
            stride: stride.max(1),
            padding,
            weights: Param::new(weights),
            bias: Param::new(Array1::zeros(out_channels)),
            cache: None,
        }
    }

    /// Input channel count
    pub fn in_channels(&self) -> usize {
        self.weights.value.shape()[2]
    }

    /// Output channel count
    pub fn out_channels(&self) -> usize {
        self.weights.value.shape()[3]
    }

    /// Output spatial size for an input of `height` x `width`
    pub fn output_hw(&self, height: usize, width: usize) -> Result<(usize, usize)> {
        let (oh, _) = self.padding.resolve(height, self.kernel.0, self.stride)?;
        let (ow, _) = self.padding.resolve(width, self.kernel.1, self.stride)?;
        Ok((oh, ow))
    }

    fn weight_matrix(&self) -> Result<Array2<f32>> {
        let (kh, kw) = self.kernel;
        let rows = kh * kw * self.in_channels();
        Ok(self
            .weights
            .value
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((rows, self.out_channels()))?)
    }

    fn im2col(&self, x: &ArrayView4<f32>) -> Result<ConvCache> {
        let (n, h, w, c) = x.dim();
        if c != self.in_channels() {
            return Err(NetError::ShapeMismatch(format!(
                "{} expects {} channels, got {}",
                self.name,
                self.in_channels(),
                c
            )));
        }
        let (kh, kw) = self.kernel;
        let (oh, pad_top) = self.padding.resolve(h, kh, self.stride)?;
        let (ow, pad_left) = self.padding.resolve(w, kw, self.stride)?;

        let mut cols = Array2::<f32>::zeros((n * oh * ow, kh * kw * c));
        for b in 0..n {
            for oy in 0..oh {
                for ox in 0..ow {
                    let row = (b * oh + oy) * ow + ox;
                    for ky in 0..kh {
                        let iy = (oy * self.stride + ky) as isize - pad_top as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = (ox * self.stride + kx) as isize - pad_left as isize;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            let col = (ky * kw + kx) * c;
                            cols.slice_mut(s![row, col..col + c])
                                .assign(&x.slice(s![b, iy as usize, ix as usize, ..]));
                        }
                    }
                }
            }
        }
        Ok(ConvCache {
            cols,
            input_dim: (n, h, w, c),
            out_hw: (oh, ow),
            pad: (pad_top, pad_left),
        })
    }

    /// Forward without caching
    pub fn apply(&self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let cache = self.im2col(&x)?;
        self.project(&cache)
    }

    fn project(&self, cache: &ConvCache) -> Result<Array4<f32>> {
        let (n, _, _, _) = cache.input_dim;
        let (oh, ow) = cache.out_hw;
        let out = cache.cols.dot(&self.weight_matrix()?) + &self.bias.value;
        Ok(out.into_shape_with_order((n, oh, ow, self.out_channels()))?)
    }

    /// Forward, caching the unfolded input for [`Conv2d::backward`]
    pub fn forward(&mut self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let cache = self.im2col(&x)?;
        let y = self.project(&cache)?;
        self.cache = Some(cache);
        Ok(y)
    }

    /// Accumulate parameter gradients and return `dL/dx`
    pub fn backward(&mut self, grad_output: ArrayView4<f32>) -> Result<Array4<f32>> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| NetError::InvalidArgument(format!("{}: backward before forward", self.name)))?;
        let (n, h, w, c) = cache.input_dim;
        let (oh, ow) = cache.out_hw;
        let out_c = self.out_channels();
        if grad_output.dim() != (n, oh, ow, out_c) {
            return Err(NetError::ShapeMismatch(format!(
                "{} produced {:?}, got gradient {:?}",
                self.name,
                (n, oh, ow, out_c),
                grad_output.dim()
            )));
        }

        let grad2 = grad_output
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n * oh * ow, out_c))?;
        let grad_w = cache.cols.t().dot(&grad2);
        let grad_cols = grad2.dot(&self.weight_matrix()?.t());

        let (kh, kw) = self.kernel;
        self.weights.grad += &grad_w.into_shape_with_order((kh, kw, c, out_c))?;
        self.bias.grad += &grad2.sum_axis(Axis(0));

        let (pad_top, pad_left) = cache.pad;
        let mut grad_input = Array4::<f32>::zeros((n, h, w, c));
        for b in 0..n {
            for oy in 0..oh {
                for ox in 0..ow {
                    let row = (b * oh + oy) * ow + ox;
                    for ky in 0..kh {
                        let iy = (oy * self.stride + ky) as isize - pad_top as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = (ox * self.stride + kx) as isize - pad_left as isize;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            let col = (ky * kw + kx) * c;
                            let mut target = grad_input.slice_mut(s![b, iy as usize, ix as usize, ..]);
                            target += &grad_cols.slice(s![row, col..col + c]);
                        }
                    }
                }
            }
        }
        Ok(grad_input)
    }
}

impl Parameterized for Conv2d {
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

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn conv(k: usize, stride: usize, padding: Padding) -> Conv2d {
        let mut rng = StdRng::seed_from_u64(0);
        Conv2d::new("conv", 1, 1, k, stride, padding, &mut rng)
    }

    #[test]
    fn test_output_sizes() {
        assert_eq!(conv(3, 1, Padding::Same).output_hw(28, 28).unwrap(), (28, 28));
        assert_eq!(conv(3, 2, Padding::Same).output_hw(7, 7).unwrap(), (4, 4));
        assert_eq!(conv(5, 1, Padding::Valid).output_hw(28, 28).unwrap(), (24, 24));
        assert!(conv(5, 1, Padding::Valid).output_hw(3, 3).is_err());
    }

    #[test]
    fn test_box_filter_same_padding() {
        let mut layer = conv(3, 1, Padding::Same);
        layer.weights.value.fill(1.0);
        let x = Array4::<f32>::ones((1, 3, 3, 1));
        let y = layer.forward(x.view()).unwrap();

        assert_eq!(y[[0, 1, 1, 0]], 9.0);
        assert_eq!(y[[0, 0, 0, 0]], 4.0);
        assert_eq!(y[[0, 0, 1, 0]], 6.0);
    }

    #[test]
    fn test_backward_input_gradient_counts_uses() {
        let mut layer = conv(3, 1, Padding::Same);
        layer.weights.value.fill(1.0);
        let x = Array4::<f32>::ones((1, 3, 3, 1));
        layer.forward(x.view()).unwrap();

        let dx = layer.backward(Array4::<f32>::ones((1, 3, 3, 1)).view()).unwrap();
        // Each input pixel feeds as many outputs as its 3x3 neighbourhood holds.
        assert_eq!(dx[[0, 1, 1, 0]], 9.0);
        assert_eq!(dx[[0, 0, 0, 0]], 4.0);
        assert_eq!(layer.bias.grad[0], 9.0);
        assert_eq!(layer.weights.grad[[1, 1, 0, 0]], 9.0);
        assert_eq!(layer.weights.grad[[0, 0, 0, 0]], 4.0);
    }

    #[test]
    fn test_numeric_gradient() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = Conv2d::new("conv", 2, 3, 3, 2, Padding::Same, &mut rng);
        let x = Array4::from_shape_fn((2, 5, 5, 2), |(b, i, j, c)| ((b + i * 3 + j * 7 + c) % 5) as f32 * 0.1);

        let y = layer.forward(x.view()).unwrap();
        layer.backward(Array4::ones(y.raw_dim()).view()).unwrap();
        let analytic = layer.weights.grad[[1, 2, 1, 0]];

        let eps = 1e-2;
        layer.weights.value[[1, 2, 1, 0]] += eps;
        let plus = layer.apply(x.view()).unwrap().sum();
        layer.weights.value[[1, 2, 1, 0]] -= 2.0 * eps;
        let minus = layer.apply(x.view()).unwrap().sum();

        let numeric = (plus - minus) / (2.0 * eps);
        assert!((numeric - analytic).abs() < 1e-2, "{} vs {}", numeric, analytic);
    }

    #[test]
    fn test_channel_mismatch() {
        let layer = conv(3, 1, Padding::Same);
        assert!(layer.apply(Array4::<f32>::zeros((1, 4, 4, 2)).view()).is_err());
    }
}
