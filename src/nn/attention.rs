//! Dot-product (Luong) attention of decoder states over encoder states

use ndarray::{s, Array3, ArrayView3, Axis};

use super::activations::softmax;
use crate::{NetError, Result};

#[derive(Clone, Debug)]
struct AttentionCache {
    queries: Array3<f32>,
    memory: Array3<f32>,
    weights: Array3<f32>,
}

/// Gradients flowing out of [`DotAttention::backward`]
#[derive(Clone, Debug)]
pub struct AttentionGrads {
    /// `dL/d(decoder states)`
    pub queries: Array3<f32>,
    /// `dL/d(encoder states)`
    pub memory: Array3<f32>,
}

/// Parameter-free attention: `softmax(q · mᵀ) · m`.
#[derive(Clone, Debug, Default)]
pub struct DotAttention {
    cache: Option<AttentionCache>,
}

impl DotAttention {
    /// Create an attention block
    pub fn new() -> Self {
        Self::default()
    }

    fn check(queries: &ArrayView3<f32>, memory: &ArrayView3<f32>) -> Result<()> {
        let (qn, _, qh) = queries.dim();
        let (mn, _, mh) = memory.dim();
        if qn != mn || qh != mh {
            return Err(NetError::ShapeMismatch(format!(
                "attention queries {:?} vs memory {:?}",
                queries.dim(),
                memory.dim()
            )));
        }
        Ok(())
    }

    /// Attention weights `(batch, queries, memory)` and context vectors `(batch, queries, hidden)`
    pub fn apply(&self, queries: ArrayView3<f32>, memory: ArrayView3<f32>) -> Result<(Array3<f32>, Array3<f32>)> {
        Self::check(&queries, &memory)?;
        let (n, tq, h) = queries.dim();
        let tm = memory.dim().1;
        let mut scores = Array3::<f32>::zeros((n, tq, tm));
        for b in 0..n {
            scores
                .slice_mut(s![b, .., ..])
                .assign(&queries.slice(s![b, .., ..]).dot(&memory.slice(s![b, .., ..]).t()));
        }
        let weights = softmax(scores.view(), Axis(2));
        let mut context = Array3::<f32>::zeros((n, tq, h));
        for b in 0..n {
            context
                .slice_mut(s![b, .., ..])
                .assign(&weights.slice(s![b, .., ..]).dot(&memory.slice(s![b, .., ..])));
        }
        Ok((weights, context))
    }

    /// Context vectors, caching inputs for [`DotAttention::backward`]
    pub fn forward(&mut self, queries: ArrayView3<f32>, memory: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (weights, context) = self.apply(queries, memory)?;
        self.cache = Some(AttentionCache {
            queries: queries.to_owned(),
            memory: memory.to_owned(),
            weights,
        });
        Ok(context)
    }

    /// Split the context gradient between queries and memory
    pub fn backward(&self, grad_context: ArrayView3<f32>) -> Result<AttentionGrads> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| NetError::InvalidArgument("attention: backward before forward".into()))?;
        if grad_context.dim() != cache.queries.dim() {
            return Err(NetError::ShapeMismatch(format!(
                "attention produced {:?}, got gradient {:?}",
                cache.queries.dim(),
                grad_context.dim()
            )));
        }
        let n = cache.queries.dim().0;
        let mut grad_queries = Array3::<f32>::zeros(cache.queries.raw_dim());
        let mut grad_memory = Array3::<f32>::zeros(cache.memory.raw_dim());
        for b in 0..n {
            let a = cache.weights.slice(s![b, .., ..]);
            let m = cache.memory.slice(s![b, .., ..]);
            let q = cache.queries.slice(s![b, .., ..]);
            let dc = grad_context.slice(s![b, .., ..]);

            let da = dc.dot(&m.t());
            let inner = (&da * &a).sum_axis(Axis(1)).insert_axis(Axis(1));
            let ds = &a * &(&da - &inner);

            grad_queries.slice_mut(s![b, .., ..]).assign(&ds.dot(&m));
            let dm = a.t().dot(&dc) + ds.t().dot(&q);
            grad_memory.slice_mut(s![b, .., ..]).assign(&dm);
        }
        Ok(AttentionGrads {
            queries: grad_queries,
            memory: grad_memory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> (Array3<f32>, Array3<f32>) {
        let q = Array3::from_shape_fn((2, 3, 4), |(b, t, h)| ((b + t * 2 + h) % 4) as f32 * 0.3 - 0.5);
        let m = Array3::from_shape_fn((2, 5, 4), |(b, t, h)| ((2 * b + t + 3 * h) % 5) as f32 * 0.25 - 0.5);
        (q, m)
    }

    #[test]
    fn test_weights_are_distributions() {
        let (q, m) = inputs();
        let (weights, context) = DotAttention::new().apply(q.view(), m.view()).unwrap();
        assert_eq!(weights.dim(), (2, 3, 5));
        assert_eq!(context.dim(), (2, 3, 4));
        for lane in weights.lanes(Axis(2)) {
            assert!((lane.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_numeric_gradients() {
        let (q, mut m) = inputs();
        let mut attn = DotAttention::new();
        let ctx = attn.forward(q.view(), m.view()).unwrap();
        let grads = attn.backward(Array3::ones(ctx.raw_dim()).view()).unwrap();

        let eps = 1e-2;
        let idx = [1, 2, 3];
        let analytic = grads.memory[idx];
        m[idx] += eps;
        let plus = attn.apply(q.view(), m.view()).unwrap().1.sum();
        m[idx] -= 2.0 * eps;
        let minus = attn.apply(q.view(), m.view()).unwrap().1.sum();
        let numeric = (plus - minus) / (2.0 * eps);
        assert!((numeric - analytic).abs() < 1e-2, "{} vs {}", numeric, analytic);
    }

    #[test]
    fn test_mismatched_hidden() {
        let q = Array3::<f32>::zeros((1, 2, 3));
        let m = Array3::<f32>::zeros((1, 2, 4));
        assert!(DotAttention::new().apply(q.view(), m.view()).is_err());
    }
}
