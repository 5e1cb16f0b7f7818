//! Spatial attention over flattened feature-map positions
//!
//! Two interchangeable variants share one projection layout: a bias-free
//! 1x1 convolution to joint query/key/value channels, `heads` groups of
//! `dim_head` channels each, and a 1x1 convolution back to the input width.
//!
//! - [`LinearAttention`] normalizes keys over positions first and builds a
//!   `dim_head x dim_head` context per head. Cost is linear in `H * W`.
//! - [`FullAttention`] is scaled dot-product attention over all position
//!   pairs. Cost is quadratic in `H * W`, so it belongs at the lowest
//!   resolution only.

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::error::LayerError;

/// Capability shared by both attention variants
pub trait SpatialAttention<B: Backend> {
    /// Maps `[batch, channels, height, width]` to the same shape
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Input and output channel count
    fn channels(&self) -> usize;

    /// Number of attention heads
    fn heads(&self) -> usize;
}

/// Attention geometry shared by both variants
#[derive(Debug, Clone)]
pub struct AttentionConfig {
    /// Feature-map channels in and out
    pub channels: usize,
    /// Number of heads (default 4)
    pub heads: usize,
    /// Channels per head (default 32)
    pub dim_head: usize,
}

impl AttentionConfig {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            heads: 4,
            dim_head: 32,
        }
    }

    /// Geometry from a total hidden width, which must split evenly across heads
    pub fn from_hidden(channels: usize, heads: usize, hidden: usize) -> Result<Self, LayerError> {
        if heads == 0 || hidden == 0 || hidden % heads != 0 {
            return Err(LayerError::InvalidAttention {
                channels,
                heads,
                hidden,
            });
        }
        Ok(Self {
            channels,
            heads,
            dim_head: hidden / heads,
        })
    }

    pub fn with_heads(mut self, heads: usize) -> Self {
        self.heads = heads;
        self
    }

    pub fn with_dim_head(mut self, dim_head: usize) -> Self {
        self.dim_head = dim_head;
        self
    }

    /// Total query (and key, and value) width
    pub fn hidden(&self) -> usize {
        self.heads * self.dim_head
    }

    fn validate(&self) -> Result<(), LayerError> {
        if self.channels == 0 || self.heads == 0 || self.dim_head == 0 {
            return Err(LayerError::InvalidAttention {
                channels: self.channels,
                heads: self.heads,
                hidden: self.hidden(),
            });
        }
        Ok(())
    }

    fn projections<B: Backend>(&self, device: &B::Device) -> (Conv2d<B>, Conv2d<B>) {
        let hidden = self.hidden();
        let to_qkv = Conv2dConfig::new([self.channels, hidden * 3], [1, 1])
            .with_bias(false)
            .init(device);
        let to_out = Conv2dConfig::new([hidden, self.channels], [1, 1]).init(device);
        (to_qkv, to_out)
    }

    /// Initializes the linear-complexity variant
    pub fn init_linear<B: Backend>(&self, device: &B::Device) -> Result<LinearAttention<B>, LayerError> {
        self.validate()?;
        let (to_qkv, to_out) = self.projections(device);
        Ok(LinearAttention {
            to_qkv,
            to_out,
            channels: self.channels,
            heads: self.heads,
            dim_head: self.dim_head,
        })
    }

    /// Initializes the quadratic-complexity variant
    pub fn init_full<B: Backend>(&self, device: &B::Device) -> Result<FullAttention<B>, LayerError> {
        self.validate()?;
        let (to_qkv, to_out) = self.projections(device);
        Ok(FullAttention {
            to_qkv,
            to_out,
            channels: self.channels,
            heads: self.heads,
            dim_head: self.dim_head,
        })
    }
}

/// Splits a joint projection into per-head `[batch, heads, dim_head, positions]`
fn split_heads<B: Backend>(
    qkv: Tensor<B, 4>,
    heads: usize,
    dim_head: usize,
) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
    let [batch, _, height, width] = qkv.dims();
    let hidden = heads * dim_head;
    let shape = [batch, heads, dim_head, height * width];

    let q = qkv.clone().narrow(1, 0, hidden).reshape(shape);
    let k = qkv.clone().narrow(1, hidden, hidden).reshape(shape);
    let v = qkv.narrow(1, 2 * hidden, hidden).reshape(shape);

    (q, k, v)
}

/// Softmax with the row maximum subtracted first
///
/// The maximum is detached, so it only shifts the scores and carries no
/// gradient. The result is invariant to adding a constant to every score.
pub fn stable_softmax<B: Backend, const D: usize>(scores: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let max = scores.clone().max_dim(dim).detach();
    softmax(scores - max, dim)
}

/// Linear attention with key softmax over positions
#[derive(Module, Debug)]
pub struct LinearAttention<B: Backend> {
    /// Joint query/key/value projection (no bias)
    pub to_qkv: Conv2d<B>,
    /// Output projection back to `channels`
    pub to_out: Conv2d<B>,
    pub channels: usize,
    pub heads: usize,
    pub dim_head: usize,
}

impl<B: Backend> LinearAttention<B> {
    /// Normalized key relevance, `[batch, heads, dim_head, positions]`
    ///
    /// Every `(batch, head, channel)` row sums to one across positions.
    pub fn key_weights(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let (_, k, _) = split_heads(self.to_qkv.forward(x), self.heads, self.dim_head);
        softmax(k, 3)
    }
}

impl<B: Backend> SpatialAttention<B> for LinearAttention<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, _, height, width] = x.dims();
        let scale = (self.dim_head as f64).powf(-0.5);

        let (q, k, v) = split_heads(self.to_qkv.forward(x), self.heads, self.dim_head);
        let q = q * scale;
        let k = softmax(k, 3);

        // context[d, e] = sum_n k[d, n] * v[e, n]
        let context = k.matmul(v.swap_dims(2, 3));
        // out[e, n] = sum_d context[d, e] * q[d, n]
        let out = context.swap_dims(2, 3).matmul(q);

        let out = out.reshape([batch, self.heads * self.dim_head, height, width]);
        self.to_out.forward(out)
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn heads(&self) -> usize {
        self.heads
    }
}

/// Full scaled dot-product attention over all position pairs
#[derive(Module, Debug)]
pub struct FullAttention<B: Backend> {
    /// Joint query/key/value projection (no bias)
    pub to_qkv: Conv2d<B>,
    /// Output projection back to `channels`
    pub to_out: Conv2d<B>,
    pub channels: usize,
    pub heads: usize,
    pub dim_head: usize,
}

impl<B: Backend> FullAttention<B> {
    /// Scaled similarity scores, `[batch, heads, positions, positions]`
    pub fn scores(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let (q, k, _) = split_heads(self.to_qkv.forward(x), self.heads, self.dim_head);
        Self::similarity(q, k, self.dim_head)
    }

    fn similarity(q: Tensor<B, 4>, k: Tensor<B, 4>, dim_head: usize) -> Tensor<B, 4> {
        let scale = (dim_head as f64).powf(-0.5);
        // sim[i, j] = sum_d q[d, i] * k[d, j]
        (q * scale).swap_dims(2, 3).matmul(k)
    }
}

impl<B: Backend> SpatialAttention<B> for FullAttention<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, _, height, width] = x.dims();

        let (q, k, v) = split_heads(self.to_qkv.forward(x), self.heads, self.dim_head);
        let attn = stable_softmax(Self::similarity(q, k, self.dim_head), 3);

        // [b, h, n, n] x [b, h, n, d] -> [b, h, n, d]
        let out = attn.matmul(v.swap_dims(2, 3));
        let out = out
            .swap_dims(2, 3)
            .reshape([batch, self.heads * self.dim_head, height, width]);

        self.to_out.forward(out)
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn heads(&self) -> usize {
        self.heads
    }
}

/// Attention variant chosen per resolution level at construction
#[derive(Module, Debug)]
pub enum AttentionKind<B: Backend> {
    Linear(LinearAttention<B>),
    Full(FullAttention<B>),
}

impl<B: Backend> AttentionKind<B> {
    pub fn as_attention(&self) -> &dyn SpatialAttention<B> {
        match self {
            AttentionKind::Linear(attn) => attn,
            AttentionKind::Full(attn) => attn,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, AttentionKind::Full(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_linear_attention_shape() {
        let device = Default::default();
        let attn = AttentionConfig::new(24)
            .init_linear::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::random([2, 24, 6, 5], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(attn.forward(x).dims(), [2, 24, 6, 5]);
    }

    #[test]
    fn test_linear_attention_values() {
        use burn::module::Param;
        use burn::tensor::TensorData;

        let device = Default::default();
        let mut attn = AttentionConfig::new(2)
            .with_heads(1)
            .with_dim_head(2)
            .init_linear::<TestBackend>(&device)
            .unwrap();

        // q = k = x, v = [2 x0, x0 + x1]; identity output projection
        let qkv = vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 1.0, 1.0];
        attn.to_qkv.weight = Param::from_tensor(Tensor::from_data(
            TensorData::new(qkv, [6, 2, 1, 1]),
            &device,
        ));
        attn.to_out.weight = Param::from_tensor(Tensor::from_data(
            TensorData::new(vec![1.0f32, 0.0, 0.0, 1.0], [2, 2, 1, 1]),
            &device,
        ));
        attn.to_out.bias = Some(Param::from_tensor(Tensor::zeros([2], &device)));

        // Two positions: channel 0 = [1, 2], channel 1 = [0.5, -1]
        let x = Tensor::from_data(
            TensorData::new(vec![1.0f32, 2.0, 0.5, -1.0], [1, 2, 1, 2]),
            &device,
        );
        let out = attn.forward(x).into_data().to_vec::<f32>().unwrap();

        // out[e, n] = scale * sum_d context[d, e] * q[d, n]
        let expected = [3.2841876, 3.2239708, 1.3002734, 0.6082209];
        for (a, b) in out.iter().zip(expected) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_full_attention_shape() {
        let device = Default::default();
        let attn = AttentionConfig::new(16)
            .with_heads(2)
            .with_dim_head(8)
            .init_full::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::random([1, 16, 4, 3], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(attn.forward(x).dims(), [1, 16, 4, 3]);
    }

    #[test]
    fn test_key_softmax_sums_to_one() {
        let device = Default::default();
        let attn = AttentionConfig::new(8)
            .with_heads(2)
            .with_dim_head(4)
            .init_linear::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::random([2, 8, 5, 5], Distribution::Normal(0.0, 1.0), &device);

        let weights = attn.key_weights(x);
        assert_eq!(weights.dims(), [2, 2, 4, 25]);

        let sums = weights.sum_dim(3).into_data().to_vec::<f32>().unwrap();
        assert_eq!(sums.len(), 2 * 2 * 4);
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5, "row sums to {}", s);
        }
    }

    #[test]
    fn test_stable_softmax_shift_invariance() {
        let device = Default::default();
        let scores = Tensor::<TestBackend, 4>::random(
            [1, 2, 6, 6],
            Distribution::Normal(0.0, 3.0),
            &device,
        );

        let base = stable_softmax(scores.clone(), 3)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let shifted = stable_softmax(scores + 100.0, 3)
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        for (a, b) in base.iter().zip(&shifted) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_full_attention_large_scores_stay_finite() {
        let device = Default::default();
        let attn = AttentionConfig::new(8)
            .with_heads(1)
            .with_dim_head(8)
            .init_full::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::random([1, 8, 4, 4], Distribution::Normal(0.0, 1.0), &device) * 1e3;

        let out = attn.forward(x).into_data().to_vec::<f32>().unwrap();
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_scores_shape() {
        let device = Default::default();
        let attn = AttentionConfig::new(8)
            .with_heads(2)
            .with_dim_head(4)
            .init_full::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::zeros([3, 8, 2, 3], &device);
        assert_eq!(attn.scores(x).dims(), [3, 2, 6, 6]);
    }

    #[test]
    fn test_rejects_uneven_hidden_width() {
        assert_eq!(
            AttentionConfig::from_hidden(32, 3, 64).unwrap_err(),
            LayerError::InvalidAttention {
                channels: 32,
                heads: 3,
                hidden: 64
            }
        );
        let config = AttentionConfig::from_hidden(32, 4, 64).unwrap();
        assert_eq!(config.dim_head, 16);
    }

    #[test]
    fn test_rejects_zero_heads() {
        let device = Default::default();
        let result = AttentionConfig::new(8)
            .with_heads(0)
            .init_linear::<TestBackend>(&device);
        assert!(matches!(result, Err(LayerError::InvalidAttention { .. })));
    }

    #[test]
    fn test_attention_kind_dispatch() {
        let device = Default::default();
        let config = AttentionConfig::new(8).with_heads(2).with_dim_head(4);
        let linear = AttentionKind::Linear(config.init_linear::<TestBackend>(&device).unwrap());
        let full = AttentionKind::Full(config.init_full::<TestBackend>(&device).unwrap());

        assert!(!linear.is_full());
        assert!(full.is_full());
        assert_eq!(linear.as_attention().channels(), 8);
        assert_eq!(full.as_attention().heads(), 2);
    }
}
