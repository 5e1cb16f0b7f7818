//! Channel-wise spatial normalization
//!
//! Normalizes each spatial position of a feature map across its channels,
//! then applies a learned per-channel affine transform. Unlike group
//! normalization the statistics never pool over height or width.

use burn::module::Param;
use burn::prelude::*;

use crate::attention::AttentionKind;

/// Configuration for [`SpatialLayerNorm`]
#[derive(Debug, Clone)]
pub struct SpatialNormConfig {
    /// Number of channels
    pub channels: usize,
    /// Added to the variance before the square root
    pub eps: f64,
}

impl SpatialNormConfig {
    /// Creates a config with the default epsilon (1e-5)
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            eps: 1e-5,
        }
    }

    /// Overrides epsilon
    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Initializes the normalization with unit gain and zero bias
    pub fn init<B: Backend>(&self, device: &B::Device) -> SpatialLayerNorm<B> {
        SpatialLayerNorm {
            gain: Param::from_tensor(Tensor::ones([self.channels], device)),
            bias: Param::from_tensor(Tensor::zeros([self.channels], device)),
            eps: self.eps,
        }
    }
}

/// Spatial layer normalization over the channel axis
///
/// # Formula
///
/// For input `x` of shape `[B, C, H, W]`, statistics are taken over `C` only:
/// ```text
/// y = (x - mean_c(x)) / sqrt(var_c(x) + eps) * gain + bias
/// ```
/// where the variance is biased (divides by `C`).
#[derive(Module, Debug)]
pub struct SpatialLayerNorm<B: Backend> {
    /// Per-channel scale, shape `[channels]`
    pub gain: Param<Tensor<B, 1>>,
    /// Per-channel shift, shape `[channels]`
    pub bias: Param<Tensor<B, 1>>,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> SpatialLayerNorm<B> {
    /// Creates a normalization over `channels` with epsilon 1e-5
    pub fn new(channels: usize, device: &B::Device) -> Self {
        SpatialNormConfig::new(channels).init(device)
    }

    /// Number of channels this normalization expects
    pub fn channels(&self) -> usize {
        let [channels] = self.gain.dims();
        channels
    }

    /// Applies the normalization to `[batch, channels, height, width]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, channels, _, _] = x.dims();

        let mean = x.clone().mean_dim(1);
        let var = x.clone().var_bias(1);
        let x = (x - mean) / (var + self.eps).sqrt();

        let gain = self.gain.val().reshape([1, channels, 1, 1]);
        let bias = self.bias.val().reshape([1, channels, 1, 1]);

        x * gain + bias
    }
}

/// Normalization followed by a spatial attention block
///
/// `forward(x) = attention(norm(x))`; the output shape is whatever the
/// wrapped attention returns, which is always the input shape.
#[derive(Module, Debug)]
pub struct PreNorm<B: Backend> {
    pub norm: SpatialLayerNorm<B>,
    pub inner: AttentionKind<B>,
}

impl<B: Backend> PreNorm<B> {
    pub fn new(inner: AttentionKind<B>, device: &B::Device) -> Self {
        let channels = inner.as_attention().channels();
        Self {
            norm: SpatialLayerNorm::new(channels, device),
            inner,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.inner.as_attention().forward(self.norm.forward(x))
    }
}
