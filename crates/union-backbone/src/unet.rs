//! Multi-resolution Unet backbone
//!
//! Channel widths per level are `dims = [channels, dim * m0, dim * m1, ...]`.
//!
//! ```text
//! down level k:  stage(dims[k] -> dims[k+1]) -> stage -> attn -> [push] -> Down2x
//! middle:        stage -> full attn -> stage
//! up level k:    [pop] resize x to skip, cat(x, skip) -> stage(2 dims[k+1] -> out_k)
//!                -> stage -> attn -> Up2x
//! output:        resize to input size -> stage(dim -> dim) -> 1x1 conv
//! ```
//!
//! The last down level has no Down2x and the up level mirroring the first
//! down level has no Up2x. Every level pushes and pops exactly one skip.

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use union_core::attention::{AttentionConfig, AttentionKind};
use union_core::norm::PreNorm;
use union_core::residual::Residual;
use union_core::skip::{SkipStack, SkipTrace};

use crate::encoder::Conditioning;
use crate::error::BackboneError;
use crate::resample::{resize_to, Down2x, Up2x};
use crate::stage::{ConvNeXtStage, StageConfig};

/// Configuration for [`Unet`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnetConfig {
    /// Base width; also the time embedding width
    pub dim: usize,
    /// Output channels, defaults to `channels`
    pub out_dim: Option<usize>,
    /// Width multiplier per resolution level
    pub dim_mults: Vec<usize>,
    /// Input channels
    pub channels: usize,
    pub frame_conditioned: bool,
    pub heads: usize,
    pub dim_head: usize,
    pub expand: usize,
    pub eps: f64,
}

impl Default for UnetConfig {
    fn default() -> Self {
        Self {
            dim: 64,
            out_dim: None,
            dim_mults: vec![1, 2, 4, 8],
            channels: 3,
            frame_conditioned: false,
            heads: 4,
            dim_head: 32,
            expand: 3,
            eps: 1e-5,
        }
    }
}

impl UnetConfig {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    pub fn with_out_dim(mut self, out_dim: usize) -> Self {
        self.out_dim = Some(out_dim);
        self
    }

    pub fn with_dim_mults(mut self, dim_mults: Vec<usize>) -> Self {
        self.dim_mults = dim_mults;
        self
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_frame_conditioned(mut self, frame_conditioned: bool) -> Self {
        self.frame_conditioned = frame_conditioned;
        self
    }

    pub fn with_heads(mut self, heads: usize) -> Self {
        self.heads = heads;
        self
    }

    pub fn with_dim_head(mut self, dim_head: usize) -> Self {
        self.dim_head = dim_head;
        self
    }

    pub fn with_expand(mut self, expand: usize) -> Self {
        self.expand = expand;
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Output channels after applying the default
    pub fn resolved_out_dim(&self) -> usize {
        self.out_dim.unwrap_or(self.channels)
    }

    /// Width of the conditioning vector every stage receives
    pub fn emb_dim(&self) -> usize {
        if self.frame_conditioned {
            self.dim * 2
        } else {
            self.dim
        }
    }

    /// `[channels, dim * m0, dim * m1, ...]`
    pub fn level_dims(&self) -> Result<Vec<usize>, BackboneError> {
        if self.dim_mults.is_empty() {
            return Err(BackboneError::ZeroDimension {
                what: "unet resolution levels",
            });
        }
        if self.dim_mults.iter().any(|m| *m == 0) {
            return Err(BackboneError::ZeroDimension {
                what: "unet dim multiplier",
            });
        }
        let mut dims = Vec::with_capacity(self.dim_mults.len() + 1);
        dims.push(self.channels);
        dims.extend(self.dim_mults.iter().map(|m| self.dim * m));
        Ok(dims)
    }

    fn stage(&self, in_dim: usize, out_dim: usize, norm: bool) -> StageConfig {
        StageConfig::new(in_dim, out_dim)
            .with_emb_dim(Some(self.emb_dim()))
            .with_norm(norm)
            .with_expand(self.expand)
            .with_eps(self.eps)
    }

    fn attention<B: Backend>(
        &self,
        channels: usize,
        full: bool,
        device: &B::Device,
    ) -> Result<Residual<B>, BackboneError> {
        let config = AttentionConfig::new(channels)
            .with_heads(self.heads)
            .with_dim_head(self.dim_head);
        let kind = if full {
            AttentionKind::Full(config.init_full(device)?)
        } else {
            AttentionKind::Linear(config.init_linear(device)?)
        };
        Ok(Residual::new(PreNorm::new(kind, device)))
    }

    /// Builds the Unet
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Unet<B>, BackboneError> {
        if self.dim == 0 || self.channels == 0 || self.resolved_out_dim() == 0 {
            return Err(BackboneError::ZeroDimension {
                what: "unet dim/channels",
            });
        }
        let dims = self.level_dims()?;
        let levels = self.dim_mults.len();
        let conditioning = Conditioning::new(self.dim, self.frame_conditioned, device)?;

        let mut downs = Vec::with_capacity(levels);
        for k in 0..levels {
            let (dim_in, dim_out) = (dims[k], dims[k + 1]);
            let is_last = k + 1 == levels;
            tracing::debug!(level = k, dim_in, dim_out, downsample = !is_last, "unet down level");

            downs.push(DownLevel {
                stage1: self.stage(dim_in, dim_out, k != 0).init(device)?,
                stage2: self.stage(dim_out, dim_out, true).init(device)?,
                attn: self.attention(dim_out, false, device)?,
                down: (!is_last).then(|| Down2x::new(dim_out, device)),
            });
        }

        let mid_dim = dims[levels];
        tracing::debug!(mid_dim, "unet middle block");
        let mid = MidBlock {
            stage1: self.stage(mid_dim, mid_dim, true).init(device)?,
            attn: self.attention(mid_dim, true, device)?,
            stage2: self.stage(mid_dim, mid_dim, true).init(device)?,
        };

        let mut ups = Vec::with_capacity(levels);
        for k in (0..levels).rev() {
            let skip_dim = dims[k + 1];
            let dim_out = if k == 0 { self.dim } else { dims[k] };
            tracing::debug!(level = k, dim_in = skip_dim * 2, dim_out, upsample = k != 0, "unet up level");

            ups.push(UpLevel {
                stage1: self.stage(skip_dim * 2, dim_out, true).init(device)?,
                stage2: self.stage(dim_out, dim_out, true).init(device)?,
                attn: self.attention(dim_out, false, device)?,
                up: (k != 0).then(|| Up2x::new(dim_out, device)),
            });
        }

        let final_stage = StageConfig::new(self.dim, self.dim)
            .with_expand(self.expand)
            .with_eps(self.eps)
            .init(device)?;
        let final_conv =
            Conv2dConfig::new([self.dim, self.resolved_out_dim()], [1, 1]).init(device);

        Ok(Unet {
            conditioning,
            downs,
            mid,
            ups,
            final_stage,
            final_conv,
            channels: self.channels,
            out_dim: self.resolved_out_dim(),
        })
    }
}

/// Down-path resolution level
#[derive(Module, Debug)]
pub struct DownLevel<B: Backend> {
    pub stage1: ConvNeXtStage<B>,
    pub stage2: ConvNeXtStage<B>,
    pub attn: Residual<B>,
    pub down: Option<Down2x<B>>,
}

/// Lowest-resolution block with quadratic attention
#[derive(Module, Debug)]
pub struct MidBlock<B: Backend> {
    pub stage1: ConvNeXtStage<B>,
    pub attn: Residual<B>,
    pub stage2: ConvNeXtStage<B>,
}

/// Up-path resolution level
#[derive(Module, Debug)]
pub struct UpLevel<B: Backend> {
    pub stage1: ConvNeXtStage<B>,
    pub stage2: ConvNeXtStage<B>,
    pub attn: Residual<B>,
    pub up: Option<Up2x<B>>,
}

/// Multi-resolution denoising backbone
#[derive(Module, Debug)]
pub struct Unet<B: Backend> {
    pub conditioning: Conditioning<B>,
    pub downs: Vec<DownLevel<B>>,
    pub mid: MidBlock<B>,
    pub ups: Vec<UpLevel<B>>,
    /// Unconditioned stage applied at full resolution
    pub final_stage: ConvNeXtStage<B>,
    pub final_conv: Conv2d<B>,
    pub channels: usize,
    pub out_dim: usize,
}

impl<B: Backend> Unet<B> {
    pub fn levels(&self) -> usize {
        self.downs.len()
    }

    pub fn is_frame_conditioned(&self) -> bool {
        self.conditioning.is_frame_conditioned()
    }

    /// Rejects inputs that a `Down2x` would shrink below one pixel
    pub fn check_input_size(&self, height: usize, width: usize) -> Result<(), BackboneError> {
        let too_small = BackboneError::InputTooSmall {
            height,
            width,
            levels: self.levels(),
        };
        let (mut h, mut w) = (height, width);
        for _ in self.downs.iter().filter(|level| level.down.is_some()) {
            h = Down2x::<B>::output_size(h).ok_or_else(|| too_small.clone())?;
            w = Down2x::<B>::output_size(w).ok_or_else(|| too_small.clone())?;
        }
        if h == 0 || w == 0 {
            return Err(too_small);
        }
        Ok(())
    }

    /// Forward pass
    ///
    /// Accepts any spatial size of at least `2^(levels - 1)`; odd sizes are reconciled by resizing before
    /// every skip concatenation and once more before the output stage.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        t: Tensor<B, 1>,
        frame_diff: Option<Tensor<B, 1>>,
    ) -> Result<Tensor<B, 4>, BackboneError> {
        self.forward_traced(x, t, frame_diff).map(|(out, _)| out)
    }

    /// Forward pass that also reports the skip-stack accounting
    pub fn forward_traced(
        &self,
        x: Tensor<B, 4>,
        t: Tensor<B, 1>,
        frame_diff: Option<Tensor<B, 1>>,
    ) -> Result<(Tensor<B, 4>, SkipTrace), BackboneError> {
        let [batch, _, height, width] = x.dims();
        self.check_input_size(height, width)?;
        let emb = self.conditioning.forward(t, frame_diff, batch)?;
        let mut skips = SkipStack::with_capacity(self.downs.len());

        let mut h = x;
        for level in &self.downs {
            h = level.stage1.forward(h, Some(&emb))?;
            h = level.stage2.forward(h, Some(&emb))?;
            h = level.attn.forward(h)?;
            skips.push(h.clone());
            if let Some(down) = &level.down {
                h = down.forward(h);
            }
        }

        h = self.mid.stage1.forward(h, Some(&emb))?;
        h = self.mid.attn.forward(h)?;
        h = self.mid.stage2.forward(h, Some(&emb))?;

        for level in &self.ups {
            let skip: Tensor<B, 4> = skips.pop()?;
            let [_, _, skip_h, skip_w] = skip.dims();
            h = Tensor::cat(vec![resize_to(h, [skip_h, skip_w]), skip], 1);

            h = level.stage1.forward(h, Some(&emb))?;
            h = level.stage2.forward(h, Some(&emb))?;
            h = level.attn.forward(h)?;
            if let Some(up) = &level.up {
                h = up.forward(h);
            }
        }

        let trace = skips.finish()?;

        let h = resize_to(h, [height, width]);
        let h = self.final_stage.forward(h, None)?;
        Ok((self.final_conv.forward(h), trace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small() -> UnetConfig {
        UnetConfig::new(8)
            .with_dim_mults(vec![1, 2])
            .with_heads(2)
            .with_dim_head(4)
    }

    #[test]
    fn test_level_dims() {
        let config = UnetConfig::new(64);
        assert_eq!(config.level_dims().unwrap(), vec![3, 64, 128, 256, 512]);
        assert_eq!(config.resolved_out_dim(), 3);
    }

    #[test]
    fn test_structure() {
        let device = Default::default();
        let unet = small().init::<TestBackend>(&device).unwrap();

        assert_eq!(unet.levels(), 2);
        assert!(unet.downs[0].down.is_some());
        assert!(unet.downs[1].down.is_none());
        assert!(!unet.downs[0].stage1.has_norm());
        assert!(unet.ups[0].up.is_some());
        assert!(unet.ups[1].up.is_none());
        assert!(unet.mid.attn.inner.inner.is_full());
        assert!(!unet.downs[0].attn.inner.inner.is_full());
        assert!(!unet.final_stage.is_conditioned());

        // Up stage widths: 2 * 16 -> 8, then 2 * 8 -> dim
        assert_eq!(unet.ups[0].stage1.in_dim, 32);
        assert_eq!(unet.ups[0].stage1.out_dim, 8);
        assert_eq!(unet.ups[1].stage1.in_dim, 16);
        assert_eq!(unet.ups[1].stage1.out_dim, 8);
    }

    #[test]
    fn test_forward_balanced_skips() {
        let device = Default::default();
        let unet = small().init::<TestBackend>(&device).unwrap();

        let x = Tensor::zeros([1, 3, 8, 8], &device);
        let t = Tensor::from_floats([10.0], &device);
        let (out, trace) = unet.forward_traced(x, t, None).unwrap();

        assert_eq!(out.dims(), [1, 3, 8, 8]);
        assert_eq!(
            trace,
            SkipTrace {
                pushes: 2,
                pops: 2,
                released: 0
            }
        );
    }

    #[test]
    fn test_custom_out_dim() {
        let device = Default::default();
        let unet = small()
            .with_out_dim(1)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::zeros([2, 3, 6, 6], &device);
        let t = Tensor::from_floats([0.0, 1.0], &device);
        assert_eq!(unet.forward(x, t, None).unwrap().dims(), [2, 1, 6, 6]);
    }

    #[test]
    fn test_rejects_input_smaller_than_levels() {
        let device = Default::default();
        let unet = small()
            .with_dim_mults(vec![1, 2, 4])
            .init::<TestBackend>(&device)
            .unwrap();

        // 2x2 -> 1x1 after the first Down2x, too small for the second
        let x = Tensor::zeros([1, 3, 2, 2], &device);
        let t = Tensor::from_floats([1.0], &device);
        assert_eq!(
            unet.forward(x, t, None).unwrap_err(),
            BackboneError::InputTooSmall {
                height: 2,
                width: 2,
                levels: 3
            }
        );

        // One short side is enough to fail
        let x = Tensor::zeros([1, 3, 8, 3], &device);
        let t = Tensor::from_floats([1.0], &device);
        assert!(matches!(
            unet.forward(x, t, None).unwrap_err(),
            BackboneError::InputTooSmall { .. }
        ));

        // 4x4 -> 2x2 -> 1x1 is the smallest accepted size
        let x = Tensor::zeros([1, 3, 4, 4], &device);
        let t = Tensor::from_floats([1.0], &device);
        assert_eq!(unet.forward(x, t, None).unwrap().dims(), [1, 3, 4, 4]);
    }

    #[test]
    fn test_rejects_empty_mults() {
        let device = Default::default();
        let err = small()
            .with_dim_mults(vec![])
            .init::<TestBackend>(&device)
            .unwrap_err();
        assert_eq!(
            err,
            BackboneError::ZeroDimension {
                what: "unet resolution levels"
            }
        );
    }
}
