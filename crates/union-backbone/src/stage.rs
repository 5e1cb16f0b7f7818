//! ConvNeXt-style conditional residual stage
//!
//! The atomic unit of both backbones:
//!
//! ```text
//! h = depthwise7x7(x)
//! h = h + Linear(GELU(emb))[:, :, None, None]     (conditioned stages only)
//! h = conv3x3(GELU(conv3x3(norm(h))))             (in -> out * expand -> out)
//! y = h + shortcut(x)                             (1x1 conv when in != out)
//! ```

use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    Linear, LinearConfig, PaddingConfig2d,
};
use burn::prelude::*;
use burn::tensor::activation::gelu;

use union_core::norm::{SpatialLayerNorm, SpatialNormConfig};

use crate::error::BackboneError;

/// Configuration for [`ConvNeXtStage`]
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Input channels
    pub in_dim: usize,
    /// Output channels
    pub out_dim: usize,
    /// Conditioning vector width; `None` builds an unconditioned stage
    pub emb_dim: Option<usize>,
    /// Channel expansion factor of the inner block
    pub expand: usize,
    /// Whether the inner block starts with a normalization
    pub norm: bool,
    /// Normalization epsilon
    pub eps: f64,
}

impl StageConfig {
    pub fn new(in_dim: usize, out_dim: usize) -> Self {
        Self {
            in_dim,
            out_dim,
            emb_dim: None,
            expand: 3,
            norm: true,
            eps: 1e-5,
        }
    }

    pub fn with_emb_dim(mut self, emb_dim: Option<usize>) -> Self {
        self.emb_dim = emb_dim;
        self
    }

    pub fn with_expand(mut self, expand: usize) -> Self {
        self.expand = expand;
        self
    }

    pub fn with_norm(mut self, norm: bool) -> Self {
        self.norm = norm;
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Builds the stage, rejecting zero-sized widths
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ConvNeXtStage<B>, BackboneError> {
        for (what, value) in [
            ("stage in_dim", self.in_dim),
            ("stage out_dim", self.out_dim),
            ("stage expand", self.expand),
            ("stage emb_dim", self.emb_dim.unwrap_or(1)),
        ] {
            if value == 0 {
                return Err(BackboneError::ZeroDimension { what });
            }
        }

        let hidden = self.out_dim * self.expand;

        let depthwise = Conv2dConfig::new([self.in_dim, self.in_dim], [7, 7])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_groups(self.in_dim)
            .init(device);

        let embed_proj = self
            .emb_dim
            .map(|emb_dim| EmbedProjection::new(emb_dim, self.in_dim, device));

        let norm = self
            .norm
            .then(|| SpatialNormConfig::new(self.in_dim).with_eps(self.eps).init(device));

        let expand_conv = Conv2dConfig::new([self.in_dim, hidden], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let project_conv = Conv2dConfig::new([hidden, self.out_dim], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        let residual_proj = if self.in_dim != self.out_dim {
            Some(Conv2dConfig::new([self.in_dim, self.out_dim], [1, 1]).init(device))
        } else {
            None
        };

        Ok(ConvNeXtStage {
            depthwise,
            embed_proj,
            norm,
            expand_conv,
            project_conv,
            residual_proj,
            in_dim: self.in_dim,
            out_dim: self.out_dim,
        })
    }
}

/// GELU followed by a linear map from the conditioning width to `in_dim`
#[derive(Module, Debug)]
pub struct EmbedProjection<B: Backend> {
    pub linear: Linear<B>,
}

impl<B: Backend> EmbedProjection<B> {
    pub fn new(emb_dim: usize, channels: usize, device: &B::Device) -> Self {
        Self {
            linear: LinearConfig::new(emb_dim, channels).init(device),
        }
    }

    /// Conditioning width this projection accepts
    pub fn emb_dim(&self) -> usize {
        self.linear.weight.dims()[0]
    }

    /// Maps `[batch, emb_dim]` to `[batch, channels]`
    pub fn forward(&self, emb: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear.forward(gelu(emb))
    }
}

/// Conditional residual stage
#[derive(Module, Debug)]
pub struct ConvNeXtStage<B: Backend> {
    /// Per-channel 7x7 spatial mixer
    pub depthwise: Conv2d<B>,
    /// Conditioning projection, present on conditioned stages
    pub embed_proj: Option<EmbedProjection<B>>,
    /// Optional normalization ahead of the channel expansion
    pub norm: Option<SpatialLayerNorm<B>>,
    /// 3x3 convolution to `out_dim * expand`
    pub expand_conv: Conv2d<B>,
    /// 3x3 convolution back down to `out_dim`
    pub project_conv: Conv2d<B>,
    /// Shortcut projection when `in_dim != out_dim`
    pub residual_proj: Option<Conv2d<B>>,
    pub in_dim: usize,
    pub out_dim: usize,
}

impl<B: Backend> ConvNeXtStage<B> {
    /// Whether this stage requires a conditioning vector
    pub fn is_conditioned(&self) -> bool {
        self.embed_proj.is_some()
    }

    /// Conditioning width, if the stage is conditioned
    pub fn emb_dim(&self) -> Option<usize> {
        self.embed_proj.as_ref().map(EmbedProjection::emb_dim)
    }

    pub fn has_norm(&self) -> bool {
        self.norm.is_some()
    }

    /// Identity or 1x1 projection of the input to `out_dim` channels
    pub fn shortcut(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match &self.residual_proj {
            Some(conv) => conv.forward(x),
            None => x,
        }
    }

    /// Forward pass through the stage
    ///
    /// # Arguments
    ///
    /// * `x` - Input of shape `[batch, in_dim, height, width]`
    /// * `emb` - Conditioning vector `[batch, emb_dim]`; required on
    ///   conditioned stages, ignored otherwise
    ///
    /// # Returns
    ///
    /// Output of shape `[batch, out_dim, height, width]`
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        emb: Option<&Tensor<B, 2>>,
    ) -> Result<Tensor<B, 4>, BackboneError> {
        let [batch, channels, _, _] = x.dims();
        if channels != self.in_dim {
            return Err(BackboneError::ChannelMismatch {
                expected: self.in_dim,
                actual: channels,
            });
        }

        let mut h = self.depthwise.forward(x.clone());

        if let Some(proj) = &self.embed_proj {
            let emb = emb.ok_or(BackboneError::MissingEmbedding)?;
            let [emb_batch, emb_width] = emb.dims();
            if emb_width != proj.emb_dim() {
                return Err(BackboneError::EmbeddingWidth {
                    expected: proj.emb_dim(),
                    actual: emb_width,
                });
            }
            if emb_batch != batch {
                return Err(BackboneError::BatchMismatch {
                    expected: batch,
                    actual: emb_batch,
                });
            }
            let cond = proj.forward(emb.clone());
            h = h + cond.reshape([batch, self.in_dim, 1, 1]);
        }

        if let Some(norm) = &self.norm {
            h = norm.forward(h);
        }
        let h = gelu(self.expand_conv.forward(h));
        let h = self.project_conv.forward(h);

        Ok(h + self.shortcut(x))
    }
}
