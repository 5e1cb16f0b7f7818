//! ConvChain: a single-resolution stack of conditional stages
//!
//! The first `ceil(depth / 2)` stages form the down path and save their
//! outputs as skips; the remaining stages pop the most recent skip,
//! concatenate it after the running tensor and process the doubled width.
//! No stage changes the spatial size.
//!
//! ```text
//! x -> S0 -> S1 -> ... -> S(h-1) -> [cat skip] S(h) -> ... -> S(d-1) -> 1x1 conv
//!       |     |             |_______________|
//!       |     |_________________________________ ...
//! ```

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use union_core::skip::{SkipStack, SkipTrace};

use crate::encoder::Conditioning;
use crate::error::BackboneError;
use crate::stage::{ConvNeXtStage, StageConfig};

/// Per-stage channel widths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelSpec {
    /// The same width for every stage
    Uniform(usize),
    /// One width per stage; the length must equal the depth
    PerStage(Vec<usize>),
}

impl ChannelSpec {
    /// Expands to exactly `depth` widths
    pub fn widths(&self, depth: usize) -> Result<Vec<usize>, BackboneError> {
        let widths = match self {
            ChannelSpec::Uniform(width) => vec![*width; depth],
            ChannelSpec::PerStage(widths) => {
                if widths.len() != depth {
                    return Err(BackboneError::DepthMismatch {
                        depth,
                        actual: widths.len(),
                    });
                }
                widths.clone()
            }
        };
        if widths.iter().any(|w| *w == 0) {
            return Err(BackboneError::ZeroDimension {
                what: "stage width",
            });
        }
        Ok(widths)
    }
}

/// Configuration for [`ConvChain`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvChainConfig {
    /// Channels of the input tensor
    pub in_channels: usize,
    /// Channels of the predicted tensor
    pub out_channels: usize,
    /// Total number of stages
    pub depth: usize,
    /// Stage widths
    pub filters: ChannelSpec,
    /// Adds a frame-difference embedding next to the time embedding
    pub frame_conditioned: bool,
    /// Channel expansion inside each stage
    pub expand: usize,
    /// Normalization epsilon
    pub eps: f64,
}

impl Default for ConvChainConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            out_channels: 3,
            depth: 16,
            filters: ChannelSpec::Uniform(64),
            frame_conditioned: false,
            expand: 3,
            eps: 1e-5,
        }
    }
}

impl ConvChainConfig {
    pub fn new(in_channels: usize, out_channels: usize, depth: usize, filters: ChannelSpec) -> Self {
        Self {
            in_channels,
            out_channels,
            depth,
            filters,
            ..Self::default()
        }
    }

    pub fn with_frame_conditioned(mut self, frame_conditioned: bool) -> Self {
        self.frame_conditioned = frame_conditioned;
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

    /// Number of down-path stages, `ceil(depth / 2)`
    pub fn half_depth(&self) -> usize {
        self.depth.div_ceil(2)
    }

    /// Width of the conditioning vector every stage receives
    pub fn emb_dim(&self) -> Result<usize, BackboneError> {
        let time_dim = self.filters.widths(self.depth)?[0];
        Ok(if self.frame_conditioned {
            time_dim * 2
        } else {
            time_dim
        })
    }

    /// Plans the per-stage configs and checks the skip pairing
    pub fn stage_configs(&self) -> Result<Vec<StageConfig>, BackboneError> {
        if self.depth == 0 {
            return Err(BackboneError::ZeroDimension { what: "depth" });
        }
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(BackboneError::ZeroDimension {
                what: "backbone in/out channels",
            });
        }

        let widths = self.filters.widths(self.depth)?;
        let emb_dim = self.emb_dim()?;
        let half = self.half_depth();

        let mut configs = Vec::with_capacity(self.depth);
        for (i, &width) in widths.iter().enumerate() {
            let (in_dim, norm) = if i == 0 {
                // First stage sees raw input statistics
                (self.in_channels, false)
            } else if i < half {
                (widths[i - 1], true)
            } else {
                let skip_width = widths[2 * half - 1 - i];
                if skip_width != widths[i - 1] {
                    return Err(BackboneError::SkipWidthMismatch {
                        stage: i,
                        expected: widths[i - 1],
                        actual: skip_width,
                    });
                }
                (widths[i - 1] * 2, true)
            };

            configs.push(
                StageConfig::new(in_dim, width)
                    .with_emb_dim(Some(emb_dim))
                    .with_norm(norm)
                    .with_expand(self.expand)
                    .with_eps(self.eps),
            );
        }
        Ok(configs)
    }

    /// Builds the chain
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ConvChain<B>, BackboneError> {
        let configs = self.stage_configs()?;
        let widths = self.filters.widths(self.depth)?;
        let conditioning = Conditioning::new(widths[0], self.frame_conditioned, device)?;

        let stages = configs
            .iter()
            .enumerate()
            .map(|(i, config)| {
                tracing::debug!(
                    stage = i,
                    path = if i < self.half_depth() { "down" } else { "up" },
                    in_dim = config.in_dim,
                    out_dim = config.out_dim,
                    norm = config.norm,
                    emb_dim = ?config.emb_dim,
                    "conv chain stage"
                );
                config.init(device)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let last = widths[widths.len() - 1];
        let final_conv = Conv2dConfig::new([last, self.out_channels], [1, 1]).init(device);

        Ok(ConvChain {
            stages,
            final_conv,
            conditioning,
            half_depth: self.half_depth(),
            in_channels: self.in_channels,
            out_channels: self.out_channels,
        })
    }
}

/// Single-resolution skip-connected stack of conditional stages
#[derive(Module, Debug)]
pub struct ConvChain<B: Backend> {
    /// Down stages followed by up stages
    pub stages: Vec<ConvNeXtStage<B>>,
    /// 1x1 projection to the output channels
    pub final_conv: Conv2d<B>,
    /// Time (and frame-difference) encoders
    pub conditioning: Conditioning<B>,
    pub half_depth: usize,
    pub in_channels: usize,
    pub out_channels: usize,
}

impl<B: Backend> ConvChain<B> {
    pub fn depth(&self) -> usize {
        self.stages.len()
    }

    pub fn is_frame_conditioned(&self) -> bool {
        self.conditioning.is_frame_conditioned()
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Noisy input `[batch, in_channels, height, width]`
    /// * `t` - Timestep per sample `[batch]`
    /// * `frame_diff` - Frame difference per sample `[batch]`; required iff
    ///   the chain is frame-conditioned
    ///
    /// # Returns
    ///
    /// Prediction of shape `[batch, out_channels, height, width]`
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
        let [batch, _, _, _] = x.dims();
        let emb = self.conditioning.forward(t, frame_diff, batch)?;

        let (down, up) = self.stages.split_at(self.half_depth);
        let mut skips = SkipStack::with_capacity(down.len());

        let mut h = x;
        for stage in down {
            h = stage.forward(h, Some(&emb))?;
            skips.push(h.clone());
        }

        for stage in up {
            let skip = skips.pop()?;
            h = stage.forward(Tensor::cat(vec![h, skip], 1), Some(&emb))?;
        }

        // Odd depth leaves the earliest skip without a partner
        let trace = skips.finish_with_unpaired(down.len() - up.len())?;

        Ok((self.final_conv.forward(h), trace))
    }
}
