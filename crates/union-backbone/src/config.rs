//! Backbone selection and task presets

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use union_core::skip::SkipTrace;

use crate::chain::{ChannelSpec, ConvChain, ConvChainConfig};
use crate::error::BackboneError;
use crate::unet::{Unet, UnetConfig};

/// Either backbone topology, tagged by `kind` in JSON
///
/// ```json
/// {"kind": "chain", "in_channels": 6, "depth": 8, "filters": 32, "frame_conditioned": true}
/// {"kind": "unet", "dim": 64, "dim_mults": [1, 2, 4, 8]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackboneConfig {
    Chain(ConvChainConfig),
    Unet(UnetConfig),
}

impl BackboneConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Backbone<B>, BackboneError> {
        match self {
            BackboneConfig::Chain(config) => config.init(device).map(Backbone::Chain),
            BackboneConfig::Unet(config) => config.init(device).map(Backbone::Unet),
        }
    }

    pub fn in_channels(&self) -> usize {
        match self {
            BackboneConfig::Chain(config) => config.in_channels,
            BackboneConfig::Unet(config) => config.channels,
        }
    }

    pub fn out_channels(&self) -> usize {
        match self {
            BackboneConfig::Chain(config) => config.out_channels,
            BackboneConfig::Unet(config) => config.resolved_out_dim(),
        }
    }

    pub fn frame_conditioned(&self) -> bool {
        match self {
            BackboneConfig::Chain(config) => config.frame_conditioned,
            BackboneConfig::Unet(config) => config.frame_conditioned,
        }
    }
}

/// A built backbone of either topology
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    Chain(ConvChain<B>),
    Unet(Unet<B>),
}

impl<B: Backend> Backbone<B> {
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        t: Tensor<B, 1>,
        frame_diff: Option<Tensor<B, 1>>,
    ) -> Result<Tensor<B, 4>, BackboneError> {
        match self {
            Backbone::Chain(chain) => chain.forward(x, t, frame_diff),
            Backbone::Unet(unet) => unet.forward(x, t, frame_diff),
        }
    }

    pub fn forward_traced(
        &self,
        x: Tensor<B, 4>,
        t: Tensor<B, 1>,
        frame_diff: Option<Tensor<B, 1>>,
    ) -> Result<(Tensor<B, 4>, SkipTrace), BackboneError> {
        match self {
            Backbone::Chain(chain) => chain.forward_traced(x, t, frame_diff),
            Backbone::Unet(unet) => unet.forward_traced(x, t, frame_diff),
        }
    }

    /// Width of the conditioning vector fed to every stage
    pub fn emb_dim(&self) -> usize {
        match self {
            Backbone::Chain(chain) => chain.conditioning.emb_dim(),
            Backbone::Unet(unet) => unet.conditioning.emb_dim(),
        }
    }

    pub fn is_frame_conditioned(&self) -> bool {
        match self {
            Backbone::Chain(chain) => chain.is_frame_conditioned(),
            Backbone::Unet(unet) => unet.is_frame_conditioned(),
        }
    }
}

/// Named configurations for the supported tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPreset {
    /// Single-image generation
    Image,
    /// Next frame from the previous frame, conditioned on the frame gap
    VideoPredictor,
    /// Frame projection onto the video's frame manifold
    VideoProjector,
    /// Middle frame from two neighbours
    VideoInterpolator,
    /// Multi-resolution Unet
    Unet,
}

impl TaskPreset {
    pub const ALL: [TaskPreset; 5] = [
        TaskPreset::Image,
        TaskPreset::VideoPredictor,
        TaskPreset::VideoProjector,
        TaskPreset::VideoInterpolator,
        TaskPreset::Unet,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TaskPreset::Image => "image",
            TaskPreset::VideoPredictor => "video-predictor",
            TaskPreset::VideoProjector => "video-projector",
            TaskPreset::VideoInterpolator => "video-interpolator",
            TaskPreset::Unet => "unet",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TaskPreset::Image => "ConvChain, 3 -> 3 channels",
            TaskPreset::VideoPredictor => {
                "ConvChain, previous + noisy frame (6) -> 3 channels, frame-conditioned"
            }
            TaskPreset::VideoProjector => "ConvChain, 3 -> 3 channels",
            TaskPreset::VideoInterpolator => "ConvChain, two neighbours + noisy frame (9) -> 3 channels",
            TaskPreset::Unet => "Unet, dim = filters, mults (1, 2, 4, 8)",
        }
    }

    /// Builds the preset's config
    ///
    /// `filters` is the chain stage width (or Unet base dim); `depth` is the
    /// chain stage count and is ignored by the Unet.
    pub fn config(&self, filters: usize, depth: usize) -> BackboneConfig {
        let chain = |in_channels| ConvChainConfig::new(in_channels, 3, depth, ChannelSpec::Uniform(filters));
        match self {
            TaskPreset::Image | TaskPreset::VideoProjector => BackboneConfig::Chain(chain(3)),
            TaskPreset::VideoPredictor => {
                BackboneConfig::Chain(chain(6).with_frame_conditioned(true))
            }
            TaskPreset::VideoInterpolator => BackboneConfig::Chain(chain(9)),
            TaskPreset::Unet => BackboneConfig::Unet(UnetConfig::new(filters)),
        }
    }
}

impl fmt::Display for TaskPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TaskPreset {
    type Err = BackboneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskPreset::ALL
            .into_iter()
            .find(|preset| preset.name() == s)
            .ok_or_else(|| BackboneError::UnknownPreset(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_names_round_trip() {
        for preset in TaskPreset::ALL {
            assert_eq!(preset.name().parse::<TaskPreset>().unwrap(), preset);
        }
        assert_eq!(
            "video".parse::<TaskPreset>().unwrap_err(),
            BackboneError::UnknownPreset("video".to_string())
        );
    }

    #[test]
    fn test_preset_channels() {
        let cases = [
            (TaskPreset::Image, 3, false),
            (TaskPreset::VideoPredictor, 6, true),
            (TaskPreset::VideoProjector, 3, false),
            (TaskPreset::VideoInterpolator, 9, false),
            (TaskPreset::Unet, 3, false),
        ];
        for (preset, in_channels, framed) in cases {
            let config = preset.config(64, 16);
            assert_eq!(config.in_channels(), in_channels, "{preset}");
            assert_eq!(config.out_channels(), 3, "{preset}");
            assert_eq!(config.frame_conditioned(), framed, "{preset}");
        }
    }

    #[test]
    fn test_tagged_json() {
        let config: BackboneConfig = serde_json::from_str(
            r#"{"kind": "chain", "in_channels": 6, "depth": 4, "filters": [8, 16, 8, 8], "frame_conditioned": true}"#,
        )
        .unwrap();
        let BackboneConfig::Chain(chain) = &config else {
            panic!("expected a chain config");
        };
        assert_eq!(chain.filters, ChannelSpec::PerStage(vec![8, 16, 8, 8]));
        assert_eq!(chain.out_channels, 3);
        assert_eq!(chain.expand, 3);

        let unet: BackboneConfig = serde_json::from_str(r#"{"kind": "unet", "dim": 32}"#).unwrap();
        assert_eq!(unet, BackboneConfig::Unet(UnetConfig::new(32)));
    }

    #[test]
    fn test_preset_json_round_trip() {
        let config = TaskPreset::VideoPredictor.config(32, 8);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""kind":"chain""#));
        let back: BackboneConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
