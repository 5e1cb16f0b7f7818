//! Union Diffusion Backbones
//!
//! Denoising networks for single-image and video-frame diffusion, built from
//! ConvNeXt-style conditional stages.
//!
//! # Backbones
//!
//! - [`ConvChain`] - Single-resolution skip-connected stage stack
//! - [`Unet`] - Multi-resolution Unet with linear attention per level and
//!   full attention in the middle block
//! - [`Backbone`] - Either topology, built from a tagged [`BackboneConfig`]
//!
//! # Building Blocks
//!
//! - [`ConvNeXtStage`] - Conditional residual stage
//! - [`Conditioning`] - Time and frame-difference embedding encoders
//! - [`Down2x`], [`Up2x`] - Resolution scaling
//!
//! # Example
//!
//! ```ignore
//! use union_backbone::{BackboneConfig, TaskPreset};
//!
//! let config = TaskPreset::VideoPredictor.config(64, 16);
//! let model = config.init::<Backend>(&device)?;
//!
//! // x: [b, 6, h, w], t and frame_diff: [b]
//! let pred = model.forward(x, t, Some(frame_diff))?;
//! ```

pub mod chain;
pub mod config;
pub mod encoder;
pub mod error;
pub mod resample;
pub mod stage;
pub mod unet;

pub use chain::{ChannelSpec, ConvChain, ConvChainConfig};
pub use config::{Backbone, BackboneConfig, TaskPreset};
pub use encoder::{Conditioning, EmbeddingEncoder, EmbeddingEncoderConfig};
pub use error::BackboneError;
pub use resample::{resize_to, Down2x, Up2x};
pub use stage::{ConvNeXtStage, EmbedProjection, StageConfig};
pub use unet::{DownLevel, MidBlock, Unet, UnetConfig, UpLevel};
