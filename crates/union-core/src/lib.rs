//! Core Building Blocks for the Union Diffusion Backbones
//!
//! This crate provides the leaf components shared by the ConvChain and Unet
//! denoising backbones in `union-backbone`.
//!
//! # Modules
//!
//! ## Conditioning
//!
//! - [`embedding`] - Sinusoidal positional embedding of scalar timesteps
//!
//! ## Normalization
//!
//! - [`norm`] - Channel-wise spatial layer normalization and the pre-norm wrapper
//!
//! ## Attention Mechanisms
//!
//! - [`attention`] - Linear (key-softmax) and full (quadratic) spatial attention
//! - [`residual`] - Additive skip around any transform
//!
//! ## Backbone Plumbing
//!
//! - [`skip`] - LIFO skip-connection stack with push/pop accounting
//!
//! ## Training Utilities
//!
//! - [`ema`] - Exponential moving average of module parameters
//! - [`params`] - Parameter inspection (counts and shapes)
//!
//! # Example
//!
//! ```ignore
//! use union_core::embedding::sinusoidal_embedding;
//! use union_core::norm::SpatialLayerNorm;
//!
//! let emb = sinusoidal_embedding(timesteps, 64)?;
//! let norm = SpatialLayerNorm::new(64, &device);
//! let y = norm.forward(x);
//! ```

pub mod attention;
pub mod ema;
pub mod embedding;
pub mod error;
pub mod norm;
pub mod params;
pub mod residual;
pub mod skip;

pub use attention::{
    AttentionConfig, AttentionKind, FullAttention, LinearAttention, SpatialAttention,
};
pub use ema::{EmaError, EmaTracker, ExpMovingAvg};
pub use embedding::{sinusoidal_embedding, sinusoidal_freqs};
pub use error::LayerError;
pub use norm::{PreNorm, SpatialLayerNorm, SpatialNormConfig};
pub use params::{summarize_params, ParamSummary};
pub use residual::{residual_add, Residual};
pub use skip::{SkipStack, SkipTrace};
