//! Errors raised by the core layers

use thiserror::Error;

/// Configuration and contract errors for the core layers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayerError {
    #[error("Positional embedding dimension must be even and at least 2, got {0}")]
    InvalidEmbeddingDim(usize),

    #[error("Invalid attention geometry: {channels} channels, {heads} heads, hidden width {hidden}")]
    InvalidAttention {
        channels: usize,
        heads: usize,
        hidden: usize,
    },

    #[error("{what} must be non-zero")]
    ZeroDimension { what: &'static str },

    #[error("Residual shape mismatch: input {input:?}, transform output {output:?}")]
    ShapeMismatch {
        input: Vec<usize>,
        output: Vec<usize>,
    },

    #[error("Skip stack underflow after {pushes} pushes and {pops} pops")]
    SkipUnderflow { pushes: usize, pops: usize },

    #[error("Unbalanced skip stack: {pushes} pushes, {pops} pops, {remaining} left (expected {expected_unpaired} unpaired)")]
    UnbalancedSkips {
        pushes: usize,
        pops: usize,
        remaining: usize,
        expected_unpaired: usize,
    },
}
