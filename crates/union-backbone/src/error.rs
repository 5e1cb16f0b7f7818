use thiserror::Error;
use union_core::LayerError;

/// Configuration errors and forward-pass contract violations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackboneError {
    #[error(transparent)]
    Layer(#[from] LayerError),

    #[error("{what} must be non-zero")]
    ZeroDimension { what: &'static str },

    #[error("Channel list has {actual} entries but depth is {depth}")]
    DepthMismatch { depth: usize, actual: usize },

    #[error("Up stage {stage} expects a {expected}-channel skip but the paired down stage produces {actual}")]
    SkipWidthMismatch {
        stage: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Stage expects {expected} input channels, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("Embedding-conditioned stage called without an embedding")]
    MissingEmbedding,

    #[error("Stage embedding projection expects width {expected}, got {actual}")]
    EmbeddingWidth { expected: usize, actual: usize },

    #[error("Frame-conditioned backbone called without a frame difference")]
    MissingFrameDiff,

    #[error("Frame difference given to a backbone built without frame conditioning")]
    UnexpectedFrameDiff,

    #[error("Conditioning has batch {actual}, input has batch {expected}")]
    BatchMismatch { expected: usize, actual: usize },

    #[error("Input of {height}x{width} is too small for {levels} resolution levels")]
    InputTooSmall {
        height: usize,
        width: usize,
        levels: usize,
    },

    #[error("Unknown preset '{0}'")]
    UnknownPreset(String),
}
