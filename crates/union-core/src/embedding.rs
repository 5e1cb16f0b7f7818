//! Sinusoidal positional embedding
//!
//! Encodes one scalar per batch element (a diffusion timestep or a frame
//! difference) into a fixed-size vector of sines and cosines. The encoding
//! has no learnable state.

use burn::prelude::*;

use crate::error::LayerError;

const MAX_PERIOD: f64 = 10000.0;

/// Precompute the frequency bands for an embedding of width `dim`
///
/// Band `i` of `dim / 2` has frequency `exp(-i * ln(10000) / (dim/2 - 1))`.
/// With a single band (`dim == 2`) the frequency is 1.
pub fn sinusoidal_freqs<B: Backend>(
    dim: usize,
    device: &B::Device,
) -> Result<Tensor<B, 1>, LayerError> {
    if dim < 2 || dim % 2 != 0 {
        return Err(LayerError::InvalidEmbeddingDim(dim));
    }

    let half_dim = dim / 2;
    let step = if half_dim > 1 {
        MAX_PERIOD.ln() / (half_dim - 1) as f64
    } else {
        0.0
    };

    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| (-(i as f64) * step).exp() as f32)
        .collect();

    Ok(Tensor::<B, 1>::from_data(
        TensorData::new(freqs, [half_dim]),
        device,
    ))
}

/// Embedding using precomputed frequencies
///
/// Returns `[batch, 2 * bands]`: all sines first, then all cosines.
pub fn sinusoidal_embedding_with_freqs<B: Backend>(
    values: Tensor<B, 1>,
    freqs: Tensor<B, 1>,
) -> Tensor<B, 2> {
    let [batch] = values.dims();
    let [half_dim] = freqs.dims();
    let args = values.reshape([batch, 1]) * freqs.reshape([1, half_dim]);

    Tensor::cat(vec![args.clone().sin(), args.cos()], 1)
}

/// Sinusoidal embedding of `values` into `dim` features
///
/// # Arguments
///
/// * `values` - One scalar per sample, shape `[batch]`
/// * `dim` - Output width; must be even and at least 2
///
/// # Returns
///
/// Tensor of shape `[batch, dim]`
pub fn sinusoidal_embedding<B: Backend>(
    values: Tensor<B, 1>,
    dim: usize,
) -> Result<Tensor<B, 2>, LayerError> {
    let freqs = sinusoidal_freqs(dim, &values.device())?;
    Ok(sinusoidal_embedding_with_freqs(values, freqs))
}
