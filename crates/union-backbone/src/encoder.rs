//! Embedding encoders for the scalar conditioning inputs
//!
//! Each encoder maps one scalar per sample through a sinusoidal embedding and
//! a two-layer MLP. The time encoder is always present; a second encoder for
//! the frame difference exists only on frame-conditioned backbones, and its
//! output is concatenated (not summed) with the time embedding.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::gelu;

use union_core::embedding::{sinusoidal_embedding, sinusoidal_freqs};

use crate::error::BackboneError;

/// Configuration for [`EmbeddingEncoder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingEncoderConfig {
    /// Embedding width; even, at least 2
    pub dim: usize,
    /// Hidden width multiplier of the MLP
    pub hidden_mult: usize,
}

impl EmbeddingEncoderConfig {
    pub fn new(dim: usize) -> Self {
        Self { dim, hidden_mult: 4 }
    }

    pub fn with_hidden_mult(mut self, hidden_mult: usize) -> Self {
        self.hidden_mult = hidden_mult;
        self
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<EmbeddingEncoder<B>, BackboneError> {
        // Validate the width once so forward can't hit a bad dimension
        sinusoidal_freqs::<B>(self.dim, device)?;
        if self.hidden_mult == 0 {
            return Err(BackboneError::ZeroDimension {
                what: "encoder hidden_mult",
            });
        }

        let hidden = self.dim * self.hidden_mult;
        Ok(EmbeddingEncoder {
            linear1: LinearConfig::new(self.dim, hidden).init(device),
            linear2: LinearConfig::new(hidden, self.dim).init(device),
            dim: self.dim,
        })
    }
}

/// Sinusoidal embedding followed by `Linear(dim, 4 dim) -> GELU -> Linear(4 dim, dim)`
#[derive(Module, Debug)]
pub struct EmbeddingEncoder<B: Backend> {
    pub linear1: Linear<B>,
    pub linear2: Linear<B>,
    pub dim: usize,
}

impl<B: Backend> EmbeddingEncoder<B> {
    /// Creates an encoder of width `dim` (even, at least 2)
    pub fn new(dim: usize, device: &B::Device) -> Result<Self, BackboneError> {
        EmbeddingEncoderConfig::new(dim).init(device)
    }

    /// Maps `[batch]` scalars to `[batch, dim]`
    pub fn forward(&self, values: Tensor<B, 1>) -> Result<Tensor<B, 2>, BackboneError> {
        let emb = sinusoidal_embedding(values, self.dim)?;
        let emb = gelu(self.linear1.forward(emb));
        Ok(self.linear2.forward(emb))
    }
}

/// Time encoder plus the optional frame-difference encoder
#[derive(Module, Debug)]
pub struct Conditioning<B: Backend> {
    pub time: EmbeddingEncoder<B>,
    pub frame: Option<EmbeddingEncoder<B>>,
}

impl<B: Backend> Conditioning<B> {
    pub fn new(
        time_dim: usize,
        frame_conditioned: bool,
        device: &B::Device,
    ) -> Result<Self, BackboneError> {
        let time = EmbeddingEncoder::new(time_dim, device)?;
        let frame = if frame_conditioned {
            Some(EmbeddingEncoder::new(time_dim, device)?)
        } else {
            None
        };
        Ok(Self { time, frame })
    }

    /// Width of the combined conditioning vector
    ///
    /// Every conditioned stage must be built with this embedding width.
    pub fn emb_dim(&self) -> usize {
        match &self.frame {
            Some(frame) => self.time.dim + frame.dim,
            None => self.time.dim,
        }
    }

    pub fn is_frame_conditioned(&self) -> bool {
        self.frame.is_some()
    }

    /// Encodes the scalar inputs for a batch of `batch` samples
    ///
    /// # Returns
    ///
    /// `[batch, emb_dim]`: the time embedding, followed by the frame
    /// embedding when frame conditioning is enabled
    pub fn forward(
        &self,
        t: Tensor<B, 1>,
        frame_diff: Option<Tensor<B, 1>>,
        batch: usize,
    ) -> Result<Tensor<B, 2>, BackboneError> {
        check_batch(&t, batch)?;
        let time_emb = self.time.forward(t)?;

        match (&self.frame, frame_diff) {
            (None, None) => Ok(time_emb),
            (None, Some(_)) => Err(BackboneError::UnexpectedFrameDiff),
            (Some(_), None) => Err(BackboneError::MissingFrameDiff),
            (Some(encoder), Some(frame_diff)) => {
                check_batch(&frame_diff, batch)?;
                let frame_emb = encoder.forward(frame_diff)?;
                Ok(Tensor::cat(vec![time_emb, frame_emb], 1))
            }
        }
    }
}

fn check_batch<B: Backend>(values: &Tensor<B, 1>, batch: usize) -> Result<(), BackboneError> {
    let [actual] = values.dims();
    if actual != batch {
        return Err(BackboneError::BatchMismatch {
            expected: batch,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use union_core::LayerError;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_time_only() {
        let device = Default::default();
        let cond = Conditioning::<TestBackend>::new(16, false, &device).unwrap();
        assert_eq!(cond.emb_dim(), 16);

        let t = Tensor::from_floats([0.0, 1.0, 2.0], &device);
        let emb = cond.forward(t, None, 3).unwrap();
        assert_eq!(emb.dims(), [3, 16]);
    }

    #[test]
    fn test_frame_embedding_is_concatenated() {
        let device = Default::default();
        let cond = Conditioning::<TestBackend>::new(16, true, &device).unwrap();
        assert_eq!(cond.emb_dim(), 32);

        let t = Tensor::from_floats([5.0, 9.0], &device);
        let frame = Tensor::from_floats([1.0, 2.0], &device);
        let emb = cond.forward(t.clone(), Some(frame), 2).unwrap();
        assert_eq!(emb.dims(), [2, 32]);

        // Leading half is exactly the time encoder output
        let time_only = cond.time.forward(t).unwrap().into_data().to_vec::<f32>().unwrap();
        let leading = emb.narrow(1, 0, 16).into_data().to_vec::<f32>().unwrap();
        assert_eq!(leading, time_only);
    }

    #[test]
    fn test_frame_diff_contract() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::from_floats([1.0], &device);

        let plain = Conditioning::<TestBackend>::new(8, false, &device).unwrap();
        let err = plain
            .forward(t.clone(), Some(Tensor::from_floats([1.0], &device)), 1)
            .unwrap_err();
        assert_eq!(err, BackboneError::UnexpectedFrameDiff);

        let framed = Conditioning::<TestBackend>::new(8, true, &device).unwrap();
        assert_eq!(
            framed.forward(t, None, 1).unwrap_err(),
            BackboneError::MissingFrameDiff
        );
    }

    #[test]
    fn test_batch_mismatch() {
        let device = Default::default();
        let cond = Conditioning::<TestBackend>::new(8, false, &device).unwrap();
        let t = Tensor::from_floats([1.0, 2.0], &device);
        assert_eq!(
            cond.forward(t, None, 3).unwrap_err(),
            BackboneError::BatchMismatch {
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn test_hidden_width() {
        let device = Default::default();
        let encoder = EmbeddingEncoderConfig::new(8)
            .with_hidden_mult(2)
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(encoder.linear1.weight.dims(), [8, 16]);
        assert_eq!(encoder.linear2.weight.dims(), [16, 8]);
    }

    #[test]
    fn test_rejects_odd_width() {
        let device = Default::default();
        let err = EmbeddingEncoder::<TestBackend>::new(5, &device).unwrap_err();
        assert_eq!(err, BackboneError::Layer(LayerError::InvalidEmbeddingDim(5)));
    }
}
