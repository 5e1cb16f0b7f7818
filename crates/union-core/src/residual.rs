//! Additive skip around a transform

use burn::prelude::*;

use crate::error::LayerError;
use crate::norm::PreNorm;

/// Returns `x + f(x)`, rejecting a transform that changes the shape
///
/// Broadcasting is never used to reconcile the two operands.
pub fn residual_add<B, const D: usize, F>(x: Tensor<B, D>, f: F) -> Result<Tensor<B, D>, LayerError>
where
    B: Backend,
    F: FnOnce(Tensor<B, D>) -> Tensor<B, D>,
{
    let out = f(x.clone());
    let (input, output) = (x.dims(), out.dims());
    if input != output {
        return Err(LayerError::ShapeMismatch {
            input: input.to_vec(),
            output: output.to_vec(),
        });
    }
    Ok(x + out)
}

/// Pre-normalized attention with an additive skip
///
/// `forward(x) = x + attention(norm(x))`
#[derive(Module, Debug)]
pub struct Residual<B: Backend> {
    pub inner: PreNorm<B>,
}

impl<B: Backend> Residual<B> {
    pub fn new(inner: PreNorm<B>) -> Self {
        Self { inner }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Result<Tensor<B, 4>, LayerError> {
        residual_add(x, |x| self.inner.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::{AttentionConfig, AttentionKind};
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_residual_adds_input() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0], [3.0, 4.0]], &device);
        let y = residual_add(x, |x| x * 2.0).unwrap();
        assert_eq!(
            y.into_data().to_vec::<f32>().unwrap(),
            vec![3.0, 6.0, 9.0, 12.0]
        );
    }

    #[test]
    fn test_residual_rejects_shape_change() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::zeros([2, 4], &device);
        let err = residual_add(x, |x| x.narrow(1, 0, 1)).unwrap_err();
        assert_eq!(
            err,
            LayerError::ShapeMismatch {
                input: vec![2, 4],
                output: vec![2, 1]
            }
        );
    }

    #[test]
    fn test_residual_attention_block() {
        let device = Default::default();
        let attn = AttentionConfig::new(8)
            .with_heads(2)
            .with_dim_head(4)
            .init_linear::<TestBackend>(&device)
            .unwrap();
        let block = Residual::new(PreNorm::new(AttentionKind::Linear(attn), &device));

        let x = Tensor::random([1, 8, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(block.forward(x).unwrap().dims(), [1, 8, 4, 4]);
    }
}
