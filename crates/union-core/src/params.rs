//! Parameter inspection for any burn module
//!
//! Walks the float parameters of a module in declaration order. The same
//! order is what [`crate::ema`] relies on to pair shadow and live weights.

use std::fmt;

use burn::module::{ModuleVisitor, Param};
use burn::prelude::*;

/// Shapes and total size of a module's float parameters
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParamSummary {
    /// Shape of every parameter tensor, in visit order
    pub shapes: Vec<Vec<usize>>,
    /// Total number of learnable scalars
    pub total: usize,
}

impl ParamSummary {
    pub fn tensor_count(&self) -> usize {
        self.shapes.len()
    }

    pub fn millions(&self) -> f64 {
        self.total as f64 / 1e6
    }
}

impl fmt::Display for ParamSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tensors, {:.2} million parameters",
            self.tensor_count(),
            self.millions()
        )
    }
}

#[derive(Default)]
pub(crate) struct ShapeCollector {
    pub(crate) shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for ShapeCollector {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.shapes.push(param.dims().to_vec());
    }
}

/// Collects the parameter shapes of `module`
pub fn summarize_params<B: Backend, M: Module<B>>(module: &M) -> ParamSummary {
    let mut collector = ShapeCollector::default();
    module.visit(&mut collector);

    let total = collector
        .shapes
        .iter()
        .map(|shape| shape.iter().product::<usize>())
        .sum();

    ParamSummary {
        shapes: collector.shapes,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::norm::SpatialLayerNorm;
    use burn::nn::LinearConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_linear_summary() {
        let device = Default::default();
        let linear = LinearConfig::new(4, 3).init::<TestBackend>(&device);
        let summary = summarize_params(&linear);

        assert_eq!(summary.tensor_count(), 2);
        assert_eq!(summary.total, 4 * 3 + 3);
        assert_eq!(summary.total, linear.num_params());
    }

    #[test]
    fn test_norm_params_are_learnable() {
        let device = Default::default();
        let norm = SpatialLayerNorm::<TestBackend>::new(16, &device);
        let summary = summarize_params(&norm);

        assert_eq!(summary.shapes, vec![vec![16], vec![16]]);
        assert_eq!(summary.total, 32);
    }

    #[test]
    fn test_display() {
        let summary = ParamSummary {
            shapes: vec![vec![1000, 1000], vec![500_000]],
            total: 1_500_000,
        };
        assert_eq!(summary.to_string(), "2 tensors, 1.50 million parameters");
    }
}
