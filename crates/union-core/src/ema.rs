//! Exponential moving average of module parameters
//!
//! Keeps a shadow copy of a model whose weights trail the live training copy:
//!
//! ```text
//! shadow = beta * shadow + (1 - beta) * source
//! ```
//!
//! Parameters are paired by visit order, so both modules must have been
//! built from the same configuration. The update runs between optimizer
//! steps and never concurrently with a forward pass on the same weights.

use burn::module::{ModuleMapper, ModuleVisitor, Param};
use burn::prelude::*;

use crate::params::ShapeCollector;

// `Display`/`Error` are implemented by hand: thiserror treats any field named
// `source` as the error cause, which these plain data fields are not.
#[derive(Debug, Clone, PartialEq)]
pub enum EmaError {
    InvalidBeta(f64),

    CountMismatch { shadow: usize, source: usize },

    ShapeMismatch {
        index: usize,
        shadow: Vec<usize>,
        source: Vec<usize>,
    },
}

impl std::fmt::Display for EmaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBeta(beta) => write!(f, "EMA beta must lie in [0, 1], got {beta}"),
            Self::CountMismatch { shadow, source } => write!(
                f,
                "Parameter count mismatch: shadow has {shadow}, source has {source}"
            ),
            Self::ShapeMismatch {
                index,
                shadow,
                source,
            } => write!(
                f,
                "Parameter {index} shape mismatch: shadow {shadow:?}, source {source:?}"
            ),
        }
    }
}

impl std::error::Error for EmaError {}

/// Stateless EMA rule with a fixed decay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpMovingAvg {
    beta: f64,
}

impl ExpMovingAvg {
    /// Creates the rule; `beta` must be in `[0, 1]`
    pub fn new(beta: f64) -> Result<Self, EmaError> {
        if !(0.0..=1.0).contains(&beta) {
            return Err(EmaError::InvalidBeta(beta));
        }
        Ok(Self { beta })
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Blends one tensor; `None` means the shadow has no value yet
    pub fn blend<B: Backend, const D: usize>(
        &self,
        shadow: Option<Tensor<B, D>>,
        source: Tensor<B, D>,
    ) -> Tensor<B, D> {
        match shadow {
            None => source,
            Some(_) if self.beta == 0.0 => source,
            Some(shadow) if self.beta == 1.0 => shadow,
            Some(shadow) => shadow * self.beta + source * (1.0 - self.beta),
        }
    }

    /// Moves every parameter of `shadow` towards the matching one in `source`
    pub fn update_model_params<B: Backend, M: Module<B>>(
        &self,
        shadow: M,
        source: &M,
    ) -> Result<M, EmaError> {
        let sources = check_structure(&shadow, source)?;
        tracing::trace!(beta = self.beta, tensors = sources.len(), "ema update");

        let mut blender = Blender {
            ema: *self,
            sources: sources.into_iter(),
        };
        Ok(shadow.map(&mut blender))
    }
}

/// Flattened source parameters
struct SourceCollector<B: Backend> {
    tensors: Vec<Tensor<B, 1>>,
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for SourceCollector<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let tensor = param.val().detach();
        let numel = tensor.shape().num_elements();
        self.shapes.push(tensor.dims().to_vec());
        self.tensors.push(tensor.reshape([numel]));
    }
}

struct Blender<B: Backend> {
    ema: ExpMovingAvg,
    sources: std::vec::IntoIter<Tensor<B, 1>>,
}

impl<B: Backend> ModuleMapper<B> for Blender<B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let Some(source) = self.sources.next() else {
            return param;
        };
        let ema = self.ema;
        param.map(|shadow| {
            let source = source.reshape(shadow.dims());
            ema.blend(Some(shadow), source).detach()
        })
    }
}

/// Verifies both modules expose the same parameter shapes in the same order
fn check_structure<B: Backend, M: Module<B>>(
    shadow: &M,
    source: &M,
) -> Result<Vec<Tensor<B, 1>>, EmaError> {
    let mut shadow_shapes = ShapeCollector::default();
    shadow.visit(&mut shadow_shapes);

    let mut collector = SourceCollector {
        tensors: Vec::new(),
        shapes: Vec::new(),
    };
    source.visit(&mut collector);

    if shadow_shapes.shapes.len() != collector.shapes.len() {
        return Err(EmaError::CountMismatch {
            shadow: shadow_shapes.shapes.len(),
            source: collector.shapes.len(),
        });
    }

    for (index, (shadow, source)) in shadow_shapes
        .shapes
        .into_iter()
        .zip(&collector.shapes)
        .enumerate()
    {
        if &shadow != source {
            return Err(EmaError::ShapeMismatch {
                index,
                shadow,
                source: source.clone(),
            });
        }
    }

    Ok(collector.tensors)
}

/// Owns the shadow model and applies the EMA rule after each step
///
/// The shadow starts out empty; the first update copies the source as is.
#[derive(Debug)]
pub struct EmaTracker<M> {
    ema: ExpMovingAvg,
    shadow: Option<M>,
    updates: usize,
}

impl<M> EmaTracker<M> {
    pub fn new(beta: f64) -> Result<Self, EmaError> {
        Ok(Self {
            ema: ExpMovingAvg::new(beta)?,
            shadow: None,
            updates: 0,
        })
    }

    pub fn beta(&self) -> f64 {
        self.ema.beta()
    }

    /// Number of updates applied so far
    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn shadow(&self) -> Option<&M> {
        self.shadow.as_ref()
    }

    pub fn into_shadow(self) -> Option<M> {
        self.shadow
    }

    /// Applies one EMA step from the live model
    ///
    /// On a structural mismatch the shadow is left untouched.
    pub fn update<B: Backend>(&mut self, source: &M) -> Result<(), EmaError>
    where
        M: Module<B>,
    {
        let next = match self.shadow.take() {
            None => source.clone().no_grad(),
            Some(shadow) => match self.ema.update_model_params(shadow.clone(), source) {
                Ok(next) => next,
                Err(err) => {
                    self.shadow = Some(shadow);
                    return Err(err);
                }
            },
        };
        self.shadow = Some(next);
        self.updates += 1;
        Ok(())
    }
}
