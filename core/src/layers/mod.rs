//! Layer zoo for the growable DenseNet graph.
//!
//! Each graph node wraps one of these layers. Layers are immutable records:
//! they hold parameter ids, never parameter values, so a node can be shared by
//! reference while the [`ParamStore`] is trained underneath it.

pub mod activations;
pub mod concat;
pub mod conv;
pub mod dense;
pub mod norm;
pub mod pooling;

use ndarray::ArrayD;
use rand::rngs::StdRng;

use crate::error::{GrowError, GrowResult};
use crate::math::NormCache;
use crate::params::{Gradients, ParamId, ParamStore};
use crate::tensor::Tensor;

/// Per-sample feature-map shape `[C, H, W]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub const fn d3(channels: usize, height: usize, width: usize) -> Self {
        Self { channels, height, width }
    }
    pub const fn vector(len: usize) -> Self {
        Self { channels: len, height: 1, width: 1 }
    }
    pub fn total(&self) -> usize {
        self.channels * self.height * self.width
    }
    pub fn with_channels(&self, channels: usize) -> Self {
        Self { channels, ..*self }
    }
    pub fn dims(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }
}

/// Mutable context threaded through one forward pass.
pub struct Pass<'r> {
    pub training: bool,
    pub rng: &'r mut StdRng,
    /// New running statistics produced while training; applied once the
    /// pass has finished.
    pub stat_updates: Vec<(ParamId, ArrayD<f32>)>,
}

impl<'r> Pass<'r> {
    pub fn new(training: bool, rng: &'r mut StdRng) -> Self {
        Self { training, rng, stat_updates: Vec::new() }
    }
}

/// What a layer keeps from its forward pass for the backward pass.
#[derive(Debug, Clone)]
pub enum Cache {
    None,
    Norm(NormCache),
    Mask(Tensor),
}

pub trait Layer: Send + Sync {
    fn name(&self) -> &'static str;

    fn output_shape(&self, inputs: &[Shape]) -> GrowResult<Shape>;

    /// Variables this layer reads (trainable and statistics alike).
    fn params(&self) -> Vec<ParamId> {
        Vec::new()
    }

    fn forward(&self, inputs: &[&Tensor], params: &ParamStore, pass: &mut Pass<'_>) -> GrowResult<(Tensor, Cache)>;

    /// Returns one gradient per input and accumulates parameter gradients
    /// into `grads`.
    fn backward(
        &self,
        inputs: &[&Tensor],
        cache: &Cache,
        grad_out: &Tensor,
        params: &ParamStore,
        grads: &mut Gradients,
    ) -> GrowResult<Vec<Tensor>>;
}

/// Fetch the single input of a unary layer.
pub(crate) fn single<'a>(name: &'static str, inputs: &[&'a Tensor]) -> GrowResult<&'a Tensor> {
    match inputs {
        [only] => Ok(*only),
        _ => Err(GrowError::InvalidConfig(format!("{} expects exactly one input, got {}", name, inputs.len()))),
    }
}

pub(crate) fn single_shape(name: &'static str, inputs: &[Shape]) -> GrowResult<Shape> {
    match inputs {
        [only] => Ok(*only),
        _ => Err(GrowError::InvalidConfig(format!("{} expects exactly one input, got {}", name, inputs.len()))),
    }
}

pub use activations::{DropoutLayer, ReLULayer};
pub use concat::ConcatLayer;
pub use conv::KernelConv;
pub use dense::ClassifierLayer;
pub use norm::BatchNorm;
pub use pooling::{AvgPoolLayer, GlobalPoolLayer};
