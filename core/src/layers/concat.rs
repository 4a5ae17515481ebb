//! Channel concatenation: the DenseNet join.
//!
//! No parameters and no arithmetic, only a copy along the channel axis.
//! The backward pass splits the gradient at the same boundary.

use crate::error::{GrowError, GrowResult};
use crate::params::{Gradients, ParamStore};
use crate::tensor::{self, Tensor};
use super::{Cache, Layer, Pass, Shape};

/// `[a, b]` → `a ++ b` along channels. Spatial sizes must agree.
#[derive(Debug, Clone, Copy)]
pub struct ConcatLayer;

impl ConcatLayer {
    fn pair<'t, T>(inputs: &'t [T]) -> GrowResult<(&'t T, &'t T)> {
        match inputs {
            [a, b] => Ok((a, b)),
            _ => Err(GrowError::InvalidConfig(format!("Concat expects two inputs, got {}", inputs.len()))),
        }
    }
}

impl Layer for ConcatLayer {
    fn name(&self) -> &'static str { "Concat" }

    fn output_shape(&self, inputs: &[Shape]) -> GrowResult<Shape> {
        let (a, b) = Self::pair(inputs)?;
        if (a.height, a.width) != (b.height, b.width) {
            return Err(GrowError::shape("concat", &a.dims(), &b.dims()));
        }
        Ok(a.with_channels(a.channels + b.channels))
    }

    fn forward(&self, inputs: &[&Tensor], _params: &ParamStore, _pass: &mut Pass<'_>) -> GrowResult<(Tensor, Cache)> {
        let (a, b) = Self::pair(inputs)?;
        Ok((tensor::concat_channels(a, b)?, Cache::None))
    }

    fn backward(
        &self,
        inputs: &[&Tensor],
        _cache: &Cache,
        grad_out: &Tensor,
        _params: &ParamStore,
        _grads: &mut Gradients,
    ) -> GrowResult<Vec<Tensor>> {
        let (a, _) = Self::pair(inputs)?;
        let (da, db) = tensor::split_channels(grad_out, a.dim().1)?;
        Ok(vec![da, db])
    }
}
