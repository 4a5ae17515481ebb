//! Pooling layers: average pooling for transitions, global pooling for heads.
//!
//! No learnable parameters, pure spatial downsampling.

use crate::error::{GrowError, GrowResult};
use crate::math;
use crate::params::{Gradients, ParamStore};
use crate::tensor::Tensor;
use super::{single, single_shape, Cache, Layer, Pass, Shape};

/// `k×k` average pooling with stride `k`.
///
/// Reduces [C, H, W] → [C, H / k, W / k].
#[derive(Debug, Clone, Copy)]
pub struct AvgPoolLayer {
    pub k: usize,
}

impl AvgPoolLayer {
    pub fn new(k: usize) -> GrowResult<Self> {
        if k == 0 {
            return Err(GrowError::InvalidConfig("pooling window must be positive".into()));
        }
        Ok(Self { k })
    }
}

impl Layer for AvgPoolLayer {
    fn name(&self) -> &'static str { "AvgPool" }

    fn output_shape(&self, inputs: &[Shape]) -> GrowResult<Shape> {
        let input = single_shape(self.name(), inputs)?;
        if input.height < self.k || input.width < self.k {
            return Err(GrowError::shape("avg_pool", &[input.channels, self.k, self.k], &input.dims()));
        }
        Ok(Shape::d3(input.channels, input.height / self.k, input.width / self.k))
    }

    fn forward(&self, inputs: &[&Tensor], _params: &ParamStore, _pass: &mut Pass<'_>) -> GrowResult<(Tensor, Cache)> {
        let input = single(self.name(), inputs)?;
        Ok((math::avg_pool(input, self.k)?, Cache::None))
    }

    fn backward(
        &self,
        inputs: &[&Tensor],
        _cache: &Cache,
        grad_out: &Tensor,
        _params: &ParamStore,
        _grads: &mut Gradients,
    ) -> GrowResult<Vec<Tensor>> {
        let (_, _, in_h, in_w) = single(self.name(), inputs)?.dim();
        Ok(vec![math::avg_pool_backward(grad_out, self.k, in_h, in_w)])
    }
}

/// Average over the whole feature map: [C, H, W] → [C, 1, 1].
#[derive(Debug, Clone, Copy)]
pub struct GlobalPoolLayer;

impl Layer for GlobalPoolLayer {
    fn name(&self) -> &'static str { "GlobalPool" }

    fn output_shape(&self, inputs: &[Shape]) -> GrowResult<Shape> {
        Ok(Shape::vector(single_shape(self.name(), inputs)?.channels))
    }

    fn forward(&self, inputs: &[&Tensor], _params: &ParamStore, _pass: &mut Pass<'_>) -> GrowResult<(Tensor, Cache)> {
        let input = single(self.name(), inputs)?;
        Ok((math::global_avg_pool(input)?, Cache::None))
    }

    fn backward(
        &self,
        inputs: &[&Tensor],
        _cache: &Cache,
        grad_out: &Tensor,
        _params: &ParamStore,
        _grads: &mut Gradients,
    ) -> GrowResult<Vec<Tensor>> {
        let (_, _, in_h, in_w) = single(self.name(), inputs)?.dim();
        Ok(vec![math::global_avg_pool_backward(grad_out, in_h, in_w)])
    }
}
