//! Activation layers: ReLU and dropout.
//!
//! Both are zero-weight layers that keep the input shape, so they can sit
//! anywhere inside a composite function.

use rand::Rng;

use crate::error::{GrowError, GrowResult};
use crate::math;
use crate::params::{Gradients, ParamStore};
use crate::tensor::Tensor;
use super::{single, single_shape, Cache, Layer, Pass, Shape};

// =============================================================================
// ReLU
// =============================================================================

/// max(0, x). Zero parameters.
#[derive(Debug, Clone, Copy)]
pub struct ReLULayer;

impl Layer for ReLULayer {
    fn name(&self) -> &'static str { "ReLU" }

    fn output_shape(&self, inputs: &[Shape]) -> GrowResult<Shape> {
        single_shape(self.name(), inputs)
    }

    fn forward(&self, inputs: &[&Tensor], _params: &ParamStore, _pass: &mut Pass<'_>) -> GrowResult<(Tensor, Cache)> {
        let input = single(self.name(), inputs)?;
        Ok((math::relu(input), Cache::None))
    }

    fn backward(
        &self,
        inputs: &[&Tensor],
        _cache: &Cache,
        grad_out: &Tensor,
        _params: &ParamStore,
        _grads: &mut Gradients,
    ) -> GrowResult<Vec<Tensor>> {
        let input = single(self.name(), inputs)?;
        Ok(vec![math::relu_backward(input, grad_out)])
    }
}

// =============================================================================
// Dropout
// =============================================================================

/// Inverted dropout: while training, each unit survives with probability
/// `keep_prob` and survivors are scaled by `1 / keep_prob`. Identity at
/// evaluation time and whenever `keep_prob >= 1`.
#[derive(Debug, Clone, Copy)]
pub struct DropoutLayer {
    pub keep_prob: f32,
}

impl DropoutLayer {
    fn active(&self, training: bool) -> bool {
        training && self.keep_prob < 1.0
    }
}

impl Layer for DropoutLayer {
    fn name(&self) -> &'static str { "Dropout" }

    fn output_shape(&self, inputs: &[Shape]) -> GrowResult<Shape> {
        single_shape(self.name(), inputs)
    }

    fn forward(&self, inputs: &[&Tensor], _params: &ParamStore, pass: &mut Pass<'_>) -> GrowResult<(Tensor, Cache)> {
        let input = single(self.name(), inputs)?;
        if !self.active(pass.training) {
            return Ok((input.clone(), Cache::None));
        }
        if self.keep_prob <= 0.0 {
            return Err(GrowError::InvalidConfig(format!("keep_prob must be in (0, 1], got {}", self.keep_prob)));
        }
        let scale = 1.0 / self.keep_prob;
        let keep = self.keep_prob;
        let rng = &mut *pass.rng;
        let mask = input.mapv(|_| if rng.gen::<f32>() < keep { scale } else { 0.0 });
        Ok((input * &mask, Cache::Mask(mask)))
    }

    fn backward(
        &self,
        _inputs: &[&Tensor],
        cache: &Cache,
        grad_out: &Tensor,
        _params: &ParamStore,
        _grads: &mut Gradients,
    ) -> GrowResult<Vec<Tensor>> {
        match cache {
            Cache::Mask(mask) => Ok(vec![grad_out * mask]),
            _ => Ok(vec![grad_out.clone()]),
        }
    }
}
