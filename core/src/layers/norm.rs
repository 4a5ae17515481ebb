//! Batch normalisation with learnable scale/shift and running statistics.

use ndarray::Array1;

use crate::error::{GrowError, GrowResult};
use crate::math;
use crate::params::{Gradients, ParamId, ParamStore};
use crate::tensor::Tensor;
use super::{single, single_shape, Cache, Layer, Pass, Shape};

#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub gamma: ParamId,
    pub beta: ParamId,
    pub moving_mean: ParamId,
    pub moving_var: ParamId,
    pub channels: usize,
    /// Running statistics decay: `running = decay * running + (1 - decay) * batch`.
    pub decay: f32,
}

impl Layer for BatchNorm {
    fn name(&self) -> &'static str {
        "BatchNorm"
    }

    fn output_shape(&self, inputs: &[Shape]) -> GrowResult<Shape> {
        let input = single_shape(self.name(), inputs)?;
        if input.channels != self.channels {
            return Err(GrowError::DimensionMismatch { expected: self.channels, actual: input.channels });
        }
        Ok(input)
    }

    fn params(&self) -> Vec<ParamId> {
        vec![self.gamma, self.beta, self.moving_mean, self.moving_var]
    }

    fn forward(&self, inputs: &[&Tensor], params: &ParamStore, pass: &mut Pass<'_>) -> GrowResult<(Tensor, Cache)> {
        let input = single(self.name(), inputs)?;
        let gamma = params.vector(self.gamma)?;
        let beta = params.vector(self.beta)?;
        if !pass.training {
            let mean = params.vector(self.moving_mean)?;
            let var = params.vector(self.moving_var)?;
            return Ok((math::batch_norm_infer(input, &gamma, &beta, &mean, &var)?, Cache::None));
        }

        let (output, cache) = math::batch_norm_train(input, &gamma, &beta)?;
        let decay = self.decay;
        let blend = |running: Array1<f32>, batch: &Array1<f32>| running * decay + batch * (1.0 - decay);
        let mean = blend(params.vector(self.moving_mean)?, &cache.mean);
        let var = blend(params.vector(self.moving_var)?, &cache.var);
        pass.stat_updates.push((self.moving_mean, mean.into_dyn()));
        pass.stat_updates.push((self.moving_var, var.into_dyn()));
        Ok((output, Cache::Norm(cache)))
    }

    fn backward(
        &self,
        _inputs: &[&Tensor],
        cache: &Cache,
        grad_out: &Tensor,
        params: &ParamStore,
        grads: &mut Gradients,
    ) -> GrowResult<Vec<Tensor>> {
        let Cache::Norm(cache) = cache else {
            return Err(GrowError::InvalidConfig("batch norm backward needs a training pass".into()));
        };
        let gamma = params.vector(self.gamma)?;
        let (d_input, d_gamma, d_beta) = math::batch_norm_backward(grad_out, cache, &gamma);
        grads.accumulate(self.gamma, d_gamma.into_dyn());
        grads.accumulate(self.beta, d_beta.into_dyn());
        Ok(vec![d_input])
    }
}
