//! Convolution built from individually addressable kernels.
//!
//! A filter is never stored as one variable. Each output channel is its own
//! `[C, k, k]` kernel variable and the filter is the stack of all kernels
//! along the output axis, rebuilt on every pass. Appending kernels is then a
//! matter of building a new `KernelConv` over `old ++ new` kernel ids.

use ndarray::{s, Array4};

use crate::error::{GrowError, GrowResult};
use crate::math;
use crate::params::{Gradients, ParamId, ParamStore};
use crate::tensor::{self, Tensor};
use super::{single, single_shape, Cache, Layer, Pass, Shape};

#[derive(Debug, Clone)]
pub struct KernelConv {
    pub kernels: Vec<ParamId>,
    pub in_channels: usize,
    pub kernel_size: usize,
    pub padding: usize,
}

impl KernelConv {
    /// SAME padding for odd kernel sizes, VALID for 1×1.
    pub fn new(kernels: Vec<ParamId>, in_channels: usize, kernel_size: usize) -> Self {
        Self {
            kernels,
            in_channels,
            kernel_size,
            padding: math::same_padding(kernel_size),
        }
    }

    pub fn out_channels(&self) -> usize {
        self.kernels.len()
    }

    /// Stack the current kernel values into a `[O, C, k, k]` filter.
    pub fn filter(&self, params: &ParamStore) -> GrowResult<Array4<f32>> {
        let values = self
            .kernels
            .iter()
            .map(|&id| params.value(id))
            .collect::<GrowResult<Vec<_>>>()?;
        tensor::stack_kernels(&values, self.in_channels, self.kernel_size)
    }
}

impl Layer for KernelConv {
    fn name(&self) -> &'static str {
        "KernelConv"
    }

    fn output_shape(&self, inputs: &[Shape]) -> GrowResult<Shape> {
        let input = single_shape(self.name(), inputs)?;
        if input.channels != self.in_channels {
            return Err(GrowError::DimensionMismatch { expected: self.in_channels, actual: input.channels });
        }
        let (out_h, out_w) = math::conv2d_output_size(input.height, input.width, self.kernel_size, self.padding);
        Ok(Shape::d3(self.out_channels(), out_h, out_w))
    }

    fn params(&self) -> Vec<ParamId> {
        self.kernels.clone()
    }

    fn forward(&self, inputs: &[&Tensor], params: &ParamStore, _pass: &mut Pass<'_>) -> GrowResult<(Tensor, Cache)> {
        let input = single(self.name(), inputs)?;
        let filter = self.filter(params)?;
        Ok((math::conv2d(input, &filter, self.padding)?, Cache::None))
    }

    fn backward(
        &self,
        inputs: &[&Tensor],
        _cache: &Cache,
        grad_out: &Tensor,
        params: &ParamStore,
        grads: &mut Gradients,
    ) -> GrowResult<Vec<Tensor>> {
        let input = single(self.name(), inputs)?;
        let filter = self.filter(params)?;
        let (d_input, d_filter) = math::conv2d_backward(input, &filter, grad_out, self.padding)?;
        for (o, &id) in self.kernels.iter().enumerate() {
            grads.accumulate(id, d_filter.slice(s![o, .., .., ..]).to_owned().into_dyn());
        }
        Ok(vec![d_input])
    }
}
