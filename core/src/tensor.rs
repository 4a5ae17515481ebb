//! Dense f32 feature maps in NCHW layout plus the helpers the graph needs.
//!
//! Every value flowing between nodes is a `Tensor` of shape
//! `[batch, channels, height, width]`. Vectors (pooled features, logits) keep
//! the same rank with `height = width = 1`.

use ndarray::{s, Array2, Array4, ArrayD, Axis, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::error::{GrowError, GrowResult};

/// A batch of feature maps, `[N, C, H, W]`.
pub type Tensor = Array4<f32>;

/// One-hot labels, `[N, classes]`.
pub type Labels = Array2<f32>;

/// Concatenate two tensors along the channel axis.
///
/// This is the DenseNet join: `[x_0..x_{l-1}] ++ x_l`.
pub fn concat_channels(a: &Tensor, b: &Tensor) -> GrowResult<Tensor> {
    let (an, _, ah, aw) = a.dim();
    let (bn, bc, bh, bw) = b.dim();
    if an != bn || ah != bh || aw != bw {
        return Err(GrowError::shape("concat", &[an, bc, ah, aw], &[bn, bc, bh, bw]));
    }
    Ok(ndarray::concatenate(Axis(1), &[a.view(), b.view()])?)
}

/// Split a tensor along the channel axis at `at`: `([0, at), [at, C))`.
pub fn split_channels(t: &Tensor, at: usize) -> GrowResult<(Tensor, Tensor)> {
    let channels = t.dim().1;
    if at > channels {
        return Err(GrowError::DimensionMismatch { expected: channels, actual: at });
    }
    let head = t.slice(s![.., ..at, .., ..]).to_owned();
    let tail = t.slice(s![.., at.., .., ..]).to_owned();
    Ok((head, tail))
}

/// Stack per-output-channel kernels (`[C, k, k]` each) into a filter
/// `[O, C, k, k]`.
pub fn stack_kernels(kernels: &[&ArrayD<f32>], in_channels: usize, size: usize) -> GrowResult<Array4<f32>> {
    let mut filter = Array4::<f32>::zeros((kernels.len(), in_channels, size, size));
    for (o, kernel) in kernels.iter().enumerate() {
        if kernel.shape() != [in_channels, size, size] {
            return Err(GrowError::shape("stack_kernels", &[in_channels, size, size], kernel.shape()));
        }
        let kernel = kernel.view().into_dimensionality::<ndarray::Ix3>()?;
        filter.slice_mut(s![o, .., .., ..]).assign(&kernel);
    }
    Ok(filter)
}

/// He/MSRA normal initialisation: `N(0, 2 / fan_in)`.
pub fn msra_normal<R: Rng + ?Sized>(rng: &mut R, shape: &[usize], fan_in: usize) -> ArrayD<f32> {
    let std = (2.0 / fan_in.max(1) as f32).sqrt();
    match Normal::new(0.0f32, std) {
        Ok(normal) => ArrayD::from_shape_fn(IxDyn(shape), |_| normal.sample(rng)),
        Err(_) => ArrayD::zeros(IxDyn(shape)),
    }
}

/// Xavier/Glorot uniform initialisation.
pub fn xavier_uniform<R: Rng + ?Sized>(rng: &mut R, shape: &[usize], fan_in: usize, fan_out: usize) -> ArrayD<f32> {
    let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    let uniform = Uniform::new_inclusive(-limit, limit);
    ArrayD::from_shape_fn(IxDyn(shape), |_| uniform.sample(rng))
}

/// Mean of absolute values; 0 for an empty slice.
pub fn mean_abs<'a>(values: impl IntoIterator<Item = &'a f32>) -> f32 {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for v in values {
        sum += v.abs() as f64;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        (sum / count as f64) as f32
    }
}

/// Population mean and standard deviation (numpy's default `ddof = 0`).
pub fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean as f32, var.sqrt() as f32)
}
