//! f32 kernels for training and inference on NCHW tensors.
//!
//! Convolution follows the im2col + matmul pattern: each receptive field is
//! unrolled into a column, then the whole filter is applied with a single
//! matrix product. Per-sample work is spread over the current rayon pool.
//!
//! Every forward kernel has a matching `*_backward` that returns gradients
//! with respect to its inputs (and parameters where it has any).

use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView3, Axis, Zip};
use rayon::prelude::*;

use crate::error::{GrowError, GrowResult};
use crate::tensor::Tensor;

/// Batch-norm epsilon, the same value the reference batch norm uses.
pub const BN_EPSILON: f32 = 1e-3;

// =============================================================================
// Convolution
// =============================================================================

/// Padding that keeps spatial size for odd kernels (SAME), 0 for 1×1 (VALID).
#[inline]
pub fn same_padding(kernel_size: usize) -> usize {
    kernel_size.saturating_sub(1) / 2
}

/// Output spatial size of a stride-1 convolution.
pub fn conv2d_output_size(in_h: usize, in_w: usize, kernel_size: usize, padding: usize) -> (usize, usize) {
    let out_h = (in_h + 2 * padding + 1).saturating_sub(kernel_size);
    let out_w = (in_w + 2 * padding + 1).saturating_sub(kernel_size);
    (out_h, out_w)
}

/// Unroll one sample `[C, H, W]` into `[C*k*k, out_h*out_w]`.
///
/// Row `c*k*k + ky*k + kx` matches the flattened `[O, C, k, k]` filter layout.
pub fn im2col(input: ArrayView3<f32>, kernel_size: usize, padding: usize, out_h: usize, out_w: usize) -> Array2<f32> {
    let (channels, in_h, in_w) = input.dim();
    let k = kernel_size;
    let spatial_out = out_h * out_w;
    let mut cols = Array2::<f32>::zeros((channels * k * k, spatial_out));
    for c in 0..channels {
        for ky in 0..k {
            for kx in 0..k {
                let row = c * k * k + ky * k + kx;
                for oy in 0..out_h {
                    let iy = (oy + ky) as isize - padding as isize;
                    if iy < 0 || iy >= in_h as isize {
                        continue;
                    }
                    for ox in 0..out_w {
                        let ix = (ox + kx) as isize - padding as isize;
                        if ix < 0 || ix >= in_w as isize {
                            continue;
                        }
                        cols[[row, oy * out_w + ox]] = input[[c, iy as usize, ix as usize]];
                    }
                }
            }
        }
    }
    cols
}

/// Fold columns back into a `[C, H, W]` image, summing overlapping windows.
pub fn col2im(
    cols: &Array2<f32>,
    channels: usize,
    in_h: usize,
    in_w: usize,
    kernel_size: usize,
    padding: usize,
    out_h: usize,
    out_w: usize,
) -> Array3<f32> {
    let k = kernel_size;
    let mut image = Array3::<f32>::zeros((channels, in_h, in_w));
    for c in 0..channels {
        for ky in 0..k {
            for kx in 0..k {
                let row = c * k * k + ky * k + kx;
                for oy in 0..out_h {
                    let iy = (oy + ky) as isize - padding as isize;
                    if iy < 0 || iy >= in_h as isize {
                        continue;
                    }
                    for ox in 0..out_w {
                        let ix = (ox + kx) as isize - padding as isize;
                        if ix < 0 || ix >= in_w as isize {
                            continue;
                        }
                        image[[c, iy as usize, ix as usize]] += cols[[row, oy * out_w + ox]];
                    }
                }
            }
        }
    }
    image
}

fn filter_matrix(filter: &Array4<f32>) -> GrowResult<Array2<f32>> {
    let (o, c, kh, kw) = filter.dim();
    Ok(filter.as_standard_layout().to_owned().into_shape((o, c * kh * kw))?)
}

/// Stride-1 2-D convolution without bias.
///
/// Input `[N, C, H, W]`, filter `[O, C, k, k]` → output `[N, O, H', W']`.
pub fn conv2d(input: &Tensor, filter: &Array4<f32>, padding: usize) -> GrowResult<Tensor> {
    let (n, channels, in_h, in_w) = input.dim();
    let (out_ch, f_ch, k, _) = filter.dim();
    if f_ch != channels {
        return Err(GrowError::DimensionMismatch { expected: f_ch, actual: channels });
    }
    let (out_h, out_w) = conv2d_output_size(in_h, in_w, k, padding);
    let weights = filter_matrix(filter)?;

    let samples: Vec<Array2<f32>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let cols = im2col(input.slice(s![i, .., .., ..]), k, padding, out_h, out_w);
            weights.dot(&cols)
        })
        .collect();

    let mut output = Tensor::zeros((n, out_ch, out_h, out_w));
    for (i, sample) in samples.into_iter().enumerate() {
        let sample = sample.into_shape((out_ch, out_h, out_w))?;
        output.slice_mut(s![i, .., .., ..]).assign(&sample);
    }
    Ok(output)
}

/// Gradients of [`conv2d`]: `(d_input, d_filter)`.
pub fn conv2d_backward(
    input: &Tensor,
    filter: &Array4<f32>,
    grad_out: &Tensor,
    padding: usize,
) -> GrowResult<(Tensor, Array4<f32>)> {
    let (n, channels, in_h, in_w) = input.dim();
    let (out_ch, _, k, _) = filter.dim();
    let (gn, gc, out_h, out_w) = grad_out.dim();
    if gn != n || gc != out_ch {
        return Err(GrowError::shape("conv2d_backward", &[n, out_ch, out_h, out_w], &[gn, gc, out_h, out_w]));
    }
    let weights = filter_matrix(filter)?;
    let weights_t = weights.t();

    let per_sample: Vec<GrowResult<(Array3<f32>, Array2<f32>)>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let cols = im2col(input.slice(s![i, .., .., ..]), k, padding, out_h, out_w);
            let dy = grad_out
                .slice(s![i, .., .., ..])
                .to_owned()
                .into_shape((out_ch, out_h * out_w))?;
            let d_weights = dy.dot(&cols.t());
            let d_cols = weights_t.dot(&dy);
            let d_image = col2im(&d_cols, channels, in_h, in_w, k, padding, out_h, out_w);
            Ok((d_image, d_weights))
        })
        .collect();

    let mut d_input = Tensor::zeros((n, channels, in_h, in_w));
    let mut d_weights = Array2::<f32>::zeros(weights.dim());
    for (i, sample) in per_sample.into_iter().enumerate() {
        let (d_image, dw) = sample?;
        d_input.slice_mut(s![i, .., .., ..]).assign(&d_image);
        d_weights += &dw;
    }
    let d_filter = d_weights.into_shape((out_ch, channels, k, k))?;
    Ok((d_input, d_filter))
}

// =============================================================================
// Pooling
// =============================================================================

/// Average pooling with a `k×k` window and stride `k` (VALID).
pub fn avg_pool(input: &Tensor, k: usize) -> GrowResult<Tensor> {
    if k == 0 {
        return Err(GrowError::InvalidConfig("pooling window must be positive".into()));
    }
    let (n, c, in_h, in_w) = input.dim();
    let (out_h, out_w) = (in_h / k, in_w / k);
    let scale = 1.0 / (k * k) as f32;
    let mut output = Tensor::zeros((n, c, out_h, out_w));
    Zip::indexed(&mut output).for_each(|(b, ch, oy, ox), out| {
        let window = input.slice(s![b, ch, oy * k..oy * k + k, ox * k..ox * k + k]);
        *out = window.sum() * scale;
    });
    Ok(output)
}

/// Spread each pooled gradient evenly back over its window.
pub fn avg_pool_backward(grad_out: &Tensor, k: usize, in_h: usize, in_w: usize) -> Tensor {
    let (n, c, out_h, out_w) = grad_out.dim();
    let scale = 1.0 / (k * k) as f32;
    let mut grad_in = Tensor::zeros((n, c, in_h, in_w));
    for b in 0..n {
        for ch in 0..c {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let g = grad_out[[b, ch, oy, ox]] * scale;
                    grad_in
                        .slice_mut(s![b, ch, oy * k..oy * k + k, ox * k..ox * k + k])
                        .mapv_inplace(|v| v + g);
                }
            }
        }
    }
    grad_in
}

/// Mean over the spatial axes: `[N, C, H, W]` → `[N, C, 1, 1]`.
pub fn global_avg_pool(input: &Tensor) -> GrowResult<Tensor> {
    let (n, c, h, w) = input.dim();
    if h * w == 0 {
        return Err(GrowError::shape("global_avg_pool", &[n, c, 1, 1], &[n, c, h, w]));
    }
    let summed = input.sum_axis(Axis(3)).sum_axis(Axis(2));
    let scale = 1.0 / (h * w) as f32;
    Ok(summed.mapv(|v| v * scale).into_shape((n, c, 1, 1))?)
}

pub fn global_avg_pool_backward(grad_out: &Tensor, in_h: usize, in_w: usize) -> Tensor {
    let (n, c, _, _) = grad_out.dim();
    let scale = 1.0 / (in_h * in_w) as f32;
    Tensor::from_shape_fn((n, c, in_h, in_w), |(b, ch, _, _)| grad_out[[b, ch, 0, 0]] * scale)
}

// =============================================================================
// Activations
// =============================================================================

/// ReLU(x) = max(0, x). NaN passes through.
pub fn relu(input: &Tensor) -> Tensor {
    input.mapv(|v| if v < 0.0 { 0.0 } else { v })
}

pub fn relu_backward(input: &Tensor, grad_out: &Tensor) -> Tensor {
    let mut grad_in = grad_out.clone();
    Zip::from(&mut grad_in).and(input).for_each(|g, &x| {
        if x <= 0.0 {
            *g = 0.0;
        }
    });
    grad_in
}

// =============================================================================
// Batch normalisation
// =============================================================================

/// Per-channel statistics and normalised activations of a training pass.
#[derive(Debug, Clone)]
pub struct NormCache {
    pub x_hat: Tensor,
    pub mean: Array1<f32>,
    pub var: Array1<f32>,
    pub inv_std: Array1<f32>,
}

/// Batch norm with batch statistics: `y = gamma * x_hat + beta`.
pub fn batch_norm_train(input: &Tensor, gamma: &Array1<f32>, beta: &Array1<f32>) -> GrowResult<(Tensor, NormCache)> {
    let channels = input.dim().1;
    if gamma.len() != channels || beta.len() != channels {
        return Err(GrowError::DimensionMismatch { expected: channels, actual: gamma.len() });
    }
    let mut mean = Array1::<f32>::zeros(channels);
    let mut var = Array1::<f32>::zeros(channels);
    for c in 0..channels {
        let xc = input.index_axis(Axis(1), c);
        let m = xc.mean().unwrap_or(0.0);
        mean[c] = m;
        var[c] = xc.mapv(|v| (v - m) * (v - m)).mean().unwrap_or(0.0);
    }
    let inv_std = var.mapv(|v| 1.0 / (v + BN_EPSILON).sqrt());

    let mut x_hat = input.clone();
    let mut output = input.clone();
    for c in 0..channels {
        let (m, s) = (mean[c], inv_std[c]);
        let (g, b) = (gamma[c], beta[c]);
        x_hat.index_axis_mut(Axis(1), c).mapv_inplace(|v| (v - m) * s);
        output.index_axis_mut(Axis(1), c).mapv_inplace(|v| (v - m) * s * g + b);
    }
    Ok((output, NormCache { x_hat, mean, var, inv_std }))
}

/// Batch norm with stored running statistics (evaluation).
pub fn batch_norm_infer(
    input: &Tensor,
    gamma: &Array1<f32>,
    beta: &Array1<f32>,
    mean: &Array1<f32>,
    var: &Array1<f32>,
) -> GrowResult<Tensor> {
    let channels = input.dim().1;
    for len in [gamma.len(), beta.len(), mean.len(), var.len()] {
        if len != channels {
            return Err(GrowError::DimensionMismatch { expected: channels, actual: len });
        }
    }
    let mut output = input.clone();
    for c in 0..channels {
        let scale = gamma[c] / (var[c] + BN_EPSILON).sqrt();
        let shift = beta[c] - mean[c] * scale;
        output.index_axis_mut(Axis(1), c).mapv_inplace(|v| v * scale + shift);
    }
    Ok(output)
}

/// Gradients of [`batch_norm_train`]: `(d_input, d_gamma, d_beta)`.
pub fn batch_norm_backward(
    grad_out: &Tensor,
    cache: &NormCache,
    gamma: &Array1<f32>,
) -> (Tensor, Array1<f32>, Array1<f32>) {
    let channels = grad_out.dim().1;
    let (n, _, h, w) = grad_out.dim();
    let count = (n * h * w).max(1) as f32;
    let mut d_input = grad_out.clone();
    let mut d_gamma = Array1::<f32>::zeros(channels);
    let mut d_beta = Array1::<f32>::zeros(channels);

    for c in 0..channels {
        let dy = grad_out.index_axis(Axis(1), c);
        let x_hat = cache.x_hat.index_axis(Axis(1), c);
        let sum_dy = dy.sum();
        let sum_dy_xhat = (&dy * &x_hat).sum();
        d_beta[c] = sum_dy;
        d_gamma[c] = sum_dy_xhat;

        let k = gamma[c] * cache.inv_std[c] / count;
        let mut dx = d_input.index_axis_mut(Axis(1), c);
        Zip::from(&mut dx).and(&dy).and(&x_hat).for_each(|d, &g, &xh| {
            *d = k * (count * g - sum_dy - xh * sum_dy_xhat);
        });
    }
    (d_input, d_gamma, d_beta)
}

// =============================================================================
// Loss
// =============================================================================

/// Softmax cross-entropy averaged over the batch.
///
/// Returns `(loss, d_logits, accuracy)`; `d_logits` already carries the
/// `1 / N` factor.
pub fn softmax_cross_entropy(logits: &Array2<f32>, labels: &Array2<f32>) -> GrowResult<(f32, Array2<f32>, f32)> {
    if logits.dim() != labels.dim() {
        let (ln, lk) = logits.dim();
        let (yn, yk) = labels.dim();
        return Err(GrowError::shape("softmax_cross_entropy", &[yn, yk], &[ln, lk]));
    }
    let (n, _) = logits.dim();
    if n == 0 {
        return Err(GrowError::EmptyBatch);
    }
    let mut grad = Array2::<f32>::zeros(logits.dim());
    let mut loss = 0.0f64;
    let mut correct = 0usize;
    for (i, row) in logits.outer_iter().enumerate() {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let exp = row.mapv(|v| (v - max).exp());
        let sum = exp.sum();
        let label = labels.row(i);
        for (j, &e) in exp.iter().enumerate() {
            let p = e / sum;
            grad[[i, j]] = (p - label[j]) / n as f32;
            if label[j] > 0.0 {
                loss -= (label[j] * p.clamp(f32::MIN_POSITIVE, 1.0).ln()) as f64;
            }
        }
        if argmax(row.iter().copied()) == argmax(label.iter().copied()) {
            correct += 1;
        }
    }
    Ok(((loss / n as f64) as f32, grad, correct as f32 / n as f32))
}

/// Index of the first maximum value; 0 for an empty iterator.
pub fn argmax(values: impl IntoIterator<Item = f32>) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, v) in values.into_iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}
