//! General-purpose integration tests for the densegrow building blocks.
//!
//! Tests shapes, the node arena, the parameter store, tensor helpers, the
//! math primitives (with finite-difference gradient checks) and the layer
//! zoo.

use densegrow_core::layers::{ConcatLayer, DropoutLayer, KernelConv, Pass, ReLULayer};
use densegrow_core::math;
use densegrow_core::params::{Gradients, Init, ParamKind};
use densegrow_core::tensor;
use densegrow_core::*;
use ndarray::{Array1, Array2, Array4, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_tensor(rng: &mut StdRng, shape: (usize, usize, usize, usize)) -> Tensor {
    Array4::from_shape_fn(shape, |_| rng.gen_range(-1.0f32..1.0))
}

fn assert_close(a: f32, b: f32, tol: f32) {
    assert!((a - b).abs() <= tol, "{a} vs {b} (tol {tol})");
}

// =============================================================================
// Shape Tests
// =============================================================================

#[test]
fn test_shape_creation_and_total() {
    let s = Shape::d3(3, 32, 32);
    assert_eq!(s.total(), 3072);
    assert_eq!(s.dims(), [3, 32, 32]);

    let v = Shape::vector(10);
    assert_eq!(v.total(), 10);
    assert_eq!((v.height, v.width), (1, 1));

    let wider = s.with_channels(24);
    assert_eq!(wider.dims(), [24, 32, 32]);
}

// =============================================================================
// Arena Tests (with checkpoints)
// =============================================================================

#[test]
fn test_arena_push_and_get() {
    let mut arena = Arena::new();
    let a = arena.push("a");
    let b = arena.push("b");
    assert_eq!(a, NodeId(0));
    assert_eq!(b.index(), 1);
    assert_eq!(*arena.get(b).unwrap(), "b");
    assert_eq!(arena.len(), 2);
}

#[test]
fn test_arena_checkpoint_restore() {
    let mut arena = Arena::new();
    let keep = arena.push(1);
    let cp = arena.save_checkpoint();
    arena.push(2);
    arena.push(3);
    assert_eq!(arena.len(), 3);

    arena.restore_checkpoint(cp);
    assert_eq!(arena.len(), 1);
    assert_eq!(*arena.get(keep).unwrap(), 1);
}

#[test]
fn test_arena_unknown_node_returns_error() {
    let arena: Arena<u8> = Arena::new();
    assert!(matches!(arena.get(NodeId(4)), Err(GrowError::UnknownNode(4))));
}

// =============================================================================
// Parameter Store Tests
// =============================================================================

#[test]
fn test_param_store_incremental_initialization() {
    let mut store = ParamStore::new();
    let mut rng = StdRng::seed_from_u64(7);
    let w = store.create("w", &[2, 3, 3], ParamKind::Kernel, Init::Msra { fan_in: 18 }).unwrap();
    assert!(matches!(store.value(w), Err(GrowError::Uninitialized(_))));
    assert_eq!(store.uninitialized(), vec![w]);

    assert_eq!(store.initialize_uninitialized(&mut rng), 1);
    let before = store.value(w).unwrap().clone();

    let g = store.create("g", &[4], ParamKind::Norm, Init::Ones).unwrap();
    assert_eq!(store.uninitialized(), vec![g]);
    assert_eq!(store.initialize_uninitialized(&mut rng), 1);

    assert_eq!(store.value(w).unwrap(), &before);
    assert_eq!(store.vector(g).unwrap(), Array1::<f32>::ones(4));
    assert!(store.uninitialized().is_empty());
}

#[test]
fn test_param_store_values_init_checks_shape() {
    let mut store = ParamStore::new();
    let bad = ArrayD::<f32>::zeros(IxDyn(&[3]));
    let result = store.create("v", &[4], ParamKind::Norm, Init::Values(bad));
    assert!(matches!(result, Err(GrowError::ShapeMismatch { .. })));
}

#[test]
fn test_param_store_rollback_forgets_names() {
    let mut store = ParamStore::new();
    let a = store.create("a", &[1], ParamKind::Dense, Init::Zeros).unwrap();
    let mark = store.len();
    store.create("b", &[1], ParamKind::Dense, Init::Zeros).unwrap();
    assert!(store.find("b").is_some());

    store.rollback(mark);
    assert_eq!(store.len(), 1);
    assert_eq!(store.find("a"), Some(a));
    assert!(store.find("b").is_none());
}

#[test]
fn test_statistics_are_not_trainable() {
    assert!(ParamKind::Kernel.is_trainable());
    assert!(ParamKind::Norm.is_trainable());
    assert!(ParamKind::Dense.is_trainable());
    assert!(!ParamKind::Statistic.is_trainable());
}

#[test]
fn test_gradients_accumulate() {
    let mut grads = Gradients::new();
    let id = ParamId(0);
    grads.accumulate(id, ArrayD::from_elem(IxDyn(&[2]), 1.0));
    grads.accumulate(id, ArrayD::from_elem(IxDyn(&[2]), 2.5));
    assert_eq!(grads.len(), 1);
    assert_eq!(grads.get(id).unwrap().as_slice().unwrap(), &[3.5, 3.5]);
}

// =============================================================================
// Tensor Helper Tests
// =============================================================================

#[test]
fn test_concat_then_split_channels() {
    let mut rng = StdRng::seed_from_u64(1);
    let a = random_tensor(&mut rng, (2, 3, 4, 4));
    let b = random_tensor(&mut rng, (2, 5, 4, 4));
    let joined = tensor::concat_channels(&a, &b).unwrap();
    assert_eq!(joined.dim(), (2, 8, 4, 4));

    let (head, tail) = tensor::split_channels(&joined, 3).unwrap();
    assert_eq!(head, a);
    assert_eq!(tail, b);
}

#[test]
fn test_concat_rejects_spatial_mismatch() {
    let a = Tensor::zeros((1, 2, 4, 4));
    let b = Tensor::zeros((1, 2, 2, 2));
    assert!(tensor::concat_channels(&a, &b).is_err());
}

#[test]
fn test_stack_kernels_validates_shape() {
    let good = ArrayD::<f32>::ones(IxDyn(&[2, 3, 3]));
    let bad = ArrayD::<f32>::ones(IxDyn(&[3, 3, 3]));
    let filter = tensor::stack_kernels(&[&good, &good], 2, 3).unwrap();
    assert_eq!(filter.dim(), (2, 2, 3, 3));
    assert!(tensor::stack_kernels(&[&good, &bad], 2, 3).is_err());
}

#[test]
fn test_mean_abs_and_mean_std() {
    assert_close(tensor::mean_abs(&[1.0, -3.0, 2.0, -2.0]), 2.0, 1e-6);
    assert_eq!(tensor::mean_abs(&[] as &[f32]), 0.0);

    let (mean, std) = tensor::mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
    assert_close(mean, 5.0, 1e-6);
    assert_close(std, 2.0, 1e-6);
}

// =============================================================================
// Convolution Tests
// =============================================================================

#[test]
fn test_conv2d_output_size() {
    assert_eq!(math::same_padding(3), 1);
    assert_eq!(math::same_padding(1), 0);
    assert_eq!(math::conv2d_output_size(32, 32, 3, 1), (32, 32));
    assert_eq!(math::conv2d_output_size(8, 6, 1, 0), (8, 6));
    assert_eq!(math::conv2d_output_size(5, 5, 3, 0), (3, 3));
}

#[test]
fn test_conv2d_identity_kernel() {
    let mut rng = StdRng::seed_from_u64(3);
    let input = random_tensor(&mut rng, (2, 2, 5, 5));
    // 1×1 filter that swaps the two channels.
    let mut filter = Array4::<f32>::zeros((2, 2, 1, 1));
    filter[[0, 1, 0, 0]] = 1.0;
    filter[[1, 0, 0, 0]] = 1.0;
    let output = math::conv2d(&input, &filter, 0).unwrap();
    assert_eq!(output.dim(), (2, 2, 5, 5));
    for n in 0..2 {
        for y in 0..5 {
            for x in 0..5 {
                assert_eq!(output[[n, 0, y, x]], input[[n, 1, y, x]]);
                assert_eq!(output[[n, 1, y, x]], input[[n, 0, y, x]]);
            }
        }
    }
}

#[test]
fn test_conv2d_channel_mismatch() {
    let input = Tensor::zeros((1, 3, 4, 4));
    let filter = Array4::<f32>::zeros((2, 2, 3, 3));
    assert!(matches!(
        math::conv2d(&input, &filter, 1),
        Err(GrowError::DimensionMismatch { expected: 2, actual: 3 })
    ));
}

#[test]
fn test_conv2d_backward_matches_finite_differences() {
    let mut rng = StdRng::seed_from_u64(11);
    let input = random_tensor(&mut rng, (2, 2, 4, 4));
    let filter = random_tensor(&mut rng, (3, 2, 3, 3));
    let probe = random_tensor(&mut rng, (2, 3, 4, 4));
    let loss = |x: &Tensor, f: &Array4<f32>| (math::conv2d(x, f, 1).unwrap() * &probe).sum();

    let (d_input, d_filter) = math::conv2d_backward(&input, &filter, &probe, 1).unwrap();
    let eps = 1e-2;
    for idx in [[0, 0, 0, 0], [1, 1, 2, 1], [2, 0, 1, 2]] {
        let (mut plus, mut minus) = (filter.clone(), filter.clone());
        plus[idx] += eps;
        minus[idx] -= eps;
        let numeric = (loss(&input, &plus) - loss(&input, &minus)) / (2.0 * eps);
        assert_close(d_filter[idx], numeric, 1e-2);
    }
    for idx in [[0, 0, 0, 0], [1, 1, 3, 2], [0, 1, 2, 2]] {
        let (mut plus, mut minus) = (input.clone(), input.clone());
        plus[idx] += eps;
        minus[idx] -= eps;
        let numeric = (loss(&plus, &filter) - loss(&minus, &filter)) / (2.0 * eps);
        assert_close(d_input[idx], numeric, 1e-2);
    }
}

// =============================================================================
// Pooling / Activation Tests
// =============================================================================

#[test]
fn test_avg_pool_and_backward() {
    let input = Array4::from_shape_fn((1, 1, 4, 4), |(_, _, y, x)| (y * 4 + x) as f32);
    let pooled = math::avg_pool(&input, 2).unwrap();
    assert_eq!(pooled.dim(), (1, 1, 2, 2));
    assert_close(pooled[[0, 0, 0, 0]], 2.5, 1e-6);
    assert_close(pooled[[0, 0, 1, 1]], 12.5, 1e-6);

    let grad = math::avg_pool_backward(&Tensor::ones((1, 1, 2, 2)), 2, 4, 4);
    assert_eq!(grad.dim(), (1, 1, 4, 4));
    assert!(grad.iter().all(|&g| (g - 0.25).abs() < 1e-6));
}

#[test]
fn test_global_avg_pool() {
    let input = Array4::from_shape_fn((2, 3, 2, 2), |(n, c, _, _)| (n * 10 + c) as f32);
    let pooled = math::global_avg_pool(&input).unwrap();
    assert_eq!(pooled.dim(), (2, 3, 1, 1));
    assert_close(pooled[[1, 2, 0, 0]], 12.0, 1e-6);

    let grad = math::global_avg_pool_backward(&Tensor::ones((2, 3, 1, 1)), 2, 2);
    assert_eq!(grad.dim(), (2, 3, 2, 2));
    assert!(grad.iter().all(|&g| (g - 0.25).abs() < 1e-6));
}

#[test]
fn test_relu_and_backward() {
    let input = Array4::from_shape_vec((1, 1, 1, 4), vec![-1.0, 0.0, 0.5, 2.0]).unwrap();
    let out = math::relu(&input);
    assert_eq!(out.as_slice().unwrap(), &[0.0, 0.0, 0.5, 2.0]);
    let grad = math::relu_backward(&input, &Tensor::ones((1, 1, 1, 4)));
    assert_eq!(grad.as_slice().unwrap(), &[0.0, 0.0, 1.0, 1.0]);
}

// =============================================================================
// Batch Norm Tests
// =============================================================================

#[test]
fn test_batch_norm_train_normalises() {
    let mut rng = StdRng::seed_from_u64(5);
    let input = random_tensor(&mut rng, (4, 2, 3, 3)) * 3.0 + 1.0;
    let gamma = Array1::ones(2);
    let beta = Array1::zeros(2);
    let (out, cache) = math::batch_norm_train(&input, &gamma, &beta).unwrap();
    for c in 0..2 {
        let channel = out.index_axis(ndarray::Axis(1), c);
        assert_close(channel.mean().unwrap(), 0.0, 1e-4);
        assert_close(channel.std(0.0), 1.0, 1e-2);
    }
    assert_eq!(cache.mean.len(), 2);
}

#[test]
fn test_batch_norm_infer_uses_running_stats() {
    let input = Tensor::from_elem((1, 1, 2, 2), 3.0);
    let out = math::batch_norm_infer(
        &input,
        &Array1::from_elem(1, 2.0),
        &Array1::from_elem(1, 0.5),
        &Array1::from_elem(1, 1.0),
        &Array1::from_elem(1, 4.0 - math::BN_EPSILON),
    )
    .unwrap();
    // 2 * (3 - 1) / 2 + 0.5
    assert!(out.iter().all(|&v| (v - 2.5).abs() < 1e-5));
}

#[test]
fn test_batch_norm_backward_matches_finite_differences() {
    let mut rng = StdRng::seed_from_u64(13);
    let input = random_tensor(&mut rng, (3, 2, 2, 2));
    let gamma = Array1::from_vec(vec![1.5, 0.7]);
    let beta = Array1::from_vec(vec![0.1, -0.2]);
    let probe = random_tensor(&mut rng, (3, 2, 2, 2));
    let loss = |x: &Tensor, g: &Array1<f32>| (math::batch_norm_train(x, g, &beta).unwrap().0 * &probe).sum();

    let (_, cache) = math::batch_norm_train(&input, &gamma, &beta).unwrap();
    let (d_input, d_gamma, d_beta) = math::batch_norm_backward(&probe, &cache, &gamma);

    let eps = 1e-2;
    for idx in [[0, 0, 0, 0], [2, 1, 1, 0], [1, 1, 0, 1]] {
        let (mut plus, mut minus) = (input.clone(), input.clone());
        plus[idx] += eps;
        minus[idx] -= eps;
        let numeric = (loss(&plus, &gamma) - loss(&minus, &gamma)) / (2.0 * eps);
        assert_close(d_input[idx], numeric, 3e-2);
    }
    for c in 0..2 {
        let (mut plus, mut minus) = (gamma.clone(), gamma.clone());
        plus[c] += eps;
        minus[c] -= eps;
        let numeric = (loss(&input, &plus) - loss(&input, &minus)) / (2.0 * eps);
        assert_close(d_gamma[c], numeric, 1e-2);
        let probe_sum: f32 = probe.index_axis(ndarray::Axis(1), c).sum();
        assert_close(d_beta[c], probe_sum, 1e-4);
    }
}

// =============================================================================
// Loss Tests
// =============================================================================

#[test]
fn test_softmax_cross_entropy_uniform_logits() {
    let logits = Array2::<f32>::zeros((2, 4));
    let mut labels = Array2::<f32>::zeros((2, 4));
    labels[[0, 1]] = 1.0;
    labels[[1, 3]] = 1.0;
    let (loss, grad, _) = math::softmax_cross_entropy(&logits, &labels).unwrap();
    assert_close(loss, 4.0f32.ln(), 1e-5);
    // (p - y) / N
    assert_close(grad[[0, 1]], (0.25 - 1.0) / 2.0, 1e-6);
    assert_close(grad[[0, 0]], 0.25 / 2.0, 1e-6);
}

#[test]
fn test_softmax_cross_entropy_accuracy() {
    let logits = Array2::from_shape_vec((2, 3), vec![5.0, 0.0, 0.0, 0.0, 0.0, 5.0]).unwrap();
    let labels = Array2::from_shape_vec((2, 3), vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]).unwrap();
    let (_, _, acc) = math::softmax_cross_entropy(&logits, &labels).unwrap();
    assert_close(acc, 0.5, 1e-6);
}

#[test]
fn test_softmax_cross_entropy_shape_and_empty_checks() {
    let logits = Array2::<f32>::zeros((2, 3));
    let labels = Array2::<f32>::zeros((2, 4));
    assert!(matches!(
        math::softmax_cross_entropy(&logits, &labels),
        Err(GrowError::ShapeMismatch { .. })
    ));
    let empty = Array2::<f32>::zeros((0, 3));
    assert!(matches!(math::softmax_cross_entropy(&empty, &empty), Err(GrowError::EmptyBatch)));
}

#[test]
fn test_argmax() {
    assert_eq!(math::argmax([0.1, 0.7, 0.2]), 1);
    assert_eq!(math::argmax([3.0, 3.0]), 0);
    assert_eq!(math::argmax(std::iter::empty::<f32>()), 0);
}

// =============================================================================
// Layer Zoo Tests
// =============================================================================

#[test]
fn test_kernel_conv_shape_propagation() {
    let conv = KernelConv::new(vec![ParamId(0), ParamId(1), ParamId(2)], 4, 3);
    let out = conv.output_shape(&[Shape::d3(4, 8, 8)]).unwrap();
    assert_eq!(out.dims(), [3, 8, 8]);
    assert!(conv.output_shape(&[Shape::d3(5, 8, 8)]).is_err());
    assert!(conv.output_shape(&[Shape::d3(4, 8, 8), Shape::d3(4, 8, 8)]).is_err());
}

#[test]
fn test_kernel_conv_forward_backward_per_kernel() {
    let mut store = ParamStore::new();
    let mut rng = StdRng::seed_from_u64(17);
    let ids: Vec<ParamId> = (0..2)
        .map(|o| {
            store
                .create(format!("k{o}"), &[3, 3, 3], ParamKind::Kernel, Init::Msra { fan_in: 27 })
                .unwrap()
        })
        .collect();
    store.initialize_uninitialized(&mut rng);
    let conv = KernelConv::new(ids.clone(), 3, 3);
    let input = random_tensor(&mut rng, (2, 3, 5, 5));

    let mut pass_rng = StdRng::seed_from_u64(0);
    let mut pass = Pass::new(true, &mut pass_rng);
    let (out, cache) = conv.forward(&[&input], &store, &mut pass).unwrap();
    assert_eq!(out.dim(), (2, 2, 5, 5));

    let mut grads = Gradients::new();
    let d_inputs = conv.backward(&[&input], &cache, &Tensor::ones(out.raw_dim()), &store, &mut grads).unwrap();
    assert_eq!(d_inputs.len(), 1);
    assert_eq!(d_inputs[0].dim(), input.dim());
    for id in ids {
        assert_eq!(grads.get(id).unwrap().shape(), &[3, 3, 3]);
    }
}

#[test]
fn test_concat_layer_routes_gradients() {
    let store = ParamStore::new();
    let a = Tensor::ones((1, 2, 3, 3));
    let b = Tensor::zeros((1, 1, 3, 3));
    let mut rng = StdRng::seed_from_u64(0);
    let mut pass = Pass::new(false, &mut rng);
    let (out, cache) = ConcatLayer.forward(&[&a, &b], &store, &mut pass).unwrap();
    assert_eq!(out.dim(), (1, 3, 3, 3));

    let grad = Array4::from_shape_fn((1, 3, 3, 3), |(_, c, _, _)| c as f32);
    let mut grads = Gradients::new();
    let d = ConcatLayer.backward(&[&a, &b], &cache, &grad, &store, &mut grads).unwrap();
    assert_eq!(d[0].dim(), (1, 2, 3, 3));
    assert_eq!(d[1].dim(), (1, 1, 3, 3));
    assert!(d[1].iter().all(|&v| v == 2.0));
    assert!(grads.is_empty());
}

#[test]
fn test_dropout_is_identity_in_eval_and_scales_in_training() {
    let store = ParamStore::new();
    let input = Tensor::ones((2, 4, 4, 4));
    let dropout = DropoutLayer { keep_prob: 0.5 };
    let mut rng = StdRng::seed_from_u64(21);

    let mut eval = Pass::new(false, &mut rng);
    let (out, _) = dropout.forward(&[&input], &store, &mut eval).unwrap();
    assert_eq!(out, input);

    let mut train = Pass::new(true, &mut rng);
    let (out, _) = dropout.forward(&[&input], &store, &mut train).unwrap();
    assert!(out.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
    assert!(out.iter().any(|&v| v == 0.0));
}

#[test]
fn test_relu_layer() {
    let store = ParamStore::new();
    let input = Array4::from_shape_vec((1, 2, 1, 1), vec![-2.0, 3.0]).unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    let mut pass = Pass::new(false, &mut rng);
    let (out, _) = ReLULayer.forward(&[&input], &store, &mut pass).unwrap();
    assert_eq!(out.as_slice().unwrap(), &[0.0, 3.0]);
    assert_eq!(ReLULayer.name(), "ReLU");
}
