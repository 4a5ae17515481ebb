//! The growable DenseNet graph.
//!
//! ```text
//! images → initial conv → Block 0 → transition → … → Block B-1 → head → logits
//! ```
//!
//! Every operation is a [`Node`] record in an append-only [`Arena`]. Growing
//! the network never edits a node: mutations push new nodes, then relink the
//! network by moving the logits handle. Whatever is no longer reachable from
//! the logits (a replaced layer output, a superseded head) is dead and its
//! variables stop being *useful*.
//!
//! Inside a block each layer consumes the running concatenation of all prior
//! outputs and emits `input ++ H_l(input)`, so a layer's output width is
//! always its input width plus the number of kernels in its composite
//! convolution.

use std::fmt;

use ndarray::{s, Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::arena::{Arena, NodeId};
use crate::error::{GrowError, GrowResult};
use crate::layers::{
    AvgPoolLayer, BatchNorm, Cache, ClassifierLayer, ConcatLayer, DropoutLayer, GlobalPoolLayer, KernelConv,
    Layer, Pass, ReLULayer, Shape,
};
use crate::math;
use crate::optim::Momentum;
use crate::params::{Gradients, Init, ParamId, ParamKind, ParamStore};
use crate::tensor::{Labels, Tensor};

// =============================================================================
// Architecture
// =============================================================================

/// Plain DenseNet, or DenseNet-BC (bottleneck layers plus compression).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModelType {
    #[default]
    #[serde(rename = "DenseNet")]
    DenseNet,
    #[serde(rename = "DenseNet-BC")]
    DenseNetBC,
}

impl ModelType {
    pub fn is_bc(self) -> bool {
        matches!(self, ModelType::DenseNetBC)
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelType::DenseNet => write!(f, "DenseNet"),
            ModelType::DenseNetBC => write!(f, "DenseNet-BC"),
        }
    }
}

/// Everything needed to build the initial graph.
#[derive(Debug, Clone)]
pub struct Architecture {
    pub model_type: ModelType,
    pub growth_rate: usize,
    /// Initial layer count of each block.
    pub layer_num_list: Vec<usize>,
    /// Compression at transitions; only applied in BC mode.
    pub reduction: f32,
    pub keep_prob: f32,
    pub bn_decay: f32,
    pub weight_decay: f32,
    pub momentum: f32,
    pub data_shape: Shape,
    pub n_classes: usize,
    pub seed: u64,
}

impl Architecture {
    /// Feature maps produced by the initial convolution.
    pub fn first_output_features(&self) -> usize {
        self.growth_rate * 2
    }

    fn transition_reduction(&self) -> f32 {
        if self.model_type.is_bc() {
            self.reduction
        } else {
            1.0
        }
    }

    fn validate(&self) -> GrowResult<()> {
        let fail = |msg: String| Err(GrowError::InvalidConfig(msg));
        if self.growth_rate == 0 {
            return fail("growth_rate must be positive".into());
        }
        if self.layer_num_list.is_empty() || self.layer_num_list.contains(&0) {
            return fail(format!("every block needs at least one layer, got {:?}", self.layer_num_list));
        }
        if self.n_classes == 0 || self.data_shape.total() == 0 {
            return fail("data shape and class count must be non-empty".into());
        }
        if !(self.keep_prob > 0.0 && self.keep_prob <= 1.0) {
            return fail(format!("keep_prob must be in (0, 1], got {}", self.keep_prob));
        }
        if !(self.reduction > 0.0 && self.reduction <= 1.0) {
            return fail(format!("reduction must be in (0, 1], got {}", self.reduction));
        }
        Ok(())
    }
}

// =============================================================================
// Graph records
// =============================================================================

pub enum NodeOp {
    Input,
    Layer(Box<dyn Layer>),
}

pub struct Node {
    pub op: NodeOp,
    pub inputs: Vec<NodeId>,
    pub shape: Shape,
}

/// A convolution whose kernels can be appended to.
///
/// `conv_input` is the cached (post BN/ReLU) tensor the convolution reads, so
/// the convolution can be rebuilt over a longer kernel list without touching
/// anything upstream.
#[derive(Debug, Clone)]
pub struct ConvUnit {
    pub kernels: Vec<ParamId>,
    pub in_channels: usize,
    pub kernel_size: usize,
    pub conv_input: NodeId,
}

impl ConvUnit {
    pub fn out_channels(&self) -> usize {
        self.kernels.len()
    }
}

#[derive(Debug, Clone)]
pub struct LayerRecord {
    pub index: usize,
    /// 1×1 bottleneck, DenseNet-BC only.
    pub bottleneck: Option<ConvUnit>,
    pub composite: ConvUnit,
    /// Running block concatenation this layer consumes.
    pub input: NodeId,
    /// `input ++ composite output`.
    pub output: NodeId,
}

impl LayerRecord {
    /// New feature maps this layer adds to the block.
    pub fn width(&self) -> usize {
        self.composite.out_channels()
    }

    /// The unit whose kernels read the block concatenation.
    pub fn source_unit(&self) -> &ConvUnit {
        self.bottleneck.as_ref().unwrap_or(&self.composite)
    }
}

#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub index: usize,
    pub input: NodeId,
    pub input_channels: usize,
    pub layers: Vec<LayerRecord>,
    /// Compression after this block; `None` while it is the last block.
    pub transition: Option<ConvUnit>,
}

impl BlockRecord {
    /// Widths of every source feeding the block concatenation: the block
    /// input first, then one entry per layer.
    pub fn source_widths(&self) -> Vec<usize> {
        std::iter::once(self.input_channels)
            .chain(self.layers.iter().map(LayerRecord::width))
            .collect()
    }
}

/// Classifier head: BN → ReLU → global pool → fully connected.
#[derive(Debug, Clone)]
pub struct HeadRecord {
    pub block: usize,
    pub width: usize,
    pub norm: BatchNorm,
    pub classifier: ClassifierLayer,
    pub logits: NodeId,
}

/// Where the next growth step attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildCursor {
    pub block: usize,
    /// Index of the last layer in `block`.
    pub layer: usize,
    /// Input of the last layer (block concatenation before it).
    pub layer_input: NodeId,
    /// Input of the last layer's composite convolution.
    pub conv_input: NodeId,
    /// Output of the last layer.
    pub output: NodeId,
}

/// Variables created by one mutation.
#[derive(Debug, Clone, Default)]
pub struct MutationReport {
    pub new_params: Vec<ParamId>,
    pub new_kernels: Vec<ParamId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParamCount {
    pub total: usize,
    pub useful_conv: usize,
    pub useful_fc: usize,
}

impl ParamCount {
    pub fn useful(&self) -> usize {
        self.useful_conv + self.useful_fc
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchStats {
    pub loss: f32,
    pub accuracy: f32,
}

// =============================================================================
// Graph
// =============================================================================

/// Values and caches of one forward pass, indexed by node.
pub struct Tape {
    values: Vec<Option<Tensor>>,
    caches: Vec<Cache>,
}

impl Tape {
    pub fn value(&self, id: NodeId) -> GrowResult<&Tensor> {
        self.values
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(GrowError::MissingValue(id.index()))
    }
}

struct Graph {
    nodes: Arena<Node>,
    input: NodeId,
    output: NodeId,
    /// Live nodes in ascending (topological) order.
    order: Vec<NodeId>,
}

impl Graph {
    fn new(data_shape: Shape) -> Self {
        let mut nodes = Arena::new();
        let input = nodes.push(Node { op: NodeOp::Input, inputs: Vec::new(), shape: data_shape });
        Self { nodes, input, output: input, order: vec![input] }
    }

    fn push(&mut self, layer: impl Layer + 'static, inputs: &[NodeId]) -> GrowResult<NodeId> {
        let shapes = inputs
            .iter()
            .map(|&id| self.shape(id))
            .collect::<GrowResult<Vec<_>>>()?;
        let shape = layer.output_shape(&shapes)?;
        Ok(self.nodes.push(Node { op: NodeOp::Layer(Box::new(layer)), inputs: inputs.to_vec(), shape }))
    }

    fn shape(&self, id: NodeId) -> GrowResult<Shape> {
        Ok(self.nodes.get(id)?.shape)
    }

    /// Point the graph at a new output and recompute the live set.
    fn relink(&mut self, output: NodeId) -> GrowResult<()> {
        let mut live = vec![false; self.nodes.len()];
        let mut stack = vec![output];
        while let Some(id) = stack.pop() {
            if live.get(id.index()).copied().unwrap_or(true) {
                continue;
            }
            live[id.index()] = true;
            stack.extend(self.nodes.get(id)?.inputs.iter().copied());
        }
        self.output = output;
        self.order = live
            .iter()
            .enumerate()
            .filter(|(_, &l)| l)
            .map(|(i, _)| NodeId(i))
            .collect();
        Ok(())
    }

    /// Variables read by live nodes, deduplicated and sorted.
    fn live_params(&self) -> GrowResult<Vec<ParamId>> {
        let mut ids = Vec::new();
        for &id in &self.order {
            if let NodeOp::Layer(layer) = &self.nodes.get(id)?.op {
                ids.extend(layer.params());
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn forward(&self, params: &ParamStore, images: &Tensor, pass: &mut Pass<'_>) -> GrowResult<Tape> {
        let n = self.nodes.len();
        let mut values: Vec<Option<Tensor>> = vec![None; n];
        let mut caches = vec![Cache::None; n];
        for &id in &self.order {
            let node = self.nodes.get(id)?;
            let (value, cache) = match &node.op {
                NodeOp::Input => {
                    let (_, c, h, w) = images.dim();
                    if [c, h, w] != node.shape.dims() {
                        return Err(GrowError::shape("input", &node.shape.dims(), &[c, h, w]));
                    }
                    (images.clone(), Cache::None)
                }
                NodeOp::Layer(layer) => {
                    let inputs = gather(&values, &node.inputs)?;
                    layer.forward(&inputs, params, pass)?
                }
            };
            values[id.index()] = Some(value);
            caches[id.index()] = cache;
        }
        Ok(Tape { values, caches })
    }

    fn backward(&self, tape: &Tape, grad_out: Tensor, params: &ParamStore) -> GrowResult<Gradients> {
        let mut node_grads: Vec<Option<Tensor>> = vec![None; self.nodes.len()];
        node_grads[self.output.index()] = Some(grad_out);
        let mut grads = Gradients::new();

        for &id in self.order.iter().rev() {
            let Some(grad) = node_grads[id.index()].take() else {
                continue;
            };
            let node = self.nodes.get(id)?;
            let NodeOp::Layer(layer) = &node.op else {
                continue;
            };
            let inputs = gather(&tape.values, &node.inputs)?;
            let d_inputs = layer.backward(&inputs, &tape.caches[id.index()], &grad, params, &mut grads)?;
            for (src, d) in node.inputs.iter().zip(d_inputs) {
                let slot = &mut node_grads[src.index()];
                if let Some(acc) = slot.as_mut() {
                    *acc += &d;
                } else {
                    *slot = Some(d);
                }
            }
        }
        Ok(grads)
    }
}

fn gather<'t>(values: &'t [Option<Tensor>], ids: &[NodeId]) -> GrowResult<Vec<&'t Tensor>> {
    ids.iter()
        .map(|&i| {
            values
                .get(i.index())
                .and_then(Option::as_ref)
                .ok_or(GrowError::MissingValue(i.index()))
        })
        .collect()
}

// =============================================================================
// Builder
// =============================================================================

/// Initial values of a batch-norm's four vectors.
struct NormInit {
    gamma: Init,
    beta: Init,
    mean: Init,
    var: Init,
}

impl Default for NormInit {
    fn default() -> Self {
        Self { gamma: Init::Ones, beta: Init::Zeros, mean: Init::Zeros, var: Init::Ones }
    }
}

/// Pushes nodes and declares variables. Owns no state of its own; every
/// method takes its attachment point explicitly.
struct Builder<'n> {
    arch: &'n Architecture,
    graph: &'n mut Graph,
    params: &'n mut ParamStore,
}

impl Builder<'_> {
    fn kernels(&mut self, scope: &str, first: usize, count: usize, in_channels: usize, size: usize) -> GrowResult<Vec<ParamId>> {
        (first..first + count)
            .map(|o| {
                self.params.create(
                    format!("{scope}/kernel{o}"),
                    &[in_channels, size, size],
                    ParamKind::Kernel,
                    Init::Msra { fan_in: size * size * in_channels },
                )
            })
            .collect()
    }

    fn norm(&mut self, scope: &str, input: NodeId, init: NormInit) -> GrowResult<(BatchNorm, NodeId)> {
        let channels = self.graph.shape(input)?.channels;
        let shape = [channels];
        let norm = BatchNorm {
            gamma: self.params.create(format!("{scope}/gamma"), &shape, ParamKind::Norm, init.gamma)?,
            beta: self.params.create(format!("{scope}/beta"), &shape, ParamKind::Norm, init.beta)?,
            moving_mean: self.params.create(format!("{scope}/moving_mean"), &shape, ParamKind::Statistic, init.mean)?,
            moving_var: self.params.create(format!("{scope}/moving_variance"), &shape, ParamKind::Statistic, init.var)?,
            channels,
            decay: self.arch.bn_decay,
        };
        let output = self.graph.push(norm.clone(), &[input])?;
        Ok((norm, output))
    }

    /// Convolution (plus dropout) over a unit's cached input.
    fn conv_output(&mut self, unit: &ConvUnit) -> GrowResult<NodeId> {
        let conv = KernelConv::new(unit.kernels.clone(), unit.in_channels, unit.kernel_size);
        let output = self.graph.push(conv, &[unit.conv_input])?;
        if self.arch.keep_prob < 1.0 {
            return self.graph.push(DropoutLayer { keep_prob: self.arch.keep_prob }, &[output]);
        }
        Ok(output)
    }

    /// BN → ReLU → conv → dropout.
    fn composite(&mut self, scope: &str, input: NodeId, out_features: usize, size: usize) -> GrowResult<(ConvUnit, NodeId)> {
        let in_channels = self.graph.shape(input)?.channels;
        let (_, normed) = self.norm(&format!("{scope}/norm"), input, NormInit::default())?;
        let conv_input = self.graph.push(ReLULayer, &[normed])?;
        let kernels = self.kernels(scope, 0, out_features, in_channels, size)?;
        let unit = ConvUnit { kernels, in_channels, kernel_size: size, conv_input };
        let output = self.conv_output(&unit)?;
        Ok((unit, output))
    }

    fn initial_conv(&mut self) -> GrowResult<(ConvUnit, NodeId)> {
        let input = self.graph.input;
        let in_channels = self.graph.shape(input)?.channels;
        let kernels = self.kernels("initial_conv", 0, self.arch.first_output_features(), in_channels, 3)?;
        let unit = ConvUnit { kernels, in_channels, kernel_size: 3, conv_input: input };
        let conv = KernelConv::new(unit.kernels.clone(), in_channels, 3);
        let output = self.graph.push(conv, &[input])?;
        Ok((unit, output))
    }

    /// Layer `layer` of `block`, consuming `input`.
    fn internal_layer(&mut self, block: usize, layer: usize, input: NodeId) -> GrowResult<(LayerRecord, BuildCursor)> {
        let scope = format!("block{block}/layer{layer}");
        let k = self.arch.growth_rate;
        let (bottleneck, composite_input) = if self.arch.model_type.is_bc() {
            let (unit, output) = self.composite(&format!("{scope}/bottleneck"), input, 4 * k, 1)?;
            (Some(unit), output)
        } else {
            (None, input)
        };
        let (composite, composite_output) = self.composite(&format!("{scope}/composite"), composite_input, k, 3)?;
        let output = self.graph.push(ConcatLayer, &[input, composite_output])?;
        let cursor = BuildCursor { block, layer, layer_input: input, conv_input: composite.conv_input, output };
        Ok((LayerRecord { index: layer, bottleneck, composite, input, output }, cursor))
    }

    fn block(&mut self, block: usize, input: NodeId, layers: usize) -> GrowResult<(BlockRecord, BuildCursor)> {
        let input_channels = self.graph.shape(input)?.channels;
        let mut records = Vec::with_capacity(layers);
        let mut output = input;
        let mut cursor = None;
        for layer in 0..layers {
            let (record, next) = self.internal_layer(block, layer, output)?;
            output = next.output;
            records.push(record);
            cursor = Some(next);
        }
        let cursor = cursor.ok_or_else(|| GrowError::InvalidConfig(format!("block {block} has no layers")))?;
        Ok((BlockRecord { index: block, input, input_channels, layers: records, transition: None }, cursor))
    }

    /// 1×1 composite (compressing in BC mode) followed by 2×2 average pooling.
    fn transition(&mut self, block: usize, input: NodeId) -> GrowResult<(ConvUnit, NodeId)> {
        let in_channels = self.graph.shape(input)?.channels;
        let out_features = ((in_channels as f32 * self.arch.transition_reduction()) as usize).max(1);
        let (unit, output) = self.composite(&format!("transition{block}/composite"), input, out_features, 1)?;
        let pooled = self.graph.push(AvgPoolLayer::new(2)?, &[output])?;
        Ok((unit, pooled))
    }

    /// Build the head over `features`. With `previous` (same block, smaller
    /// width) old batch-norm values are copied into the front of the new
    /// vectors and old classifier rows and bias are reused.
    fn head(&mut self, block: usize, features: NodeId, previous: Option<&HeadRecord>) -> GrowResult<HeadRecord> {
        let width = self.graph.shape(features)?.channels;
        let scope = format!("head_block{block}");
        let previous = previous.filter(|old| old.block == block && old.width <= width);

        let init = match previous {
            Some(old) => NormInit {
                gamma: self.extended(old.norm.gamma, width, 1.0)?,
                beta: self.extended(old.norm.beta, width, 0.0)?,
                mean: self.extended(old.norm.moving_mean, width, 0.0)?,
                var: self.extended(old.norm.moving_var, width, 1.0)?,
            },
            None => NormInit::default(),
        };
        let (norm, normed) = self.norm(&format!("{scope}/norm{width}"), features, init)?;
        let activated = self.graph.push(ReLULayer, &[normed])?;
        let pooled = self.graph.push(GlobalPoolLayer, &[activated])?;

        let n_classes = self.arch.n_classes;
        let mut rows = previous.map(|old| old.classifier.rows.clone()).unwrap_or_default();
        for i in rows.len()..width {
            rows.push(self.params.create(
                format!("{scope}/fc/w{i}"),
                &[n_classes],
                ParamKind::Dense,
                Init::Xavier { fan_in: width, fan_out: n_classes },
            )?);
        }
        let bias = match previous {
            Some(old) => old.classifier.bias,
            None => self.params.create(format!("{scope}/fc/bias"), &[n_classes], ParamKind::Dense, Init::Zeros)?,
        };
        let classifier = ClassifierLayer { rows, bias, n_classes };
        let logits = self.graph.push(classifier.clone(), &[pooled])?;
        Ok(HeadRecord { block, width, norm, classifier, logits })
    }

    /// `old` copied into the front of a `width`-long vector filled with `fill`.
    fn extended(&self, old: ParamId, width: usize, fill: f32) -> GrowResult<Init> {
        let old = self.params.vector(old)?;
        if old.len() > width {
            return Err(GrowError::DimensionMismatch { expected: width, actual: old.len() });
        }
        let mut values = Array1::from_elem(width, fill);
        values.slice_mut(s![..old.len()]).assign(&old);
        Ok(Init::Values(values.into_dyn()))
    }
}

// =============================================================================
// Network
// =============================================================================

/// A DenseNet whose last block can grow while it trains.
pub struct Network {
    arch: Architecture,
    graph: Graph,
    params: ParamStore,
    initial: ConvUnit,
    blocks: Vec<BlockRecord>,
    head: HeadRecord,
    cursor: BuildCursor,
    useful: Vec<ParamId>,
    optimizer: Momentum,
    rng: StdRng,
}

impl Network {
    pub fn new(arch: Architecture) -> GrowResult<Self> {
        arch.validate()?;
        let mut rng = StdRng::seed_from_u64(arch.seed);
        let mut graph = Graph::new(arch.data_shape);
        let mut params = ParamStore::new();

        let mut builder = Builder { arch: &arch, graph: &mut graph, params: &mut params };
        let (initial, mut features) = builder.initial_conv()?;
        let total_blocks = arch.layer_num_list.len();
        let mut blocks = Vec::with_capacity(total_blocks);
        let mut cursor = None;
        for (b, &layers) in arch.layer_num_list.iter().enumerate() {
            let (mut block, last) = builder.block(b, features, layers)?;
            features = last.output;
            if b + 1 != total_blocks {
                let (transition, pooled) = builder.transition(b, features)?;
                block.transition = Some(transition);
                features = pooled;
            }
            blocks.push(block);
            cursor = Some(last);
        }
        let cursor = cursor.ok_or_else(|| GrowError::InvalidConfig("no blocks to build".into()))?;
        let head = builder.head(total_blocks - 1, cursor.output, None)?;

        params.initialize_uninitialized(&mut rng);
        let optimizer = Momentum::new(arch.momentum);
        info!(
            "Built {} model with {} blocks, layers per block: {:?}",
            arch.model_type, total_blocks, arch.layer_num_list
        );
        let mut network = Self { arch, graph, params, initial, blocks, head, cursor, useful: Vec::new(), optimizer, rng };
        network.define_objective()?;
        Ok(network)
    }

    // ------------------------------------------------------------------ queries

    pub fn architecture(&self) -> &Architecture {
        &self.arch
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    /// Direct access to variable values (checkpoint restore, tests).
    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    pub fn initial_conv(&self) -> &ConvUnit {
        &self.initial
    }

    pub fn blocks(&self) -> &[BlockRecord] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> GrowResult<&BlockRecord> {
        self.blocks
            .get(index)
            .ok_or_else(|| GrowError::InvalidConfig(format!("no block {index}")))
    }

    pub fn total_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn layer_num_list(&self) -> Vec<usize> {
        self.blocks.iter().map(|b| b.layers.len()).collect()
    }

    pub fn head(&self) -> &HeadRecord {
        &self.head
    }

    /// Width of the features entering the classifier head.
    pub fn features_total(&self) -> usize {
        self.head.width
    }

    pub fn cursor(&self) -> BuildCursor {
        self.cursor
    }

    /// Trainable variables reachable from the current logits.
    pub fn useful_params(&self) -> &[ParamId] {
        &self.useful
    }

    /// Every variable reachable from the current logits, statistics included.
    pub fn live_params(&self) -> GrowResult<Vec<ParamId>> {
        self.graph.live_params()
    }

    pub fn node_count(&self) -> usize {
        self.graph.nodes.len()
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        self.graph.order.binary_search(&id).is_ok()
    }

    pub fn output_shape(&self) -> GrowResult<Shape> {
        self.graph.shape(self.graph.output)
    }

    /// Stacked `[O, C, k, k]` filter of a unit.
    pub fn filter(&self, unit: &ConvUnit) -> GrowResult<ndarray::Array4<f32>> {
        KernelConv::new(unit.kernels.clone(), unit.in_channels, unit.kernel_size).filter(&self.params)
    }

    pub fn count_params(&self) -> ParamCount {
        let mut count = ParamCount::default();
        for (_, param) in self.params.iter().filter(|(_, p)| p.kind.is_trainable()) {
            count.total += param.numel();
        }
        for &id in &self.useful {
            if let Ok(param) = self.params.get(id) {
                match param.kind {
                    ParamKind::Dense => count.useful_fc += param.numel(),
                    _ => count.useful_conv += param.numel(),
                }
            }
        }
        count
    }

    pub fn log_param_count(&self) {
        let count = self.count_params();
        info!(
            "Total trainable params: {:.1}k, useful: {:.1}k (conv {:.1}k, fc {:.1}k)",
            count.total as f64 / 1e3,
            count.useful() as f64 / 1e3,
            count.useful_conv as f64 / 1e3,
            count.useful_fc as f64 / 1e3
        );
    }

    // --------------------------------------------------------------- training

    /// Recompute the useful variable set from the current logits and restart
    /// the optimizer. Must run after every mutation before training resumes.
    pub fn define_objective(&mut self) -> GrowResult<()> {
        self.graph.relink(self.head.logits)?;
        let live = self.graph.live_params()?;
        self.useful = live
            .into_iter()
            .filter(|&id| self.params.get(id).map(|p| p.kind.is_trainable()).unwrap_or(false))
            .collect();
        self.optimizer.reset();
        debug!("objective defined over {} useful variables", self.useful.len());
        Ok(())
    }

    pub fn forward(&mut self, images: &Tensor, training: bool) -> GrowResult<Array2<f32>> {
        let mut pass = Pass::new(training, &mut self.rng);
        let tape = self.graph.forward(&self.params, images, &mut pass)?;
        self.logits(&tape)
    }

    fn logits(&self, tape: &Tape) -> GrowResult<Array2<f32>> {
        let logits = tape.value(self.graph.output)?;
        let (n, k, _, _) = logits.dim();
        Ok(logits.as_standard_layout().to_owned().into_shape((n, k))?)
    }

    /// One optimizer step on a batch. Returns the batch cross-entropy (without
    /// the weight-decay term) and accuracy.
    pub fn train_batch(&mut self, images: &Tensor, labels: &Labels, learning_rate: f32) -> GrowResult<BatchStats> {
        let mut pass = Pass::new(true, &mut self.rng);
        let tape = self.graph.forward(&self.params, images, &mut pass)?;
        let stat_updates = pass.stat_updates;
        let logits = self.logits(&tape)?;
        let (loss, d_logits, accuracy) = math::softmax_cross_entropy(&logits, labels)?;
        if !loss.is_finite() {
            return Err(GrowError::Diverged(loss));
        }
        let (n, k) = d_logits.dim();
        let grads = self.graph.backward(&tape, d_logits.into_shape((n, k, 1, 1))?, &self.params)?;
        for (id, value) in stat_updates {
            self.params.assign(id, value)?;
        }
        self.optimizer
            .step(&mut self.params, &grads, &self.useful, learning_rate, self.arch.weight_decay)?;
        Ok(BatchStats { loss, accuracy })
    }

    /// Loss and accuracy with running statistics and dropout disabled.
    pub fn evaluate(&mut self, images: &Tensor, labels: &Labels) -> GrowResult<BatchStats> {
        let logits = self.forward(images, false)?;
        let (loss, _, accuracy) = math::softmax_cross_entropy(&logits, labels)?;
        Ok(BatchStats { loss, accuracy })
    }

    /// Full training objective on a batch: cross-entropy plus weight decay.
    pub fn objective(&mut self, images: &Tensor, labels: &Labels) -> GrowResult<f32> {
        let stats = self.evaluate(images, labels)?;
        let l2 = Momentum::l2_penalty(&self.params, &self.useful)?;
        Ok(stats.loss + self.arch.weight_decay * l2)
    }

    // -------------------------------------------------------------- mutations

    /// Append `count` kernels to the last layer of the last block.
    pub fn append_kernels(&mut self, count: usize) -> GrowResult<MutationReport> {
        let report = self.mutate(|net| {
            let cursor = net.cursor;
            let block = net.block(cursor.block)?;
            let layer = block
                .layers
                .last()
                .ok_or_else(|| GrowError::InvalidConfig(format!("block {} has no layers", cursor.block)))?;
            let mut unit = layer.composite.clone();
            let mut builder = Builder { arch: &net.arch, graph: &mut net.graph, params: &mut net.params };
            let scope = format!("block{}/layer{}/composite", cursor.block, cursor.layer);
            let added = builder.kernels(&scope, unit.kernels.len(), count, unit.in_channels, unit.kernel_size)?;
            unit.kernels.extend(added);
            let composite_output = builder.conv_output(&unit)?;
            let output = builder.graph.push(ConcatLayer, &[cursor.layer_input, composite_output])?;
            let head = builder.head(cursor.block, output, Some(&net.head))?;

            if let Some(last) = net.blocks.get_mut(cursor.block).and_then(|b| b.layers.last_mut()) {
                last.composite = unit;
                last.output = output;
            }
            net.cursor = BuildCursor { output, ..cursor };
            net.head = head;
            Ok(())
        })?;
        let width = self
            .blocks
            .last()
            .and_then(|b| b.layers.last())
            .map(LayerRecord::width)
            .unwrap_or(0);
        info!(
            "Added {} kernel(s) to layer #{} (block #{}), it now has {} kernels",
            count, self.cursor.layer, self.cursor.block, width
        );
        Ok(report)
    }

    /// Append one layer (bottleneck + composite in BC mode) to the last block.
    pub fn append_layer(&mut self) -> GrowResult<MutationReport> {
        let report = self.mutate(|net| {
            let cursor = net.cursor;
            let mut builder = Builder { arch: &net.arch, graph: &mut net.graph, params: &mut net.params };
            let (record, next) = builder.internal_layer(cursor.block, cursor.layer + 1, cursor.output)?;
            let head = builder.head(cursor.block, next.output, Some(&net.head))?;

            let block = net
                .blocks
                .get_mut(cursor.block)
                .ok_or_else(|| GrowError::InvalidConfig(format!("no block {}", cursor.block)))?;
            block.layers.push(record);
            net.cursor = next;
            net.head = head;
            Ok(())
        })?;
        info!(
            "Added a new layer to the last block (#{}), it now has {} layers",
            self.cursor.block,
            self.cursor.layer + 1
        );
        Ok(report)
    }

    /// Close the last block with a transition and open a new block with one
    /// layer. The new block gets a fresh head.
    pub fn append_block(&mut self) -> GrowResult<MutationReport> {
        let report = self.mutate(|net| {
            let last = net.blocks.len() - 1;
            let mut builder = Builder { arch: &net.arch, graph: &mut net.graph, params: &mut net.params };
            let (transition, pooled) = builder.transition(last, net.cursor.output)?;
            let (block, cursor) = builder.block(last + 1, pooled, 1)?;
            let head = builder.head(last + 1, cursor.output, None)?;

            net.blocks[last].transition = Some(transition);
            net.blocks.push(block);
            net.cursor = cursor;
            net.head = head;
            Ok(())
        })?;
        info!(
            "Added a new block (#{}), layers per block: {:?}",
            self.blocks.len() - 1,
            self.layer_num_list()
        );
        Ok(report)
    }

    /// Run a structural edit. On failure every node and variable it created
    /// is discarded; on success only the new variables are initialised and
    /// the objective is redefined.
    fn mutate(&mut self, edit: impl FnOnce(&mut Self) -> GrowResult<()>) -> GrowResult<MutationReport> {
        let node_mark = self.graph.nodes.save_checkpoint();
        let param_mark = self.params.len();
        let saved = (self.blocks.clone(), self.head.clone(), self.cursor);

        if let Err(err) = edit(self) {
            self.graph.nodes.restore_checkpoint(node_mark);
            self.params.rollback(param_mark);
            (self.blocks, self.head, self.cursor) = saved;
            return Err(err);
        }

        let new_params: Vec<ParamId> = (param_mark..self.params.len()).map(ParamId).collect();
        let new_kernels = new_params
            .iter()
            .copied()
            .filter(|&id| self.params.get(id).map(|p| p.kind == ParamKind::Kernel).unwrap_or(false))
            .collect();
        let initialized = self.params.initialize_uninitialized(&mut self.rng);
        debug!("initialized {} new variables", initialized);
        self.define_objective()?;
        self.log_param_count();
        Ok(MutationReport { new_params, new_kernels })
    }
}
