//! Self-construction controller.
//!
//! A two-stage state machine run once per epoch on the last block:
//!
//! ```text
//!   ascension ──(settlement / accuracy plateau)──▶ improvement ──(stop)──▶ finished
//!       │ append a layer every asc_thresh epochs        │ variant-specific
//! ```
//!
//! Epochs are counted from 1 since the last block was added; the driver
//! starts stepping at epoch 2, once the new block has trained. The controller
//! only decides; the training driver applies the [`Decision`] to the network
//! and, when a block finishes, either appends a block and calls
//! [`SelfConstructor::reset`] or stops training.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Ascension,
    Improvement,
}

/// One structural growth step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// Append a layer to the last block.
    Layer,
    /// Append `expansion_rate` kernels to the last layer.
    Kernels,
}

/// Outcome of one controller step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Decision {
    pub growth: Option<Growth>,
    /// The last block is done growing.
    pub finished: bool,
}

impl Decision {
    const NONE: Decision = Decision { growth: None, finished: false };

    fn grow(growth: Growth) -> Self {
        Self { growth: Some(growth), finished: false }
    }

    fn finish() -> Self {
        Self { growth: None, finished: true }
    }
}

/// What the controller sees of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochObservation {
    /// Layers (excluding layer 0) whose source-side score reached 1.
    pub settled_layers: usize,
    /// Layers currently in the last block.
    pub layers_in_block: usize,
}

/// Tunables shared by every variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstructParams {
    pub asc_thresh: usize,
    pub patience_param: usize,
    pub std_tolerance: f32,
    pub std_window: usize,
    pub max_n_ep: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmState {
    pub stage: Stage,
    pub settled_layers_ceil: usize,
    pub patience_countdown: usize,
    /// Epoch budget; variants 2 and 3 overwrite it with a completion estimate.
    pub max_n_ep: usize,
    pub accuracy_fifo: VecDeque<f32>,
}

impl AlgorithmState {
    pub fn new(params: &ConstructParams) -> Self {
        Self {
            stage: Stage::Ascension,
            settled_layers_ceil: 0,
            patience_countdown: params.patience_param,
            max_n_ep: params.max_n_ep,
            accuracy_fifo: VecDeque::with_capacity(params.std_window),
        }
    }
}

// =============================================================================
// Variants
// =============================================================================

/// Growth policy over the shared state.
pub trait GrowthPolicy {
    fn step(&self, epoch: usize, obs: &EpochObservation, state: &mut AlgorithmState, params: &ConstructParams) -> Decision;

    /// Whether the policy runs a patience countdown in improvement.
    fn uses_patience(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Variant {
    /// Settle, then wait out the epoch budget.
    V0,
    /// Like V0, plus a layer whenever another layer settles.
    V1,
    /// Patience countdown; ascension needs more than two layers to end.
    V2,
    /// Like V2, but ascension ends only on an accuracy plateau.
    #[default]
    V3,
    /// Kernel-wise growth between layer additions.
    Kernelwise,
}

impl Variant {
    pub const LATEST: Variant = Variant::V3;

    /// Parse a selector (`0`–`3`, `kernels`, `latest`). Anything else falls
    /// back to the latest variant.
    pub fn from_selector(selector: &str) -> Self {
        match selector.trim().to_ascii_lowercase().as_str() {
            "0" => Variant::V0,
            "1" => Variant::V1,
            "2" => Variant::V2,
            "3" | "latest" => Variant::V3,
            "kernels" | "kernelwise" => Variant::Kernelwise,
            other => {
                warn!("unknown self-constructing variant '{}', using the latest ({})", other, Self::LATEST);
                Self::LATEST
            }
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::V0 => write!(f, "0"),
            Variant::V1 => write!(f, "1"),
            Variant::V2 => write!(f, "2"),
            Variant::V3 => write!(f, "3"),
            Variant::Kernelwise => write!(f, "kernels"),
        }
    }
}

fn ascension_tick(epoch: usize, params: &ConstructParams) -> bool {
    params.asc_thresh > 0 && epoch % params.asc_thresh == 0
}

fn enter_improvement(state: &mut AlgorithmState, settled: usize) {
    state.settled_layers_ceil = settled;
    state.stage = Stage::Improvement;
}

/// Improvement with a patience countdown (variants 2 and 3).
fn patient_improvement(epoch: usize, settled: usize, state: &mut AlgorithmState, params: &ConstructParams) -> Decision {
    if state.patience_countdown == 0 {
        state.stage = Stage::Ascension;
        state.patience_countdown = params.patience_param;
        return Decision::finish();
    }
    if settled > state.settled_layers_ceil {
        state.settled_layers_ceil = settled;
        state.patience_countdown = params.patience_param;
        state.max_n_ep = epoch + params.patience_param;
        return Decision::grow(Growth::Layer);
    }
    state.patience_countdown -= 1;
    Decision::NONE
}

/// Epoch-budget stop shared by variants without a countdown.
fn budget_spent(epoch: usize, state: &mut AlgorithmState) -> bool {
    if epoch >= state.max_n_ep {
        state.stage = Stage::Ascension;
        return true;
    }
    false
}

impl GrowthPolicy for Variant {
    fn step(&self, epoch: usize, obs: &EpochObservation, state: &mut AlgorithmState, params: &ConstructParams) -> Decision {
        let settled = obs.settled_layers;
        match self {
            Variant::V0 | Variant::V1 => {
                let mut growth = None;
                if state.stage == Stage::Ascension {
                    if settled > 0 {
                        enter_improvement(state, settled);
                    } else if ascension_tick(epoch, params) {
                        growth = Some(Growth::Layer);
                    }
                } else if *self == Variant::V1 && settled > state.settled_layers_ceil {
                    state.settled_layers_ceil = settled;
                    growth = Some(Growth::Layer);
                }
                Decision { growth, finished: budget_spent(epoch, state) }
            }
            Variant::V2 => match state.stage {
                Stage::Ascension => {
                    if settled > 0 && obs.layers_in_block > 2 {
                        enter_improvement(state, settled);
                        state.max_n_ep = epoch + params.patience_param;
                        patient_improvement(epoch, settled, state, params)
                    } else if ascension_tick(epoch, params) {
                        Decision::grow(Growth::Layer)
                    } else {
                        Decision::NONE
                    }
                }
                Stage::Improvement => patient_improvement(epoch, settled, state, params),
            },
            Variant::V3 => match state.stage {
                Stage::Ascension if ascension_tick(epoch, params) => Decision::grow(Growth::Layer),
                Stage::Ascension => Decision::NONE,
                Stage::Improvement => patient_improvement(epoch, settled, state, params),
            },
            Variant::Kernelwise => {
                let mut growth = None;
                if state.stage == Stage::Ascension {
                    if ascension_tick(epoch, params) {
                        growth = Some(Growth::Layer);
                    } else if epoch % 2 == 0 {
                        growth = Some(Growth::Kernels);
                    }
                }
                Decision { growth, finished: budget_spent(epoch, state) }
            }
        }
    }

    fn uses_patience(&self) -> bool {
        matches!(self, Variant::V2 | Variant::V3)
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Variant plus its state and the accuracy-plateau check.
#[derive(Debug, Clone)]
pub struct SelfConstructor {
    variant: Variant,
    params: ConstructParams,
    state: AlgorithmState,
}

impl SelfConstructor {
    pub fn new(variant: Variant, params: ConstructParams) -> Self {
        let state = AlgorithmState::new(&params);
        Self { variant, params, state }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn params(&self) -> &ConstructParams {
        &self.params
    }

    pub fn state(&self) -> &AlgorithmState {
        &self.state
    }

    /// Feed the epoch's accuracy into the plateau FIFO. While in ascension,
    /// once the FIFO is full and its standard deviation is below tolerance
    /// the stage moves to improvement. The first epoch of a block is skipped.
    pub fn observe_accuracy(&mut self, epoch: usize, accuracy: f32) {
        if epoch <= 1 || self.state.stage != Stage::Ascension || self.params.std_window == 0 {
            return;
        }
        let fifo = &mut self.state.accuracy_fifo;
        if fifo.len() == self.params.std_window {
            fifo.pop_front();
        }
        fifo.push_back(accuracy);
        if fifo.len() < self.params.std_window {
            return;
        }
        let (_, std) = tensor::mean_std(fifo.make_contiguous());
        if std < self.params.std_tolerance {
            info!("accuracy plateau (std {:.5} < {}), leaving ascension", std, self.params.std_tolerance);
            self.state.stage = Stage::Improvement;
            if self.variant.uses_patience() {
                self.state.max_n_ep = epoch + self.params.patience_param;
            }
        }
    }

    /// One controller step for `epoch` (counted since the last block).
    pub fn step(&mut self, epoch: usize, obs: &EpochObservation) -> Decision {
        let before = self.state.stage;
        let decision = self.variant.step(epoch, obs, &mut self.state, &self.params);
        if before == Stage::Ascension && self.state.stage == Stage::Improvement {
            info!(epoch, settled = obs.settled_layers, "entering improvement stage");
        }
        decision
    }

    /// Back to ascension for a freshly added block.
    pub fn reset(&mut self) {
        self.state = AlgorithmState::new(&self.params);
    }
}
