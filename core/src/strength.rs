//! Connection-strength (CS) analysis of a block's kernels.
//!
//! A block's input-channel axis is a concatenation of sources: the block
//! input, then every layer's new feature maps. The CS of a connection
//! `s → d` is the mean absolute weight of the kernels of layer `d` that read
//! source `s`. Stacking all connections gives the ragged table
//! `cs_table[d][s]` with `s ≤ d`.
//!
//! From the table four per-layer scores in [0, 1] are derived, each counting
//! how many of a layer's connections are at least `threshold` times some
//! reference maximum:
//!
//! | score              | connections  | reference max                    |
//! |--------------------|--------------|----------------------------------|
//! | `relevance_dst[l]` | `l → d ≥ l`  | strongest input of each `d`      |
//! | `relevance_src[l]` | `s ≤ l → l`  | strongest output of each `s`     |
//! | `spread_emi[l]`    | `l → d ≥ l`  | strongest output of `l`          |
//! | `spread_rec[l]`    | `s ≤ l → l`  | strongest input of `l`           |

use std::ops::Range;
use std::str::FromStr;

use ndarray::{s, Array4};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GrowError, GrowResult};
use crate::model::Network;
use crate::tensor;

/// Fraction of the reference maximum a connection must reach to count.
pub const RELEVANCE_THRESHOLD: f32 = 0.67;

/// Ragged table: `table[d][s]` for `s ≤ d`.
pub type CsTable = Vec<Vec<f32>>;

/// Which pair of per-layer scores drives the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerCsMode {
    #[default]
    Relevance,
    Spread,
}

impl LayerCsMode {
    pub fn label(self) -> &'static str {
        match self {
            LayerCsMode::Relevance => "Relevance",
            LayerCsMode::Spread => "Spread",
        }
    }
}

impl FromStr for LayerCsMode {
    type Err = GrowError;

    fn from_str(s: &str) -> GrowResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relevance" => Ok(LayerCsMode::Relevance),
            "spread" => Ok(LayerCsMode::Spread),
            other => Err(GrowError::InvalidConfig(format!("unknown layer_cs mode '{other}'"))),
        }
    }
}

// =============================================================================
// Grouping
// =============================================================================

/// Channel ranges of each source, in order, tiling `0..Σ widths`.
pub fn source_groups(widths: &[usize]) -> Vec<Range<usize>> {
    let mut start = 0;
    widths
        .iter()
        .map(|&w| {
            let range = start..start + w;
            start += w;
            range
        })
        .collect()
}

/// CS of every source group of one filter `[O, C, k, k]`.
pub fn cs_list(filter: &Array4<f32>, groups: &[Range<usize>]) -> GrowResult<Vec<f32>> {
    let channels = filter.dim().1;
    let covered = groups.last().map(|g| g.end).unwrap_or(0);
    if covered != channels {
        return Err(GrowError::DimensionMismatch { expected: channels, actual: covered });
    }
    Ok(groups
        .iter()
        .map(|g| tensor::mean_abs(filter.slice(s![.., g.clone(), .., ..])))
        .collect())
}

// =============================================================================
// Per-layer scores
// =============================================================================

fn relevant(cs: f32, max: f32, threshold: f32) -> bool {
    max > 0.0 && cs / max >= threshold
}

fn row_max(row: &[f32]) -> f32 {
    row.iter().copied().fold(0.0, f32::max)
}

/// Strongest connection sent from source `s` to any destination.
fn emitted_max(table: &CsTable, s: usize) -> f32 {
    table.iter().skip(s).filter_map(|row| row.get(s)).copied().fold(0.0, f32::max)
}

fn cs(table: &CsTable, d: usize, s: usize) -> f32 {
    table.get(d).and_then(|row| row.get(s)).copied().unwrap_or(0.0)
}

pub fn relevance_dst(table: &CsTable, threshold: f32) -> Vec<f32> {
    let n = table.len();
    (0..n)
        .map(|l| {
            let hits = (l..n).filter(|&d| relevant(cs(table, d, l), row_max(&table[d]), threshold)).count();
            hits as f32 / (n - l) as f32
        })
        .collect()
}

pub fn relevance_src(table: &CsTable, threshold: f32) -> Vec<f32> {
    table
        .iter()
        .enumerate()
        .map(|(l, row)| {
            let hits = row
                .iter()
                .enumerate()
                .filter(|&(s, &v)| relevant(v, emitted_max(table, s), threshold))
                .count();
            hits as f32 / (l + 1) as f32
        })
        .collect()
}

pub fn spread_emission(table: &CsTable, threshold: f32) -> Vec<f32> {
    let n = table.len();
    (0..n)
        .map(|l| {
            let max = emitted_max(table, l);
            let hits = (l..n).filter(|&d| relevant(cs(table, d, l), max, threshold)).count();
            hits as f32 / (n - l) as f32
        })
        .collect()
}

pub fn spread_reception(table: &CsTable, threshold: f32) -> Vec<f32> {
    table
        .iter()
        .enumerate()
        .map(|(l, row)| {
            let max = row_max(row);
            let hits = row.iter().filter(|&&v| relevant(v, max, threshold)).count();
            hits as f32 / (l + 1) as f32
        })
        .collect()
}

/// Layers other than layer 0 whose source-side score has reached 1.
pub fn settled_layers(lcs_src: &[f32]) -> usize {
    lcs_src.iter().skip(1).filter(|&&v| v >= 1.0).count()
}

// =============================================================================
// Analyzer
// =============================================================================

/// CS table and the active pair of per-layer scores for one block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockStrength {
    pub block: usize,
    pub table: CsTable,
    pub lcs_dst: Vec<f32>,
    pub lcs_src: Vec<f32>,
}

impl BlockStrength {
    pub fn from_table(block: usize, table: CsTable, mode: LayerCsMode, threshold: f32) -> Self {
        let (lcs_dst, lcs_src) = match mode {
            LayerCsMode::Relevance => (relevance_dst(&table, threshold), relevance_src(&table, threshold)),
            LayerCsMode::Spread => (spread_emission(&table, threshold), spread_reception(&table, threshold)),
        };
        Self { block, table, lcs_dst, lcs_src }
    }

    pub fn layers(&self) -> usize {
        self.table.len()
    }

    pub fn settled_layers(&self) -> usize {
        settled_layers(&self.lcs_src)
    }

    /// `cs_table[d][l]` over the strongest connection `l` sends.
    pub fn normalised_emission(&self, l: usize) -> Vec<f32> {
        let max = emitted_max(&self.table, l);
        (l..self.table.len())
            .map(|d| if max > 0.0 { cs(&self.table, d, l) / max } else { 0.0 })
            .collect()
    }

    /// `cs_table[l][s]` over the strongest connection `l` receives.
    pub fn normalised_reception(&self, l: usize) -> Vec<f32> {
        let row = self.table.get(l).map(Vec::as_slice).unwrap_or(&[]);
        let max = row_max(row);
        row.iter().map(|&v| if max > 0.0 { v / max } else { 0.0 }).collect()
    }
}

/// Source of per-epoch block measurements for the controller.
pub trait StrengthOracle {
    fn observe(&self, network: &Network, block: usize) -> GrowResult<BlockStrength>;
}

/// Measures CS from the network's current kernel weights.
///
/// In BC mode the measured kernels are the 1×1 bottleneck kernels, the ones
/// that read the block concatenation.
#[derive(Debug, Clone, Copy)]
pub struct KernelAnalyzer {
    pub mode: LayerCsMode,
    pub threshold: f32,
}

impl KernelAnalyzer {
    pub fn new(mode: LayerCsMode) -> Self {
        Self { mode, threshold: RELEVANCE_THRESHOLD }
    }

    pub fn cs_table(network: &Network, block: usize) -> GrowResult<CsTable> {
        let record = network.block(block)?;
        let widths = record.source_widths();
        record
            .layers
            .iter()
            .enumerate()
            .map(|(l, layer)| {
                let filter = network.filter(layer.source_unit())?;
                cs_list(&filter, &source_groups(&widths[..=l]))
            })
            .collect()
    }
}

impl StrengthOracle for KernelAnalyzer {
    fn observe(&self, network: &Network, block: usize) -> GrowResult<BlockStrength> {
        let table = Self::cs_table(network, block)?;
        let strength = BlockStrength::from_table(block, table, self.mode, self.threshold);
        debug!(
            block,
            settled = strength.settled_layers(),
            "{} src {:?} dst {:?}",
            self.mode.label(),
            strength.lcs_src,
            strength.lcs_dst
        );
        Ok(strength)
    }
}
