//! Run configuration.
//!
//! Every tunable lives here. Loaded from TOML at startup; a missing or
//! unparsable file falls back to defaults. Selectors that only steer growth
//! heuristics (variants, layer lists) are parsed permissively and fall back
//! to a default with a warning instead of failing.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::controller::{ConstructParams, Variant};
use crate::data::{Normalisation, SyntheticSpec};
use crate::error::GrowResult;
use crate::layers::Shape;
use crate::model::{Architecture, ModelType};
use crate::schedule::{LrCoordinator, LrVariant};
use crate::strength::LayerCsMode;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub self_construct: SelfConstructConfig,
    pub data: DataConfig,
    pub logging: LoggingConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_type: ModelType,
    pub growth_rate: usize,
    /// Initial layers per block, comma separated (`"1"`, `"12,12,12"`).
    pub layer_num_list: String,
    /// Transition compression, DenseNet-BC only.
    pub reduction: f32,
    pub keep_prob: f32,
    /// Running-statistics decay of every batch norm.
    pub bn_decay: f32,
    pub weight_decay: f32,
    pub nesterov_momentum: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub max_n_ep: usize,
    pub initial_learning_rate: f32,
    pub reduce_lr_1: f32,
    pub reduce_lr_2: f32,
    pub should_change_lr: bool,
    /// Validate after every epoch when the dataset has a validation split.
    pub validation_set: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfConstructConfig {
    pub enabled: bool,
    /// `0`–`3`, `kernels` or `latest`.
    pub variant: String,
    /// `0`, `1` or `latest`.
    pub lr_variant: String,
    /// Maximum number of blocks.
    pub block_count: usize,
    pub layer_cs: LayerCsMode,
    pub asc_thresh: usize,
    pub patience_param: usize,
    pub std_tolerance: f32,
    pub std_window: usize,
    pub expansion_rate: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// `synthetic`, `C10`, `C10+`, `C100` or `C100+`.
    pub dataset: String,
    pub data_dir: PathBuf,
    pub normalisation: Normalisation,
    /// Fraction of the training split held out for validation (CIFAR).
    pub validation_fraction: f32,
    pub shuffle: bool,
    pub synthetic: SyntheticSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Root of the `saves/`, `logs/` and `ft_logs/` directories.
    pub output_dir: PathBuf,
    pub should_save_model: bool,
    pub should_save_logs: bool,
    pub should_save_ft_logs: bool,
    /// Clear the run's logs directory before writing.
    pub renew_logs: bool,
    /// Measure features every `ft_period` epochs.
    pub ft_period: usize,
    /// Include CS tables and layer scores in feature measurements.
    pub ft_filters: bool,
    pub ft_comma: String,
    pub ft_decimal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub seed: u64,
    /// Worker threads for batch computation; 0 lets rayon decide.
    pub threads: usize,
}

// =============================================================================
// Defaults
// =============================================================================

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: ModelType::DenseNet,
            growth_rate: 12,
            layer_num_list: "1".into(),
            reduction: 0.5,
            keep_prob: 1.0,
            bn_decay: 0.9,
            weight_decay: 1e-4,
            nesterov_momentum: 0.9,
        }
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_n_ep: 300,
            initial_learning_rate: 0.1,
            reduce_lr_1: 0.5,
            reduce_lr_2: 0.75,
            should_change_lr: true,
            validation_set: true,
        }
    }
}

impl Default for SelfConstructConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            variant: "latest".into(),
            lr_variant: "latest".into(),
            block_count: 1,
            layer_cs: LayerCsMode::Relevance,
            asc_thresh: 10,
            patience_param: 200,
            std_tolerance: 0.1,
            std_window: 50,
            expansion_rate: 1,
        }
    }
}

impl SelfConstructConfig {
    /// Replace counts that would stall the controller (zero ascension period
    /// or accuracy window) with their defaults.
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.asc_thresh == 0 {
            warn!("asc_thresh must be at least 1, using {}", defaults.asc_thresh);
            self.asc_thresh = defaults.asc_thresh;
        }
        if self.std_window == 0 {
            warn!("std_window must be at least 1, using {}", defaults.std_window);
            self.std_window = defaults.std_window;
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dataset: "synthetic".into(),
            data_dir: PathBuf::from("data"),
            normalisation: Normalisation::Divide256,
            validation_fraction: 0.1,
            shuffle: true,
            synthetic: SyntheticSpec::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            should_save_model: false,
            should_save_logs: true,
            should_save_ft_logs: false,
            renew_logs: true,
            ft_period: 1,
            ft_filters: true,
            ft_comma: ";".into(),
            ft_decimal: ",".into(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { seed: 0, threads: 0 }
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Parse a comma-separated layer list. Anything unusable becomes `[1]`.
pub fn parse_layer_list(text: &str) -> Vec<usize> {
    let parsed: Result<Vec<usize>, _> = text
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<usize>)
        .collect();
    match parsed {
        Ok(list) if !list.is_empty() && !list.contains(&0) => list,
        _ => {
            warn!("could not parse layer_num_list '{}', using [1]", text);
            vec![1]
        }
    }
}

impl Config {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml_str(&content) {
                Ok(config) => {
                    info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn from_toml_str(content: &str) -> GrowResult<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.self_construct.sanitize();
        Ok(config)
    }

    /// The config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> GrowResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn layer_num_list(&self) -> Vec<usize> {
        parse_layer_list(&self.model.layer_num_list)
    }

    pub fn architecture(&self, data_shape: Shape, n_classes: usize) -> Architecture {
        Architecture {
            model_type: self.model.model_type,
            growth_rate: self.model.growth_rate,
            layer_num_list: self.layer_num_list(),
            reduction: self.model.reduction,
            keep_prob: self.model.keep_prob,
            bn_decay: self.model.bn_decay,
            weight_decay: self.model.weight_decay,
            momentum: self.model.nesterov_momentum,
            data_shape,
            n_classes,
            seed: self.runtime.seed,
        }
    }

    pub fn variant(&self) -> Variant {
        Variant::from_selector(&self.self_construct.variant)
    }

    pub fn construct_params(&self) -> ConstructParams {
        let mut sc = self.self_construct.clone();
        sc.sanitize();
        ConstructParams {
            asc_thresh: sc.asc_thresh,
            patience_param: sc.patience_param,
            std_tolerance: sc.std_tolerance,
            std_window: sc.std_window,
            max_n_ep: self.train.max_n_ep,
        }
    }

    pub fn lr_coordinator(&self) -> LrCoordinator {
        LrCoordinator::new(
            LrVariant::from_selector(&self.self_construct.lr_variant),
            self.train.initial_learning_rate,
            self.train.reduce_lr_1,
            self.train.reduce_lr_2,
        )
    }
}
