//! # densegrow-core: self-constructing DenseNet trainer
//!
//! A DenseNet image classifier whose last block grows while it trains. After
//! every epoch the kernels of the last block are analysed for connection
//! strength (CS); a small state machine turns those measurements into
//! growth steps (a kernel, a layer, or a whole new block) and the learning
//! rate follows the controller's patience countdown.
//!
//! ## Architecture
//!
//! - **Graph**: append-only node [`Arena`] plus a named [`ParamStore`];
//!   mutations push nodes and relink, trained variables are never rebuilt.
//! - **Layer Zoo**: convolution over individually addressable kernels, batch
//!   norm, ReLU, dropout, concatenation, pooling, classifier.
//! - **Strength**: CS tables and per-layer relevance/spread scores.
//! - **Controller**: ascension/improvement stages, variants 0–3 and a
//!   kernel-wise variant.
//! - **Trainer**: the epoch loop tying data, network, controller and logs.
//!
//! ## Usage
//!
//! ```ignore
//! use densegrow_core::*;
//!
//! let config = Config::default();
//! let mut data = data::synthetic(&config.data.synthetic, config.runtime.seed)?;
//! let mut trainer = Trainer::new(config, data.data_shape(), data.n_classes(), data.name())?;
//! let summary = trainer.train_all_epochs(&mut data)?;
//! println!("final layers per block: {:?}", summary.layer_num_list);
//! ```

pub mod arena;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod layers;
pub mod logs;
pub mod math;
pub mod model;
pub mod optim;
pub mod params;
pub mod paths;
pub mod schedule;
pub mod strength;
pub mod tensor;
pub mod trainer;

// Re-export primary types
pub use arena::{Arena, NodeId};
pub use config::Config;
pub use controller::{
    AlgorithmState, ConstructParams, Decision, EpochObservation, Growth, GrowthPolicy, SelfConstructor, Stage,
    Variant,
};
pub use data::{DataProvider, DataSplit, InMemoryProvider, InMemorySplit};
pub use error::{GrowError, GrowResult};
pub use layers::{Layer, Shape};
pub use model::{Architecture, BuildCursor, ModelType, Network, ParamCount};
pub use params::{ParamId, ParamStore};
pub use paths::RunPaths;
pub use schedule::{LrCoordinator, LrVariant};
pub use strength::{BlockStrength, KernelAnalyzer, LayerCsMode, StrengthOracle};
pub use tensor::{Labels, Tensor};
pub use trainer::{GrowthEvent, GrowthKind, Trainer, TrainingSummary};
