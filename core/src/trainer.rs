//! Training-loop driver.
//!
//! One epoch runs to completion before the next begins:
//!
//! ```text
//! lr schedule → train batches → validation → features → save
//!     → controller step → growth → lr coordinator
//! ```
//!
//! Structural mutations only happen between epochs, never while a batch is
//! in flight.

use std::fs::File;
use std::io::BufWriter;
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, info, warn};

use crate::checkpoint::{self, Snapshot};
use crate::config::Config;
use crate::controller::{EpochObservation, Growth, SelfConstructor};
use crate::data::{DataProvider, DataSplit};
use crate::error::{GrowError, GrowResult};
use crate::layers::Shape;
use crate::logs::{estimate_remaining, format_duration, FeatureLog, MetricLog, Phase};
use crate::model::{Network, ParamCount};
use crate::paths::RunPaths;
use crate::schedule::LrCoordinator;
use crate::strength::{BlockStrength, KernelAnalyzer, StrengthOracle};

/// Size the global rayon pool used for batch computation. A pool that is
/// already built is left alone.
pub fn init_thread_pool(threads: usize) {
    if threads == 0 {
        return;
    }
    if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
        warn!("could not configure {} worker threads: {}", threads, e);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthKind {
    Kernels(usize),
    Layer,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthEvent {
    /// Global epoch.
    pub epoch: usize,
    /// Epoch counted from the last block addition.
    pub block_epoch: usize,
    pub kind: GrowthKind,
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    /// Last epoch that ran.
    pub epochs: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub learning_rate: f32,
    pub layer_num_list: Vec<usize>,
    pub events: Vec<GrowthEvent>,
    pub params: ParamCount,
    pub total_time: Duration,
}

pub struct Trainer {
    network: Network,
    config: Config,
    controller: Option<SelfConstructor>,
    oracle: Box<dyn StrengthOracle>,
    lr: LrCoordinator,
    paths: RunPaths,
    metric_log: Option<MetricLog>,
    feature_log: Option<FeatureLog<BufWriter<File>>>,
    batches_step: usize,
    events: Vec<GrowthEvent>,
}

impl Trainer {
    /// Build the initial network for a dataset of `data_shape` images and
    /// open whatever logs the config enables.
    pub fn new(config: Config, data_shape: Shape, n_classes: usize, dataset: &str) -> GrowResult<Self> {
        let arch = config.architecture(data_shape, n_classes);
        let paths = RunPaths::new(
            &config.logging,
            arch.model_type,
            arch.growth_rate,
            &arch.layer_num_list,
            dataset,
            Local::now(),
        );
        let network = Network::new(arch)?;
        network.log_param_count();

        paths.prepare_logs(config.logging.renew_logs)?;
        let metric_log = paths.logs_path().map(MetricLog::create).transpose()?;
        let feature_log = paths
            .ft_logs_path()
            .map(|p| FeatureLog::create(p, &config.logging.ft_comma, &config.logging.ft_decimal))
            .transpose()?;

        let controller = config
            .self_construct
            .enabled
            .then(|| SelfConstructor::new(config.variant(), config.construct_params()));
        if let Some(ctl) = &controller {
            info!(
                "Self-constructing with variant {} ({} mode), up to {} block(s)",
                ctl.variant(),
                config.self_construct.layer_cs.label(),
                config.self_construct.block_count
            );
        }
        let oracle = Box::new(KernelAnalyzer::new(config.self_construct.layer_cs));
        let lr = config.lr_coordinator();
        Ok(Self {
            network,
            config,
            controller,
            oracle,
            lr,
            paths,
            metric_log,
            feature_log,
            batches_step: 0,
            events: Vec::new(),
        })
    }

    /// Replace the CS source the controller and feature log read from.
    pub fn with_oracle(mut self, oracle: Box<dyn StrengthOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    pub fn controller(&self) -> Option<&SelfConstructor> {
        self.controller.as_ref()
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    pub fn events(&self) -> &[GrowthEvent] {
        &self.events
    }

    pub fn save_model(&self) -> GrowResult<()> {
        let path = self.paths.checkpoint_file();
        checkpoint::save(&self.network, self.paths.model_identifier(), &path)
    }

    /// Restore the checkpoint matching the current model identifier.
    pub fn load_model(&mut self) -> GrowResult<Snapshot> {
        let path = self.paths.checkpoint_file();
        checkpoint::load(&mut self.network, &path)
    }

    fn record(&mut self, phase: Phase, step: usize, loss: f32, accuracy: f32) -> GrowResult<()> {
        if let Some(log) = &mut self.metric_log {
            log.record(phase, step, loss, accuracy)?;
        }
        Ok(())
    }

    /// One pass over `split`. Returns mean batch loss and accuracy.
    pub fn train_one_epoch(&mut self, split: &mut dyn DataSplit, batch_size: usize, learning_rate: f32) -> GrowResult<(f32, f32)> {
        let batches = batch_count(split, batch_size)?;
        let (mut loss, mut accuracy) = (0.0, 0.0);
        for _ in 0..batches {
            let (images, labels) = split.next_batch(batch_size)?;
            let stats = self.network.train_batch(&images, &labels, learning_rate)?;
            loss += stats.loss;
            accuracy += stats.accuracy;
            self.batches_step += 1;
            self.record(Phase::PerBatch, self.batches_step, stats.loss, stats.accuracy)?;
        }
        Ok((loss / batches as f32, accuracy / batches as f32))
    }

    /// Mean loss and accuracy over `split` without training.
    pub fn test(&mut self, split: &mut dyn DataSplit, batch_size: usize) -> GrowResult<(f32, f32)> {
        let batches = batch_count(split, batch_size)?;
        let (mut loss, mut accuracy) = (0.0, 0.0);
        for _ in 0..batches {
            let (images, labels) = split.next_batch(batch_size)?;
            let stats = self.network.evaluate(&images, &labels)?;
            loss += stats.loss;
            accuracy += stats.accuracy;
        }
        Ok((loss / batches as f32, accuracy / batches as f32))
    }

    /// Log accuracy and loss; with `ft_filters`, also the CS scores of
    /// every block.
    fn measure_features(&mut self, epoch: usize, loss: f32, accuracy: f32) -> GrowResult<()> {
        info!("Current accuracy = {:.6}, cross-entropy = {:.6}", accuracy, loss);
        let mut strengths: Vec<BlockStrength> = Vec::new();
        if self.config.logging.ft_filters {
            for b in 0..self.network.total_blocks() {
                let strength = self.oracle.observe(&self.network, b)?;
                for l in 0..strength.layers() {
                    debug!(
                        block = b,
                        layer = l,
                        "dst {:.4} src {:.4} emission {:?} reception {:?}",
                        strength.lcs_dst.get(l).copied().unwrap_or(0.0),
                        strength.lcs_src.get(l).copied().unwrap_or(0.0),
                        strength.normalised_emission(l),
                        strength.normalised_reception(l)
                    );
                }
                strengths.push(strength);
            }
        }
        if let Some(log) = &mut self.feature_log {
            log.write_epoch(epoch, accuracy, loss, &strengths)?;
        }
        Ok(())
    }

    fn apply_growth(&mut self, epoch: usize, block_epoch: usize, growth: Growth) -> GrowResult<()> {
        let kind = match growth {
            Growth::Layer => {
                self.network.append_layer()?;
                GrowthKind::Layer
            }
            Growth::Kernels => {
                let count = self.config.self_construct.expansion_rate;
                self.network.append_kernels(count)?;
                GrowthKind::Kernels(count)
            }
        };
        self.grown(epoch, block_epoch, kind);
        Ok(())
    }

    fn grown(&mut self, epoch: usize, block_epoch: usize, kind: GrowthKind) {
        self.events.push(GrowthEvent { epoch, block_epoch, kind });
        self.paths
            .refresh(&self.network.layer_num_list(), self.config.logging.should_save_model);
    }

    /// Controller step for the last block. Returns `false` once training
    /// should stop.
    fn self_constructing_step(&mut self, epoch: usize, block_epoch: usize, accuracy: f32) -> GrowResult<bool> {
        let last = self.network.total_blocks() - 1;
        let strength = self.oracle.observe(&self.network, last)?;
        let obs = EpochObservation {
            settled_layers: strength.settled_layers(),
            layers_in_block: self.network.block(last)?.layers.len(),
        };
        let Some(ctl) = self.controller.as_mut() else {
            return Ok(true);
        };
        ctl.observe_accuracy(block_epoch, accuracy);
        let decision = ctl.step(block_epoch, &obs);

        if let Some(growth) = decision.growth {
            self.apply_growth(epoch, block_epoch, growth)?;
        }
        if !decision.finished {
            return Ok(true);
        }
        if self.network.total_blocks() >= self.config.self_construct.block_count {
            return Ok(false);
        }
        self.network.append_block()?;
        self.grown(epoch, block_epoch, GrowthKind::Block);
        if let Some(ctl) = self.controller.as_mut() {
            ctl.reset();
        }
        Ok(true)
    }

    /// Train until the epoch budget is spent or, when self-constructing,
    /// until the last allowed block finishes growing.
    pub fn train_all_epochs(&mut self, data: &mut dyn DataProvider) -> GrowResult<TrainingSummary> {
        let train = self.config.train.clone();
        let ft_period = self.config.logging.ft_period.max(1);
        let patience = self.config.self_construct.patience_param;
        let mut learning_rate = train.initial_learning_rate;
        let mut loss: f32;
        let mut accuracy: f32;

        let total_start = Instant::now();
        let mut epoch = 1;
        let mut epoch_last_block = 0;
        loop {
            if (epoch - 1) % ft_period == 0 {
                info!("{} Train epoch: {} {}", "-".repeat(30), epoch, "-".repeat(30));
            }
            let epoch_start = Instant::now();

            if self.controller.is_none() && train.should_change_lr {
                learning_rate = self.lr.fixed(epoch, train.max_n_ep, learning_rate);
            }

            (loss, accuracy) = self.train_one_epoch(data.train(), train.batch_size, learning_rate)?;
            info!("train: mean cross_entropy: {:.6}, mean accuracy: {:.6}", loss, accuracy);
            self.record(Phase::Train, epoch, loss, accuracy)?;

            if train.validation_set {
                if let Some(validation) = data.validation() {
                    (loss, accuracy) = self.test(validation, train.batch_size)?;
                    info!("valid: mean cross_entropy: {:.6}, mean accuracy: {:.6}", loss, accuracy);
                    self.record(Phase::Valid, epoch, loss, accuracy)?;
                }
            }

            if (epoch - 1) % ft_period == 0 {
                self.measure_features(epoch, loss, accuracy)?;
            }
            if self.config.logging.should_save_model {
                self.save_model()?;
            }

            // The first epoch of a block only trains it; its CS tables are
            // not yet meaningful.
            let block_epoch = epoch - epoch_last_block;
            if self.controller.is_some() && block_epoch > 1 {
                let blocks_before = self.network.total_blocks();
                if !self.self_constructing_step(epoch, block_epoch, accuracy)? {
                    break;
                }
                if self.network.total_blocks() > blocks_before {
                    epoch_last_block = epoch;
                }
                if train.should_change_lr {
                    if let Some(ctl) = &self.controller {
                        learning_rate = self.lr.after_step(learning_rate, ctl.state().patience_countdown, patience);
                    }
                }
            }

            let per_epoch = epoch_start.elapsed();
            // The controller counts its budget from the start of the last block.
            let (budget, elapsed) = match &self.controller {
                Some(ctl) => (ctl.state().max_n_ep, epoch - epoch_last_block),
                None => (train.max_n_ep, epoch),
            };
            info!(
                "Time per epoch: {}, Est. complete ({} epochs) in: {}",
                format_duration(per_epoch),
                budget,
                format_duration(estimate_remaining(per_epoch, budget, elapsed))
            );

            if self.controller.is_none() && epoch >= train.max_n_ep {
                break;
            }
            epoch += 1;
        }

        let total_time = total_start.elapsed();
        info!("TOTAL TRAINING TIME: {}", format_duration(total_time));
        if let Some(log) = &mut self.feature_log {
            log.write_total_time(total_time)?;
        }
        if let Some(log) = &mut self.metric_log {
            log.flush()?;
        }
        self.network.log_param_count();
        Ok(TrainingSummary {
            epochs: epoch,
            loss,
            accuracy,
            learning_rate,
            layer_num_list: self.network.layer_num_list(),
            events: self.events.clone(),
            params: self.network.count_params(),
            total_time,
        })
    }
}

fn batch_count(split: &dyn DataSplit, batch_size: usize) -> GrowResult<usize> {
    let n = split.num_examples();
    if n == 0 || batch_size == 0 {
        return Err(GrowError::EmptyBatch);
    }
    Ok((n / batch_size).max(1))
}
