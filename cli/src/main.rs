//! densegrow: train and test self-constructing DenseNets.
//!
//! Usage:
//!   densegrow init-config densegrow.toml
//!   densegrow --config densegrow.toml train --dataset C10+ --variant 3
//!   densegrow --config densegrow.toml test --layer-num-list 6,4

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use densegrow_core::data::{self, CifarOptions, DataProvider, InMemoryProvider};
use densegrow_core::trainer::init_thread_pool;
use densegrow_core::{Config, ModelType, Trainer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "densegrow", version, about = "Self-constructing DenseNet trainer")]
struct Cli {
    /// Path to config file (TOML). Missing or invalid files fall back to defaults.
    #[arg(long, global = true, default_value = "densegrow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train (and grow) a network, then evaluate it on the test split.
    Train(Overrides),
    /// Load a saved model and evaluate it on the test split.
    Test(Overrides),
    /// Write the default configuration as TOML.
    InitConfig {
        /// Output file; `-` prints to stdout.
        #[arg(default_value = "densegrow.toml")]
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

/// Command-line overrides of selected config fields.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// `DenseNet` or `DenseNet-BC`.
    #[arg(long)]
    model_type: Option<String>,
    #[arg(long)]
    growth_rate: Option<usize>,
    /// Initial layers per block, e.g. `1` or `12,12,12`.
    #[arg(long)]
    layer_num_list: Option<String>,
    /// `synthetic`, `C10`, `C10+`, `C100` or `C100+`.
    #[arg(long)]
    dataset: Option<String>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    max_n_ep: Option<usize>,
    /// Self-constructing variant: 0-3, `kernels` or `latest`.
    #[arg(long)]
    variant: Option<String>,
    /// Learning rate reduction variant: 0, 1 or `latest`.
    #[arg(long)]
    lr_variant: Option<String>,
    #[arg(long)]
    block_count: Option<usize>,
    /// Train with a fixed epoch budget instead of self-constructing.
    #[arg(long)]
    no_self_construct: bool,
    #[arg(long)]
    save_model: bool,
    #[arg(long)]
    ft_logs: bool,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    threads: Option<usize>,
}

impl Overrides {
    fn apply(&self, config: &mut Config) -> anyhow::Result<()> {
        if let Some(model_type) = &self.model_type {
            config.model.model_type = parse_model_type(model_type)?;
        }
        if let Some(k) = self.growth_rate {
            config.model.growth_rate = k;
        }
        if let Some(list) = &self.layer_num_list {
            config.model.layer_num_list = list.clone();
        }
        if let Some(dataset) = &self.dataset {
            config.data.dataset = dataset.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data.data_dir = dir.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.train.batch_size = batch_size;
        }
        if let Some(max_n_ep) = self.max_n_ep {
            config.train.max_n_ep = max_n_ep;
        }
        if let Some(variant) = &self.variant {
            config.self_construct.variant = variant.clone();
        }
        if let Some(lr_variant) = &self.lr_variant {
            config.self_construct.lr_variant = lr_variant.clone();
        }
        if let Some(block_count) = self.block_count {
            config.self_construct.block_count = block_count;
        }
        if self.no_self_construct {
            config.self_construct.enabled = false;
        }
        if self.save_model {
            config.logging.should_save_model = true;
        }
        if self.ft_logs {
            config.logging.should_save_ft_logs = true;
        }
        if let Some(seed) = self.seed {
            config.runtime.seed = seed;
        }
        if let Some(threads) = self.threads {
            config.runtime.threads = threads;
        }
        Ok(())
    }
}

fn parse_model_type(text: &str) -> anyhow::Result<ModelType> {
    match text {
        "DenseNet" => Ok(ModelType::DenseNet),
        "DenseNet-BC" => Ok(ModelType::DenseNetBC),
        other => bail!("unknown model type '{other}', expected DenseNet or DenseNet-BC"),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "densegrow=info,densegrow_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_dataset(config: &Config) -> anyhow::Result<InMemoryProvider> {
    let name = config.data.dataset.as_str();
    if name == "synthetic" {
        return data::synthetic(&config.data.synthetic, config.runtime.seed).context("building synthetic dataset");
    }
    let options = CifarOptions {
        normalisation: config.data.normalisation,
        validation_fraction: if config.train.validation_set { config.data.validation_fraction } else { 0.0 },
        shuffle: config.data.shuffle,
        seed: config.runtime.seed,
    };
    data::load_cifar(&config.data.data_dir, name, &options)
        .with_context(|| format!("loading {} from {}", name, config.data.data_dir.display()))
}

fn prepare(config_path: &Path, overrides: &Overrides) -> anyhow::Result<(Config, InMemoryProvider, Trainer)> {
    let mut config = Config::load(config_path);
    overrides.apply(&mut config)?;
    init_thread_pool(config.runtime.threads);

    let data = load_dataset(&config)?;
    info!(
        "Dataset {}: {:?}, {} classes",
        data.name(),
        data.data_shape().dims(),
        data.n_classes()
    );
    let trainer = Trainer::new(config.clone(), data.data_shape(), data.n_classes(), data.name())
        .context("building the initial network")?;
    Ok((config, data, trainer))
}

fn run_test(trainer: &mut Trainer, data: &mut InMemoryProvider, batch_size: usize) -> anyhow::Result<()> {
    let (loss, accuracy) = trainer.test(data.test(), batch_size).context("testing")?;
    info!("Testing: mean cross_entropy: {:.6}, mean accuracy: {:.6}", loss, accuracy);
    println!("test loss {loss:.6} accuracy {accuracy:.6}");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Command::InitConfig { path, force } => {
            let toml = Config::default().to_toml()?;
            if path.as_os_str() == "-" {
                println!("{toml}");
            } else {
                if path.exists() && !force {
                    bail!("{} already exists (use --force to overwrite)", path.display());
                }
                std::fs::write(&path, toml).with_context(|| format!("writing {}", path.display()))?;
                info!("Wrote default config to {}", path.display());
            }
        }
        Command::Train(overrides) => {
            let (config, mut data, mut trainer) = prepare(&cli.config, &overrides)?;
            let summary = trainer.train_all_epochs(&mut data).context("training")?;
            info!(
                "Finished after {} epochs, layers per block: {:?}, {} growth step(s)",
                summary.epochs,
                summary.layer_num_list,
                summary.events.len()
            );
            if config.logging.should_save_model {
                trainer.save_model().context("saving the final model")?;
            }
            run_test(&mut trainer, &mut data, config.train.batch_size)?;
        }
        Command::Test(overrides) => {
            let (config, mut data, mut trainer) = prepare(&cli.config, &overrides)?;
            let path = trainer.paths().checkpoint_file();
            trainer
                .load_model()
                .with_context(|| format!("loading model from {}", path.display()))?;
            run_test(&mut trainer, &mut data, config.train.batch_size)?;
        }
    }
    Ok(())
}
