//! Model/run identifiers and the output paths derived from them.
//!
//! ```text
//! <output_dir>/saves/<model_identifier>/model.chkpt.json
//! <output_dir>/logs/<run_identifier>/metrics.csv
//! <output_dir>/ft_logs/<run_identifier>.csv
//! ```
//!
//! The model identifier embeds the per-block layer counts, so it changes
//! whenever the network grows; [`RunPaths::refresh`] recomputes it. A path is
//! `Some` only while the matching output is enabled.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::config::LoggingConfig;
use crate::error::GrowResult;
use crate::model::ModelType;

pub const CHECKPOINT_FILE: &str = "model.chkpt.json";

pub fn model_identifier(model_type: ModelType, growth_rate: usize, layer_num_list: &[usize], dataset: &str) -> String {
    let layers: Vec<String> = layer_num_list.iter().map(usize::to_string).collect();
    format!(
        "{}_growth_rate={}_layer_num_list={}_dataset_{}",
        model_type,
        growth_rate,
        layers.join(","),
        dataset
    )
}

pub fn run_identifier(model_type: ModelType, growth_rate: usize, dataset: &str, started: DateTime<Local>) -> String {
    format!(
        "{}_{}_growth_rate={}_dataset_{}",
        model_type,
        started.format("%Y_%m_%d_%H%M%S"),
        growth_rate,
        dataset
    )
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    root: PathBuf,
    model_type: ModelType,
    growth_rate: usize,
    dataset: String,
    model_identifier: String,
    run_identifier: String,
    save_path: Option<PathBuf>,
    logs_path: Option<PathBuf>,
    ft_logs_path: Option<PathBuf>,
}

impl RunPaths {
    pub fn new(
        logging: &LoggingConfig,
        model_type: ModelType,
        growth_rate: usize,
        layer_num_list: &[usize],
        dataset: &str,
        started: DateTime<Local>,
    ) -> Self {
        let run_identifier = run_identifier(model_type, growth_rate, dataset, started);
        let root = logging.output_dir.clone();
        let logs_path = logging
            .should_save_logs
            .then(|| root.join("logs").join(&run_identifier));
        let ft_logs_path = logging
            .should_save_ft_logs
            .then(|| root.join("ft_logs").join(format!("{run_identifier}.csv")));
        let mut paths = Self {
            root,
            model_type,
            growth_rate,
            dataset: dataset.to_string(),
            model_identifier: String::new(),
            run_identifier,
            save_path: None,
            logs_path,
            ft_logs_path,
        };
        paths.refresh(layer_num_list, logging.should_save_model);
        paths
    }

    /// Recompute the model identifier (and save path) for new layer counts.
    pub fn refresh(&mut self, layer_num_list: &[usize], save_model: bool) {
        self.model_identifier = model_identifier(self.model_type, self.growth_rate, layer_num_list, &self.dataset);
        self.save_path = save_model.then(|| self.checkpoint_file());
    }

    pub fn model_identifier(&self) -> &str {
        &self.model_identifier
    }

    pub fn run_identifier(&self) -> &str {
        &self.run_identifier
    }

    /// Checkpoint location for the current model identifier, enabled or not.
    pub fn checkpoint_file(&self) -> PathBuf {
        self.root.join("saves").join(&self.model_identifier).join(CHECKPOINT_FILE)
    }

    pub fn save_path(&self) -> Option<&Path> {
        self.save_path.as_deref()
    }

    pub fn logs_path(&self) -> Option<&Path> {
        self.logs_path.as_deref()
    }

    pub fn ft_logs_path(&self) -> Option<&Path> {
        self.ft_logs_path.as_deref()
    }

    /// Create the logs directory, clearing it first when `renew`.
    pub fn prepare_logs(&self, renew: bool) -> GrowResult<()> {
        if let Some(dir) = &self.logs_path {
            if renew && dir.exists() {
                fs::remove_dir_all(dir)?;
            }
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
