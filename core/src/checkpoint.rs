//! JSON snapshots of a network's live variables.
//!
//! Variables are keyed by their deterministic names, so a snapshot taken
//! from a grown network can be restored into a fresh network built with the
//! final per-block layer counts.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GrowError, GrowResult};
use crate::model::Network;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedVariable {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub model_identifier: String,
    pub saved_at: DateTime<Utc>,
    pub layer_num_list: Vec<usize>,
    pub variables: BTreeMap<String, SavedVariable>,
}

impl Snapshot {
    /// Capture every live variable, running statistics included.
    pub fn capture(network: &Network, model_identifier: &str) -> GrowResult<Self> {
        let params = network.params();
        let mut variables = BTreeMap::new();
        for id in network.live_params()? {
            let param = params.get(id)?;
            let value = params.value(id)?;
            variables.insert(
                param.name.clone(),
                SavedVariable { shape: param.shape().to_vec(), values: value.iter().copied().collect() },
            );
        }
        Ok(Self {
            model_identifier: model_identifier.to_string(),
            saved_at: Utc::now(),
            layer_num_list: network.layer_num_list(),
            variables,
        })
    }
}

/// Write a snapshot of `network` to `path`, creating parent directories.
pub fn save(network: &Network, model_identifier: &str, path: &Path) -> GrowResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let snapshot = Snapshot::capture(network, model_identifier)?;
    fs::write(path, serde_json::to_string(&snapshot)?)?;
    Ok(())
}

/// Restore every live variable of `network` from `path`.
///
/// All variables are validated before any is assigned: a missing file, a
/// missing variable or a shape mismatch leaves the network untouched.
pub fn load(network: &mut Network, path: &Path) -> GrowResult<Snapshot> {
    let fail = |reason: String| GrowError::checkpoint(path, reason);
    let text = fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
    let snapshot: Snapshot = serde_json::from_str(&text).map_err(|e| fail(e.to_string()))?;

    let mut staged = Vec::new();
    for id in network.live_params()? {
        let param = network.params().get(id)?;
        let saved = snapshot
            .variables
            .get(&param.name)
            .ok_or_else(|| fail(format!("variable {} not found", param.name)))?;
        if saved.shape != param.shape() {
            return Err(fail(format!(
                "variable {} has shape {:?}, expected {:?}",
                param.name,
                saved.shape,
                param.shape()
            )));
        }
        let value = ArrayD::from_shape_vec(IxDyn(&saved.shape), saved.values.clone())
            .map_err(|e| fail(format!("variable {}: {e}", param.name)))?;
        staged.push((id, value));
    }
    for (id, value) in staged {
        network.params_mut().assign(id, value)?;
    }
    info!("Successfully loaded model from save path: {}", path.display());
    Ok(snapshot)
}
