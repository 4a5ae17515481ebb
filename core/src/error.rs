//! Error types for densegrow-core.
//!
//! Every fallible function returns `GrowResult<T>`. Numerical failures and
//! shape mismatches after a mutation are not caught anywhere in the crate;
//! they travel up to the training driver and end the run.

use std::path::PathBuf;

use thiserror::Error;

/// All possible error conditions in densegrow-core.
#[derive(Error, Debug)]
pub enum GrowError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("shape mismatch in {op}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("unknown node #{0}")]
    UnknownNode(usize),

    #[error("unknown parameter #{0}")]
    UnknownParam(usize),

    #[error("variable {0} used before initialization")]
    Uninitialized(String),

    #[error("node #{0} was not evaluated in this pass")]
    MissingValue(usize),

    #[error("empty batch")]
    EmptyBatch,

    #[error("training diverged: loss = {0}")]
    Diverged(f32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load model from save path {path}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    #[error("dataset error: {0}")]
    Data(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("toml error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("ndarray shape error: {0}")]
    Ndarray(#[from] ndarray::ShapeError),
}

pub type GrowResult<T> = Result<T, GrowError>;

impl GrowError {
    pub fn shape(op: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            op,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub fn checkpoint(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Checkpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
