//! Metric and feature logs.
//!
//! [`MetricLog`] is a plain CSV of scalar summaries. [`FeatureLog`] writes
//! one row per measured epoch: accuracy, loss and, for every layer of every
//! block, the layer CS scores with the normalised CS of each connection.
//! Every field is quoted and decimal points are replaced by the configured
//! decimal separator.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use crate::error::GrowResult;
use crate::strength::BlockStrength;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PerBatch,
    Train,
    Valid,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::PerBatch => write!(f, "per_batch"),
            Phase::Train => write!(f, "train"),
            Phase::Valid => write!(f, "valid"),
        }
    }
}

/// `phase,step,loss,accuracy` rows.
pub struct MetricLog {
    writer: BufWriter<File>,
}

impl MetricLog {
    pub const FILE_NAME: &'static str = "metrics.csv";

    /// Create `dir/metrics.csv`, creating `dir` if needed.
    pub fn create(dir: &Path) -> GrowResult<Self> {
        fs::create_dir_all(dir)?;
        let mut writer = BufWriter::new(File::create(dir.join(Self::FILE_NAME))?);
        writeln!(writer, "phase,step,loss,accuracy")?;
        Ok(Self { writer })
    }

    pub fn record(&mut self, phase: Phase, step: usize, loss: f32, accuracy: f32) -> GrowResult<()> {
        writeln!(self.writer, "{phase},{step},{loss},{accuracy}")?;
        Ok(())
    }

    pub fn flush(&mut self) -> GrowResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Separator-aware writer for the feature log.
pub struct FeatureLog<W: Write> {
    writer: W,
    comma: String,
    decimal: String,
}

impl FeatureLog<BufWriter<File>> {
    pub fn create(path: &Path, comma: &str, decimal: &str) -> GrowResult<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(Self::new(BufWriter::new(File::create(path)?), comma, decimal))
    }
}

impl<W: Write> FeatureLog<W> {
    pub fn new(writer: W, comma: &str, decimal: &str) -> Self {
        Self { writer, comma: comma.to_string(), decimal: decimal.to_string() }
    }

    fn number(&self, value: f32) -> String {
        format!("\"{value:.6}\"").replace('.', &self.decimal)
    }

    /// One complete row for `epoch`.
    pub fn write_epoch(&mut self, epoch: usize, accuracy: f32, loss: f32, blocks: &[BlockStrength]) -> GrowResult<()> {
        let c = &self.comma;
        let mut row = format!("\"Epoch {epoch}\"{c}{}{c}{}{c}\"\"", self.number(accuracy), self.number(loss));
        for block in blocks {
            for l in 0..block.layers() {
                row.push_str(&format!("{c}{}{c}\"\"", self.number(block.lcs_dst.get(l).copied().unwrap_or(0.0))));
                for v in block.normalised_emission(l) {
                    row.push_str(&format!("{c}{}", self.number(v)));
                }
                row.push_str(&format!("{c}\"\""));
                for v in block.normalised_reception(l) {
                    row.push_str(&format!("{c}{}", self.number(v)));
                }
                row.push_str(&format!("{c}\"\"{c}{}", self.number(block.lcs_src.get(l).copied().unwrap_or(0.0))));
            }
        }
        writeln!(self.writer, "{row}")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_total_time(&mut self, total: Duration) -> GrowResult<()> {
        writeln!(self.writer, "\nTOTAL TRAINING TIME: {}", format_duration(total))?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// `H:MM:SS.ffffff`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}.{:06}", secs / 3600, (secs / 60) % 60, secs % 60, d.subsec_micros())
}

/// Time left for `budget` epochs when `elapsed` of them are done.
pub fn estimate_remaining(per_epoch: Duration, budget: usize, elapsed: usize) -> Duration {
    per_epoch.mul_f64(budget.saturating_sub(elapsed) as f64)
}
