use crate::metrics::MetricSummary;
use log::info;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Which model a post-training evaluation refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FoldStage {
    /// Parameters after the last epoch.
    Final,
    /// Parameters reloaded from the best checkpoint.
    Best,
}

impl FoldStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Final => "Final",
            Self::Best => "Best",
        }
    }
}

impl fmt::Display for FoldStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

pub fn batch_line(batch: usize, loss: f64) -> String {
    format!("batch: {batch}, loss: {loss:.3}")
}

pub fn epoch_line(epoch: usize, train_loss: f64, c_index: f64) -> String {
    format!("Epoch: {epoch}, train_loss: {train_loss:.4}, train_c_index: {c_index:.4}")
}

pub fn validation_line(epoch: usize, metrics: &MetricSummary) -> String {
    format!(
        "Epoch:{epoch} Val c-index: {:.4} | Final Val c-index2: {:.4} | Final Val IBS: {:.4} | Final Val iauc: {:.4}",
        metrics.c_index, metrics.c_index_ipcw, metrics.integrated_brier, metrics.auc
    )
}

pub fn fold_end_line(stage: FoldStage, metrics: &MetricSummary) -> String {
    format!(
        "{stage} Val c-index: {:.4} | {stage} Val c-index2: {:.4} | {stage} Val IBS: {:.4} | {stage} Val iauc: {:.4}",
        metrics.c_index, metrics.c_index_ipcw, metrics.integrated_brier, metrics.auc
    )
}

/// Observer for training progress. Every method defaults to a no-op.
pub trait TrainingProgress {
    /// `loss` is the batch-size-normalized composite loss.
    fn on_batch(&mut self, batch: usize, loss: f64) -> io::Result<()> {
        let _ = (batch, loss);
        Ok(())
    }
    fn on_epoch(&mut self, epoch: usize, train_loss: f64, c_index: f64) -> io::Result<()> {
        let _ = (epoch, train_loss, c_index);
        Ok(())
    }
    fn on_validation(&mut self, epoch: usize, metrics: &MetricSummary) -> io::Result<()> {
        let _ = (epoch, metrics);
        Ok(())
    }
    fn on_fold_end(&mut self, stage: FoldStage, metrics: &MetricSummary) -> io::Result<()> {
        let _ = (stage, metrics);
        Ok(())
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl TrainingProgress for NoopProgress {}

/// Appends every progress line to a plain-text log and mirrors it to `log`.
pub struct LogFileProgress {
    file: File,
}

impl LogFileProgress {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    fn write_line(&mut self, line: String) -> io::Result<()> {
        info!("{line}");
        writeln!(self.file, "{line}")
    }
}

impl TrainingProgress for LogFileProgress {
    fn on_batch(&mut self, batch: usize, loss: f64) -> io::Result<()> {
        self.write_line(batch_line(batch, loss))
    }

    fn on_epoch(&mut self, epoch: usize, train_loss: f64, c_index: f64) -> io::Result<()> {
        self.write_line(epoch_line(epoch, train_loss, c_index))
    }

    fn on_validation(&mut self, epoch: usize, metrics: &MetricSummary) -> io::Result<()> {
        self.write_line(validation_line(epoch, metrics))
    }

    fn on_fold_end(&mut self, stage: FoldStage, metrics: &MetricSummary) -> io::Result<()> {
        self.write_line(fold_end_line(stage, metrics))
    }
}
