//! One cross-validation fold: repeated train/validate epochs with best-epoch
//! checkpointing, followed by a final and a best-checkpoint evaluation.

use crate::checkpoint::{
    ArtifactLayout, load_state_dict, save_results, save_splits, save_state_dict,
};
use crate::config::TrainingConfig;
use crate::data::{SurvivalLoader, survival_distribution};
use crate::evaluate::{EvaluationReport, PatientResults, summary};
use crate::forward::{ModelError, SurvivalModel};
use crate::loss::{LossFunction, SurvivalLoss};
use crate::metrics::MetricSummary;
use crate::optim::{AnyOptimizer, Optimizer};
use crate::progress::{FoldStage, TrainingProgress};
use crate::train::{LossWeights, TrainingError, train_loop_survival};
use log::info;
use ndarray::Array1;

/// Highest validation c-index seen so far and the epoch that reached it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestEpoch {
    pub c_index: f64,
    pub epoch: Option<usize>,
}

impl BestEpoch {
    pub fn new(min_c_index: f64) -> Self {
        Self {
            c_index: min_c_index,
            epoch: None,
        }
    }

    /// Records `epoch` if `c_index` ties or beats the current best.
    pub fn observe(&mut self, epoch: usize, c_index: f64) -> bool {
        if c_index >= self.c_index {
            self.c_index = c_index;
            self.epoch = Some(epoch);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FoldOutcome {
    /// Patient results of the best validation epoch.
    pub best_results: PatientResults,
    /// Patient results of the parameters after the last epoch.
    pub final_results: PatientResults,
    pub best_epoch: usize,
    pub best_c_index: f64,
    /// The remaining fields describe the best-checkpoint evaluation.
    pub c_index_ipcw: f64,
    pub brier: Array1<f64>,
    pub integrated_brier: f64,
    pub auc: f64,
    pub mean_loss: f64,
}

/// Trains for `config.max_epochs` epochs, checkpointing the best validation epoch.
#[allow(clippy::too_many_arguments)]
pub fn step<M, L, F, O, P>(
    fold: usize,
    model: &mut M,
    train_loader: &L,
    val_loader: &L,
    optimizer: &mut O,
    loss_fn: &F,
    config: &TrainingConfig,
    progress: &mut P,
) -> Result<FoldOutcome, TrainingError>
where
    M: SurvivalModel + ?Sized,
    L: SurvivalLoader + ?Sized,
    F: SurvivalLoss + ?Sized,
    O: Optimizer + ?Sized,
    P: TrainingProgress + ?Sized,
{
    let layout = ArtifactLayout::new(&config.results_dir);
    let survival_train = survival_distribution(train_loader.metadata(), val_loader.metadata())?;
    let weights = LossWeights {
        gamma: config.gamma,
        sigma: config.sigma,
    };
    let format = config.omics_format;
    let mut best = BestEpoch::new(config.min_c_index);

    for epoch in 0..config.max_epochs {
        train_loop_survival(
            epoch,
            model,
            format,
            train_loader,
            optimizer,
            loss_fn,
            weights,
            progress,
        )?;
        let report = summary(
            &*model,
            format,
            val_loader,
            loss_fn,
            &survival_train,
            config.missing_modality,
        )?;
        let metrics = report.metrics.summary();
        progress.on_validation(epoch, &metrics)?;

        if best.observe(epoch, metrics.c_index) {
            info!(
                "fold {fold}: new best validation c-index {:.4} at epoch {epoch}",
                metrics.c_index
            );
            save_state_dict(&layout.best_checkpoint(fold), &model.params().state_dict())?;
            save_results(&layout.results(fold), &report.patient_results)?;
        }
    }

    save_state_dict(&layout.final_checkpoint(fold), &model.params().state_dict())?;
    let final_report = summary(&*model, format, val_loader, loss_fn, &survival_train, None)?;
    progress.on_fold_end(FoldStage::Final, &final_report.metrics.summary())?;

    let best_epoch = best.epoch.ok_or(TrainingError::NoBestCheckpoint(fold))?;
    let state = load_state_dict(&layout.best_checkpoint(fold))?;
    model.params_mut().load_state_dict(&state)?;
    let best_report = summary(&*model, format, val_loader, loss_fn, &survival_train, None)?;
    let best_metrics = best_report.metrics.summary();
    progress.on_fold_end(FoldStage::Best, &best_metrics)?;

    Ok(outcome(best, best_epoch, best_report, best_metrics, final_report))
}

fn outcome(
    best: BestEpoch,
    best_epoch: usize,
    best_report: EvaluationReport,
    metrics: MetricSummary,
    final_report: EvaluationReport,
) -> FoldOutcome {
    FoldOutcome {
        best_results: best_report.patient_results,
        final_results: final_report.patient_results,
        best_epoch,
        best_c_index: best.c_index,
        c_index_ipcw: metrics.c_index_ipcw,
        brier: metrics.brier,
        integrated_brier: metrics.integrated_brier,
        auc: metrics.auc,
        mean_loss: best_report.mean_loss,
    }
}

/// Runs fold `fold` end to end.
///
/// Writes the split listing, builds the loss and optimizer from `config`,
/// and asks `build_model` for a model given the omics input width.
pub fn train_val<M, L, B, P>(
    train_loader: &L,
    val_loader: &L,
    fold: usize,
    config: &TrainingConfig,
    build_model: B,
    progress: &mut P,
) -> Result<FoldOutcome, TrainingError>
where
    M: SurvivalModel,
    L: SurvivalLoader + ?Sized,
    B: FnOnce(usize) -> Result<M, ModelError>,
    P: TrainingProgress + ?Sized,
{
    config.validate()?;
    info!("Training fold {fold}");
    let layout = ArtifactLayout::new(&config.results_dir);
    save_splits(
        &layout.splits(fold),
        &train_loader.metadata().slide_ids,
        &val_loader.metadata().slide_ids,
    )?;
    info!(
        "Training on {} samples, validating on {} samples",
        train_loader.len(),
        val_loader.len()
    );

    let loss_fn = LossFunction::from_kind(config.loss, config.alpha_surv);
    let mut model = build_model(config.omics_input_dim())?;
    let mut optimizer = AnyOptimizer::from_config(config.optimizer, config.lr, config.reg);
    info!(
        "Using {} loss, {} optimizer, {} parameter tensors",
        config.loss,
        config.optimizer,
        model.params().len()
    );

    step(
        fold,
        &mut model,
        train_loader,
        val_loader,
        &mut optimizer,
        &loss_fn,
        config,
        progress,
    )
}
