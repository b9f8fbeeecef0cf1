use crate::batch::{BatchError, ClinicalRecord, OmicsFormat, Targets, unpack};
use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::data::{DataError, SurvivalLoader};
use crate::forward::{LossGradient, ModelError, ModelOutput, SurvivalModel, forward_training};
use crate::loss::{LossError, SurvivalLoss};
use crate::metrics::{MetricError, concordance_index_censored, survival::event_indicator};
use crate::optim::{OptimError, Optimizer};
use crate::progress::TrainingProgress;
use crate::risk::calculate_risk;
use log::debug;
use ndarray::{Array1, Array2, ShapeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Loss error: {0}")]
    Loss(#[from] LossError),
    #[error("Optimizer error: {0}")]
    Optim(#[from] OptimError),
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not assemble per-sample outputs: {0}")]
    Shape(#[from] ShapeError),
    #[error("batch outputs are misaligned: {risk} risks, {targets} targets, {clinical} clinical records")]
    Misaligned {
        risk: usize,
        targets: usize,
        clinical: usize,
    },
    #[error("the loader yielded no samples")]
    EmptyLoader,
    #[error("the loader yielded more samples than its metadata lists ({0})")]
    MetadataExhausted(usize),
    #[error("fold {0} never reached the minimum validation c-index, no best checkpoint was saved")]
    NoBestCheckpoint(usize),
}

/// Per-sample values accumulated over one pass of a loader.
#[derive(Debug, Default, Clone)]
pub struct RunningArrays {
    pub risk: Vec<f64>,
    pub censorship: Vec<f64>,
    pub event_time: Vec<f64>,
    pub clinical: Vec<ClinicalRecord>,
}

impl RunningArrays {
    pub fn extend(
        &mut self,
        risk: &Array1<f64>,
        targets: &Targets,
        clinical: Vec<ClinicalRecord>,
    ) -> Result<(), TrainingError> {
        if risk.len() != targets.len() || clinical.len() != targets.len() {
            return Err(TrainingError::Misaligned {
                risk: risk.len(),
                targets: targets.len(),
                clinical: clinical.len(),
            });
        }
        self.risk.extend(risk.iter().copied());
        self.censorship.extend(targets.censorship.iter().copied());
        self.event_time.extend(targets.event_time.iter().copied());
        self.clinical.extend(clinical);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.risk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.risk.is_empty()
    }
}

/// Weights of the auxiliary terms in the composite objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeights {
    pub gamma: f64,
    pub sigma: f64,
}

impl LossWeights {
    /// `surv + gamma * proxy + ib + sigma * (mi + mi_aux)`
    pub fn combine(&self, survival_loss: f64, output: &ModelOutput) -> f64 {
        survival_loss
            + self.gamma * output.proxy_loss
            + output.ib_loss
            + self.sigma * (output.mi_loss + output.mi_loss_aux)
    }

    /// Gradient of `combine(..) / batch_size`.
    pub fn gradient(&self, grad_logits: Array2<f64>, batch_size: usize) -> LossGradient {
        let scale = 1.0 / batch_size as f64;
        LossGradient {
            logits: grad_logits * scale,
            ib_weight: scale,
            proxy_weight: self.gamma * scale,
            mi_weight: self.sigma * scale,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Sum of unnormalized batch losses divided by the number of samples.
    pub train_loss: f64,
    pub c_index: f64,
}

/// Runs one training epoch over `loader`, stepping `optimizer` after every batch.
#[allow(clippy::too_many_arguments)]
pub fn train_loop_survival<M, L, F, O, P>(
    epoch: usize,
    model: &mut M,
    format: OmicsFormat,
    loader: &L,
    optimizer: &mut O,
    loss_fn: &F,
    weights: LossWeights,
    progress: &mut P,
) -> Result<EpochSummary, TrainingError>
where
    M: SurvivalModel + ?Sized,
    L: SurvivalLoader + ?Sized,
    F: SurvivalLoss + ?Sized,
    O: Optimizer + ?Sized,
    P: TrainingProgress + ?Sized,
{
    let mut total_loss = 0.0;
    let mut running = RunningArrays::default();

    for (batch_idx, batch) in loader.batches().enumerate() {
        let unpacked = unpack(format, batch?)?;
        let batch_size = unpacked.len();
        let pass = forward_training(model, unpacked)?;

        let surv = loss_fn.evaluate(pass.output.logits.view(), &pass.targets)?;
        let loss_value = weights.combine(surv.value, &pass.output);
        let normalized = loss_value / batch_size as f64;

        let risk = calculate_risk(pass.output.logits.view()).risk;
        running.extend(&risk, &pass.targets, pass.clinical)?;
        total_loss += loss_value;

        model.backward(&weights.gradient(surv.grad_logits, batch_size))?;
        optimizer.step(model.params_mut())?;
        model.params_mut().zero_grad();

        progress.on_batch(batch_idx, normalized)?;
    }

    if loader.is_empty() || running.is_empty() {
        return Err(TrainingError::EmptyLoader);
    }
    let train_loss = total_loss / loader.len() as f64;
    let censorship = Array1::from(running.censorship);
    let concordance = concordance_index_censored(
        event_indicator(censorship.view()).view(),
        Array1::from(running.event_time).view(),
        Array1::from(running.risk).view(),
    )?;
    debug!(
        "epoch {epoch}: {} concordant, {} discordant, {} tied risk pairs",
        concordance.concordant, concordance.discordant, concordance.tied_risk
    );

    progress.on_epoch(epoch, train_loss, concordance.c_index)?;
    Ok(EpochSummary {
        epoch,
        train_loss,
        c_index: concordance.c_index,
    })
}
