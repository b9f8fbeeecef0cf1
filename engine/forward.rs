//! The calling contract between the engine and a survival model.
//!
//! The network itself is opaque. The engine builds a [`ModelInput`] from an
//! unpacked batch and reads back a [`ModelOutput`] holding hazard logits plus
//! the model's own auxiliary loss terms. Training goes through
//! [`SurvivalModel::forward`] and [`SurvivalModel::backward`]. Inference goes
//! through [`SurvivalModel::predict`], which only borrows the model immutably.

use crate::batch::{ClinicalRecord, OmicsInput, Targets, Tensor, UnpackedBatch};
use crate::optim::ParamStore;
use ndarray::{Array2, ArrayView1, ShapeError};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Arguments of one model invocation.
///
/// Tensors are moved in. Labels and censorship are borrowed from the batch
/// targets, which the engine keeps for the loss.
#[derive(Debug, Clone)]
pub struct ModelInput<'a> {
    pub wsi: Tensor,
    /// Attention maps are never requested by the training engine.
    pub return_attn: bool,
    /// Visible during training, `None` during inference.
    pub labels: Option<ArrayView1<'a, usize>>,
    /// Visible during training, `None` during inference.
    pub censorship: Option<ArrayView1<'a, f64>>,
    pub omics: OmicsInput,
}

/// Everything a model returns for one batch.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Hazard logits, shape `[samples, bins]`.
    pub logits: Array2<f64>,
    /// Information-bottleneck loss.
    pub ib_loss: f64,
    /// Proxy (prototype) auxiliary loss.
    pub proxy_loss: f64,
    /// First mutual-information regularizer.
    pub mi_loss: f64,
    /// Second mutual-information regularizer.
    pub mi_loss_aux: f64,
}

/// Upstream gradient of the normalized composite loss.
///
/// `logits` is d(loss)/d(logits). The weights are the coefficients with which
/// the model's own auxiliary terms enter the loss, so the model can
/// backpropagate them without the engine knowing how they were computed.
#[derive(Debug, Clone)]
pub struct LossGradient {
    pub logits: Array2<f64>,
    pub ib_weight: f64,
    pub proxy_weight: f64,
    pub mi_weight: f64,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model forward pass failed: {0}")]
    Forward(String),
    #[error("model backward pass failed: {0}")]
    Backward(String),
    #[error("backward was called without a preceding training forward pass")]
    NoForwardState,
    #[error("model returned {found} rows of logits for a batch of {expected} samples")]
    LogitRows { expected: usize, found: usize },
    #[error("model returned logits with no time bins")]
    NoTimeBins,
    #[error("tensor shape error inside the model: {0}")]
    Shape(#[from] ShapeError),
}

/// A multi-modal survival network.
pub trait SurvivalModel {
    /// Training forward pass; may record state needed by `backward`.
    fn forward(&mut self, input: ModelInput<'_>) -> Result<ModelOutput, ModelError>;

    /// Inference forward pass. Parameters cannot change here.
    fn predict(&self, input: ModelInput<'_>) -> Result<ModelOutput, ModelError>;

    /// Accumulates parameter gradients for the last `forward` call.
    fn backward(&mut self, gradient: &LossGradient) -> Result<(), ModelError>;

    fn params(&self) -> &ParamStore;

    fn params_mut(&mut self) -> &mut ParamStore;
}

/// Modality removed at inference time to measure robustness without retraining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum MissingModality {
    /// "P": the whole-slide features are zeroed.
    Pathology,
    /// "G": every omics tensor is zeroed.
    Genomics,
}

impl fmt::Display for MissingModality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pathology => "P",
            Self::Genomics => "G",
        })
    }
}

#[derive(Debug, Error)]
#[error("unknown missing-modality tag '{0}', expected 'P' or 'G'")]
pub struct ModalityParseError(pub String);

impl FromStr for MissingModality {
    type Err = ModalityParseError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "P" => Ok(Self::Pathology),
            "G" => Ok(Self::Genomics),
            other => Err(ModalityParseError(other.to_string())),
        }
    }
}

impl TryFrom<String> for MissingModality {
    type Error = ModalityParseError;

    fn try_from(tag: String) -> Result<Self, Self::Error> {
        tag.parse()
    }
}

/// Result of one forward call together with the batch data that stays on the
/// engine side.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    pub output: ModelOutput,
    pub targets: Targets,
    pub clinical: Vec<ClinicalRecord>,
}

/// Zeroes the requested modality in place.
pub fn apply_ablation(missing: Option<MissingModality>, wsi: &mut Tensor, omics: &mut OmicsInput) {
    match missing {
        Some(MissingModality::Pathology) => wsi.fill(0.0),
        Some(MissingModality::Genomics) => omics.zero_fill(),
        None => {}
    }
}

/// Runs a training forward pass with labels and censorship visible to the model.
pub fn forward_training<M>(model: &mut M, batch: UnpackedBatch) -> Result<ForwardPass, ModelError>
where
    M: SurvivalModel + ?Sized,
{
    let UnpackedBatch {
        wsi,
        targets,
        omics,
        clinical,
        ..
    } = batch;
    let input = ModelInput {
        wsi,
        return_attn: false,
        labels: Some(targets.labels.view()),
        censorship: Some(targets.censorship.view()),
        omics,
    };
    let output = model.forward(input)?;
    check_logits(&output, targets.len())?;
    Ok(ForwardPass {
        output,
        targets,
        clinical,
    })
}

/// Runs an inference pass with labels hidden, optionally ablating a modality.
pub fn forward_inference<M>(
    model: &M,
    batch: UnpackedBatch,
    missing: Option<MissingModality>,
) -> Result<ForwardPass, ModelError>
where
    M: SurvivalModel + ?Sized,
{
    let UnpackedBatch {
        mut wsi,
        targets,
        mut omics,
        clinical,
        ..
    } = batch;
    apply_ablation(missing, &mut wsi, &mut omics);
    let input = ModelInput {
        wsi,
        return_attn: false,
        labels: None,
        censorship: None,
        omics,
    };
    let output = model.predict(input)?;
    check_logits(&output, targets.len())?;
    Ok(ForwardPass {
        output,
        targets,
        clinical,
    })
}

fn check_logits(output: &ModelOutput, samples: usize) -> Result<(), ModelError> {
    if output.logits.nrows() != samples {
        return Err(ModelError::LogitRows {
            expected: samples,
            found: output.logits.nrows(),
        });
    }
    if output.logits.ncols() == 0 {
        return Err(ModelError::NoTimeBins);
    }
    Ok(())
}
